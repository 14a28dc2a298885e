use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required field is missing or empty (surfaced as a 400).
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable category, used in HTTP error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::MalformedInput(_) => "malformed-input",
            AppError::Config(_) => "config",
            AppError::Io(_) | AppError::Serialization(_) | AppError::Other(_) => "internal",
        }
    }
}
