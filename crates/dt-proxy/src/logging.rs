use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// One forwarded request, written as a JSON line
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    /// Device target the request went to, absent when none was resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub status: u16,
    pub duration_ms: u64,
    pub user_agent: String,
}

/// Appends entries to a file from a background task
#[derive(Clone)]
pub struct AccessLogger {
    sender: mpsc::UnboundedSender<AccessLogEntry>,
}

impl AccessLogger {
    pub fn start(log_path: PathBuf) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<AccessLogEntry>();

        tokio::spawn(async move {
            if let Some(parent) = log_path.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    error!("Failed to create access log directory {:?}: {}", parent, e);
                }
            }

            let mut file = match OpenOptions::new().create(true).append(true).open(&log_path).await {
                Ok(f) => f,
                Err(e) => {
                    error!("Failed to open access log file {:?}: {}", log_path, e);
                    return;
                }
            };

            info!("Access logging to {:?}", log_path);

            while let Some(entry) = receiver.recv().await {
                let mut line = match serde_json::to_string(&entry) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize access log entry: {}", e);
                        continue;
                    }
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!("Failed to write access log: {}", e);
                }
            }
        });

        Self { sender }
    }

    /// Non-blocking; entries are dropped once the writer task is gone.
    pub fn log(&self, entry: AccessLogEntry) {
        let _ = self.sender.send(entry);
    }
}

/// Access logger that may be switched off
#[derive(Clone, Default)]
pub struct OptionalAccessLogger {
    inner: Option<AccessLogger>,
}

impl OptionalAccessLogger {
    pub fn new(log_path: Option<&Path>) -> Self {
        Self {
            inner: log_path.map(|p| AccessLogger::start(p.to_path_buf())),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn log(&self, entry: AccessLogEntry) {
        if let Some(logger) = &self.inner {
            logger.log(entry);
        }
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}
