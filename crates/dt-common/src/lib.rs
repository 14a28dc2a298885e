pub mod config;
pub mod error;
pub mod registry;
pub mod types;

pub use config::{DiscoveryConfig, EnvConfig, TunnelConfig};
pub use error::AppError;
pub use registry::{Registry, RegistrySnapshot, RegistryUpdate};
pub use types::{Credentials, CredentialsPatch, Settings, SettingsPatch, TargetCandidate};
