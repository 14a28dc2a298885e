use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::AppError;

/// Base URL (`scheme://host:port`) believed to host the device server.
///
/// Equality is by exact string. Only emptiness is rejected here; a malformed
/// URL surfaces later as a probe failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetCandidate(String);

impl TargetCandidate {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AppError> {
        let base_url = base_url.into();
        if base_url.trim().is_empty() {
            return Err(AppError::MalformedInput("target must be a non-empty URL".to_string()));
        }
        Ok(Self(base_url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TargetCandidate {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TargetCandidate> for String {
    fn from(value: TargetCandidate) -> Self {
        value.0
    }
}

impl fmt::Display for TargetCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Static basic-auth credentials sent to the device server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Authorization` header value: `Basic base64(username:password)`
    pub fn basic_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::new("android", "android")
    }
}

// Never print the password in logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsPatch {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Tunable timeouts and intervals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Forward request timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Health probe timeout (resolver and status reporter)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Per-candidate timeout during a discovery scan
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,

    /// Freshness window of the cached active target
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default)]
    pub auto_discovery: bool,
}

fn default_timeout_ms() -> u64 { 10_000 }
fn default_probe_timeout_ms() -> u64 { 5_000 }
fn default_discovery_timeout_ms() -> u64 { 3_000 }
fn default_check_interval_ms() -> u64 { 30_000 }

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
            auto_discovery: false,
        }
    }
}

impl Settings {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub probe_timeout_ms: Option<u64>,
    #[serde(default)]
    pub discovery_timeout_ms: Option<u64>,
    #[serde(default)]
    pub check_interval_ms: Option<u64>,
    #[serde(default)]
    pub auto_discovery: Option<bool>,
}
