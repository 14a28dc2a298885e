use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::types::{Credentials, Settings, TargetCandidate};

/// Process-level configuration read from environment variables
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Listen port of the HTTP API
    pub port: u16,
    /// Listen address
    pub bind: String,
    /// JSON config file (targets, credentials, settings, discovery)
    pub config_path: PathBuf,
    /// JSON-lines access log, overrides the file setting
    pub access_log_path: Option<String>,
    /// Comma-separated target list, overrides the file setting
    pub targets: Option<Vec<String>>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            bind: "0.0.0.0".to_string(),
            config_path: PathBuf::from("/var/lib/devtunnel/config.json"),
            access_log_path: None,
            targets: None,
            username: None,
            password: None,
        }
    }
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("DEVTUNNEL_PORT") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Some(v) = lookup("DEVTUNNEL_BIND") {
            config.bind = v;
        }
        if let Some(v) = lookup("DEVTUNNEL_CONFIG_PATH") {
            config.config_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DEVTUNNEL_ACCESS_LOG") {
            config.access_log_path = Some(v);
        }
        if let Some(v) = lookup("DEVTUNNEL_TARGETS") {
            let targets: Vec<String> = v
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            config.targets = Some(targets);
        }
        if let Some(v) = lookup("DEVTUNNEL_USERNAME") {
            config.username = Some(v);
        }
        if let Some(v) = lookup("DEVTUNNEL_PASSWORD") {
            config.password = Some(v);
        }

        config
    }

    /// Load a `.env` file (explicit, or `./.env` if present), then the environment
    pub fn load(env_file: Option<&Path>) -> Self {
        match env_file {
            Some(path) => load_dotenv(path),
            None => {
                let candidate = PathBuf::from(".env");
                if candidate.exists() {
                    load_dotenv(&candidate);
                }
            }
        }

        Self::from_env()
    }

    /// Apply the environment overrides on top of a file config
    pub fn override_config(&self, config: &mut TunnelConfig) {
        if let Some(targets) = &self.targets {
            config.targets = targets.clone();
        }
        if let Some(username) = &self.username {
            config.credentials.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.credentials.password = password.clone();
        }
        if self.access_log_path.is_some() {
            config.access_log_path = self.access_log_path.clone();
        }
    }
}

/// Basic `.env` loader (KEY=VALUE per line). Existing variables win.
fn load_dotenv(path: &Path) {
    if let Ok(content) = std::fs::read_to_string(path) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if std::env::var(key).is_err() {
                    // SAFETY: only called during startup, before anything else reads the environment
                    unsafe { std::env::set_var(key, value) };
                }
            }
        }
    }
}

/// Address space walked by a discovery scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Network prefixes, e.g. "192.168.1"
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,

    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Last-octet values appended to each prefix
    #[serde(default = "default_hosts")]
    pub hosts: Vec<u8>,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Probes in flight at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Log progress every N candidates
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Upper bound on prefixes × ports × hosts for one scan
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
}

fn default_prefixes() -> Vec<String> {
    vec!["192.168.1".to_string(), "192.168.0".to_string(), "10.0.0".to_string()]
}
fn default_ports() -> Vec<u16> { vec![8080, 2121, 8888, 9090] }
fn default_hosts() -> Vec<u8> {
    let mut hosts: Vec<u8> = vec![2, 3, 4, 5, 10, 20, 50];
    hosts.extend(100..=110);
    hosts.extend([150, 200]);
    hosts
}
fn default_scheme() -> String { "http".to_string() }
fn default_batch_size() -> usize { 20 }
fn default_progress_every() -> usize { 50 }
fn default_max_candidates() -> usize { 4096 }

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            prefixes: default_prefixes(),
            ports: default_ports(),
            hosts: default_hosts(),
            scheme: default_scheme(),
            batch_size: default_batch_size(),
            progress_every: default_progress_every(),
            max_candidates: default_max_candidates(),
        }
    }
}

impl DiscoveryConfig {
    /// Number of candidates the scan will generate, `None` on overflow
    pub fn candidate_count(&self) -> Option<usize> {
        self.prefixes
            .len()
            .checked_mul(self.ports.len())?
            .checked_mul(self.hosts.len())
    }

    /// Reject scans larger than `max_candidates`.
    pub fn check_size(&self) -> Result<usize, AppError> {
        match self.candidate_count() {
            Some(count) if count <= self.max_candidates => Ok(count),
            _ => Err(AppError::MalformedInput(format!(
                "scan of {} prefixes x {} ports x {} hosts exceeds the limit of {} candidates",
                self.prefixes.len(),
                self.ports.len(),
                self.hosts.len(),
                self.max_candidates
            ))),
        }
    }
}

/// Service configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Candidate base URLs, in preference order
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default)]
    pub credentials: Credentials,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// JSON-lines access log (optional)
    #[serde(default)]
    pub access_log_path: Option<String>,
}

impl TunnelConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TunnelConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Parsed candidates; blank entries are skipped with a warning.
    pub fn target_candidates(&self) -> Vec<TargetCandidate> {
        self.targets
            .iter()
            .filter_map(|t| match TargetCandidate::new(t.as_str()) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::warn!("Skipping configured target {:?}: {}", t, e);
                    None
                }
            })
            .collect()
    }
}
