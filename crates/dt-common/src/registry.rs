use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::types::{Credentials, CredentialsPatch, Settings, SettingsPatch, TargetCandidate};

struct RegistryState {
    targets: Vec<TargetCandidate>,
    credentials: Credentials,
    settings: Settings,
    active_target: Option<TargetCandidate>,
    last_update: DateTime<Utc>,
}

impl RegistryState {
    fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    fn replace_targets(&mut self, targets: Vec<TargetCandidate>) {
        self.targets = dedup_ordered(targets);
    }

    fn merge_credentials(&mut self, patch: CredentialsPatch) {
        if let Some(username) = patch.username {
            self.credentials.username = username;
        }
        if let Some(password) = patch.password {
            self.credentials.password = password;
        }
    }

    fn merge_settings(&mut self, patch: SettingsPatch) {
        let s = &mut self.settings;
        if let Some(v) = patch.timeout_ms {
            s.timeout_ms = v;
        }
        if let Some(v) = patch.probe_timeout_ms {
            s.probe_timeout_ms = v;
        }
        if let Some(v) = patch.discovery_timeout_ms {
            s.discovery_timeout_ms = v;
        }
        if let Some(v) = patch.check_interval_ms {
            s.check_interval_ms = v;
        }
        if let Some(v) = patch.auto_discovery {
            s.auto_discovery = v;
        }
    }
}

/// Candidate targets, credentials and settings shared by every component.
///
/// One instance per process, handed out behind an `Arc`. Only the explicit
/// operations below mutate it; probing never does.
pub struct Registry {
    state: RwLock<RegistryState>,
}

/// Serializable view returned by the registry endpoint. The password is
/// never echoed back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub targets: Vec<TargetCandidate>,
    pub username: String,
    pub settings: Settings,
    pub active_target: Option<TargetCandidate>,
    pub last_update: DateTime<Utc>,
}

/// Partial update merged by [`Registry::apply`]. Absent fields keep their
/// previous value; `activeTarget: null` clears the pin.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryUpdate {
    #[serde(default)]
    pub targets: Option<Vec<TargetCandidate>>,
    #[serde(default)]
    pub credentials: Option<CredentialsPatch>,
    #[serde(default)]
    pub settings: Option<SettingsPatch>,
    #[serde(default, deserialize_with = "double_option")]
    pub active_target: Option<Option<TargetCandidate>>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Collapse duplicates, keeping the first occurrence and its position.
fn dedup_ordered(targets: Vec<TargetCandidate>) -> Vec<TargetCandidate> {
    let mut out: Vec<TargetCandidate> = Vec::with_capacity(targets.len());
    for t in targets {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

impl Registry {
    pub fn new(targets: Vec<TargetCandidate>, credentials: Credentials, settings: Settings) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                targets: dedup_ordered(targets),
                credentials,
                settings,
                active_target: None,
                last_update: Utc::now(),
            }),
        }
    }

    pub async fn list(&self) -> Vec<TargetCandidate> {
        self.state.read().await.targets.clone()
    }

    pub async fn credentials(&self) -> Credentials {
        self.state.read().await.credentials.clone()
    }

    pub async fn settings(&self) -> Settings {
        self.state.read().await.settings.clone()
    }

    pub async fn active(&self) -> Option<TargetCandidate> {
        self.state.read().await.active_target.clone()
    }

    pub async fn last_update(&self) -> DateTime<Utc> {
        self.state.read().await.last_update
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let s = self.state.read().await;
        RegistrySnapshot {
            targets: s.targets.clone(),
            username: s.credentials.username.clone(),
            settings: s.settings.clone(),
            active_target: s.active_target.clone(),
            last_update: s.last_update,
        }
    }

    pub async fn replace_all(&self, targets: Vec<TargetCandidate>) {
        let mut s = self.state.write().await;
        s.replace_targets(targets);
        s.touch();
        info!(count = s.targets.len(), "Registry targets replaced");
    }

    /// Append a candidate. Returns false (and changes nothing but the update
    /// stamp) when the exact same URL is already registered.
    pub async fn add(&self, candidate: TargetCandidate) -> bool {
        let mut s = self.state.write().await;
        s.touch();
        if s.targets.contains(&candidate) {
            debug!(target_url = %candidate, "Target already registered");
            return false;
        }
        info!(target_url = %candidate, "Target added");
        s.targets.push(candidate);
        true
    }

    /// Remove a candidate, clearing the active pin if it pointed at it.
    pub async fn remove(&self, candidate: &TargetCandidate) -> bool {
        let mut s = self.state.write().await;
        s.touch();
        let before = s.targets.len();
        s.targets.retain(|t| t != candidate);
        let removed = s.targets.len() != before;
        if s.active_target.as_ref() == Some(candidate) {
            s.active_target = None;
        }
        if removed {
            info!(target_url = %candidate, "Target removed");
        }
        removed
    }

    pub async fn set_active(&self, candidate: Option<TargetCandidate>) {
        let mut s = self.state.write().await;
        s.active_target = candidate;
        s.touch();
    }

    pub async fn update_credentials(&self, patch: CredentialsPatch) {
        let mut s = self.state.write().await;
        s.merge_credentials(patch);
        s.touch();
    }

    pub async fn update_settings(&self, patch: SettingsPatch) {
        let mut s = self.state.write().await;
        s.merge_settings(patch);
        s.touch();
    }

    /// Merge a partial update in one step.
    pub async fn apply(&self, update: RegistryUpdate) {
        let mut s = self.state.write().await;
        if let Some(targets) = update.targets {
            s.replace_targets(targets);
        }
        if let Some(patch) = update.credentials {
            s.merge_credentials(patch);
        }
        if let Some(patch) = update.settings {
            s.merge_settings(patch);
        }
        if let Some(active) = update.active_target {
            s.active_target = active;
        }
        s.touch();
    }

    /// Replace targets, credentials and settings (config reload). The active
    /// pin survives only if its target is still registered.
    pub async fn reload(&self, targets: Vec<TargetCandidate>, credentials: Credentials, settings: Settings) {
        let mut s = self.state.write().await;
        s.replace_targets(targets);
        s.credentials = credentials;
        s.settings = settings;
        let keep_active = s
            .active_target
            .as_ref()
            .is_some_and(|active| s.targets.contains(active));
        if !keep_active {
            s.active_target = None;
        }
        s.touch();
    }
}
