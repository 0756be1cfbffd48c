//! Wallet settings persistence.
//!
//! Stores wallet state and tunables in ~/.walletcore/settings.json.
//! Settings are loaded with settings.json > default priority; every field
//! has a serde default so partial files from older versions still parse.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::SettingsError;

/// Wallet settings persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Settings {
    /// Whether onboarding/registration has been completed.
    #[serde(default)]
    pub initialized: bool,

    /// Whether the legal terms have been accepted.
    #[serde(default)]
    pub terms_accepted: bool,

    /// Whether the wallet is explicitly locked.
    #[serde(default)]
    pub locked: bool,

    /// Session lifecycle tunables.
    #[serde(default)]
    pub session: SessionSettings,

    /// Background token validator tunables.
    #[serde(default)]
    pub validator: ValidatorSettings,

    /// Idle detection tunables.
    #[serde(default)]
    pub idle: IdleSettings,

    /// Provider bridge tunables.
    #[serde(default)]
    pub bridge: BridgeSettings,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    /// Session lifetime from start/extend, in seconds.
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,

    /// Warning window before expiry, in seconds.
    #[serde(default = "default_session_warning_secs")]
    pub warning_secs: u64,

    /// Extend automatically when activity lands inside the warning window.
    #[serde(default = "default_true")]
    pub auto_extend_on_activity: bool,

    /// Bearer token lifetime, in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Re-sign the token during extend when its remaining lifetime drops
    /// below this threshold, in seconds.
    #[serde(default = "default_token_refresh_threshold_secs")]
    pub token_refresh_threshold_secs: u64,
}

fn default_session_timeout_secs() -> u64 {
    30 * 60
}

fn default_session_warning_secs() -> u64 {
    2 * 60
}

fn default_token_ttl_secs() -> u64 {
    60 * 60
}

fn default_token_refresh_threshold_secs() -> u64 {
    10 * 60
}

fn default_true() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout_secs(),
            warning_secs: default_session_warning_secs(),
            auto_extend_on_activity: true,
            token_ttl_secs: default_token_ttl_secs(),
            token_refresh_threshold_secs: default_token_refresh_threshold_secs(),
        }
    }
}

/// Background token validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatorSettings {
    /// Validation tick interval, in seconds.
    #[serde(default = "default_validator_interval_secs")]
    pub interval_secs: u64,

    /// Minimum spacing between two validations, in seconds.
    #[serde(default = "default_validator_min_spacing_secs")]
    pub min_spacing_secs: u64,

    /// Grace period after login during which failures do not force logout,
    /// in seconds.
    #[serde(default = "default_validator_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_validator_interval_secs() -> u64 {
    30
}

fn default_validator_min_spacing_secs() -> u64 {
    10
}

fn default_validator_grace_period_secs() -> u64 {
    30
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_validator_interval_secs(),
            min_spacing_secs: default_validator_min_spacing_secs(),
            grace_period_secs: default_validator_grace_period_secs(),
        }
    }
}

/// Idle detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdleSettings {
    /// Inactivity threshold before the Idle transition, in seconds.
    #[serde(default = "default_idle_threshold_secs")]
    pub threshold_secs: u64,

    /// Delay between the Idle transition and lockdown, in seconds.
    /// Zero locks down immediately.
    #[serde(default = "default_idle_lock_delay_secs")]
    pub lock_delay_secs: u64,

    /// Probe polling interval, in seconds.
    #[serde(default = "default_idle_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_idle_threshold_secs() -> u64 {
    2 * 60
}

fn default_idle_lock_delay_secs() -> u64 {
    30
}

fn default_idle_check_interval_secs() -> u64 {
    15
}

impl Default for IdleSettings {
    fn default() -> Self {
        Self {
            threshold_secs: default_idle_threshold_secs(),
            lock_delay_secs: default_idle_lock_delay_secs(),
            check_interval_secs: default_idle_check_interval_secs(),
        }
    }
}

/// Provider bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSettings {
    /// Per-request timeout for dispatched provider requests, in seconds.
    #[serde(default = "default_bridge_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Chain id reported before the privileged side pushes one (hex).
    #[serde(default = "default_bridge_chain_id")]
    pub default_chain_id: String,
}

fn default_bridge_request_timeout_secs() -> u64 {
    30
}

fn default_bridge_chain_id() -> String {
    "0x1".to_string()
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_bridge_request_timeout_secs(),
            default_chain_id: default_bridge_chain_id(),
        }
    }
}

/// Get the default settings file path (~/.walletcore/settings.json).
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".walletcore")
        .join("settings.json")
}

impl Settings {
    /// Load settings from the default path, falling back to defaults if the
    /// file does not exist.
    pub async fn load() -> Result<Self, SettingsError> {
        Self::load_from(&default_settings_path()).await
    }

    /// Load settings from a specific path, falling back to defaults if the
    /// file does not exist.
    pub async fn load_from(path: &Path) -> Result<Self, SettingsError> {
        match tokio::fs::read_to_string(path).await {
            Ok(data) => {
                let settings = serde_json::from_str(&data)?;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings file at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(SettingsError::Io(e)),
        }
    }

    /// Save settings to a specific path, creating parent directories.
    pub async fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!("Settings saved to {}", path.display());
        Ok(())
    }
}

/// Storage seam for wallet settings.
///
/// The router re-reads settings on every decision, so implementations must
/// return current state rather than a construction-time snapshot.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings, SettingsError>;
    async fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// File-backed settings store.
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn at_default_path() -> Self {
        Self::new(default_settings_path())
    }
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn load(&self) -> Result<Settings, SettingsError> {
        Settings::load_from(&self.path).await
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        settings.save_to(&self.path).await
    }
}

/// In-memory settings store for tests and embedded hosts.
#[derive(Default)]
pub struct MemorySettingsStore {
    inner: RwLock<Settings>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub fn shared(settings: Settings) -> Arc<Self> {
        Arc::new(Self::new(settings))
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        *self.inner.write().await = settings.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert!(!settings.initialized);
        assert!(!settings.terms_accepted);
        assert!(!settings.locked);
        assert_eq!(settings.session.timeout_secs, 1800);
        assert_eq!(settings.session.warning_secs, 120);
        assert!(settings.session.auto_extend_on_activity);
        assert_eq!(settings.validator.interval_secs, 30);
        assert_eq!(settings.validator.grace_period_secs, 30);
        assert_eq!(settings.bridge.default_chain_id, "0x1");
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.initialized = true;
        settings.terms_accepted = true;
        settings.session.timeout_secs = 900;

        settings.save_to(&path).await.unwrap();
        let loaded = Settings::load_from(&path).await.unwrap();
        assert_eq!(loaded, settings);
    }

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let loaded = Settings::load_from(&dir.path().join("missing.json"))
            .await
            .unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[tokio::test]
    async fn partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, r#"{"initialized": true}"#)
            .await
            .unwrap();

        let loaded = Settings::load_from(&path).await.unwrap();
        assert!(loaded.initialized);
        assert!(!loaded.terms_accepted);
        assert_eq!(loaded.session.timeout_secs, 1800);
    }

    #[tokio::test]
    async fn memory_store_reflects_saves() {
        let store = MemorySettingsStore::default();
        let mut settings = store.load().await.unwrap();
        settings.locked = true;
        store.save(&settings).await.unwrap();
        assert!(store.load().await.unwrap().locked);
    }
}
