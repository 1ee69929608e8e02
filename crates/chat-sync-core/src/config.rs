use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{DATABASE_FILE, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::models::EntityKind;

const DEFAULT_BASE_URL: &str = "https://chat.stream-io-api.com";

/// Backend endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Per-request timeout, surfaced as `NetworkError::Timeout`
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub api: ApiConfig,

    /// Entity kinds that get an orphan reconciler
    #[serde(default = "default_reconcile_kinds")]
    pub reconcile_kinds: Vec<EntityKind>,
}

impl CoreConfig {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            api: ApiConfig::default(),
            reconcile_kinds: default_reconcile_kinds(),
        }
    }

    /// Load config from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CoreConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self::new(default_data_dir())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("chat-sync"))
        .unwrap_or_else(|| PathBuf::from("chat_sync_data"))
}

fn default_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_reconcile_kinds() -> Vec<EntityKind> {
    vec![EntityKind::User]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "dataDir": "/tmp/chat",
            "api": {"baseUrl": "http://localhost:3030", "apiKey": "key", "timeoutSecs": 5},
            "reconcileKinds": ["user", "channel"]
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/chat"));
        assert_eq!(config.api.base_url, "http://localhost:3030");
        assert_eq!(config.api.api_key.as_deref(), Some("key"));
        assert_eq!(config.api.timeout_secs, 5);
        assert_eq!(
            config.reconcile_kinds,
            vec![EntityKind::User, EntityKind::Channel]
        );
        assert_eq!(config.database_path(), PathBuf::from("/tmp/chat/chat_sync.db"));
    }

    #[test]
    fn test_parse_config_minimal() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.api, ApiConfig::default());
        assert_eq!(config.reconcile_kinds, vec![EntityKind::User]);
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();
        let err = CoreConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }
}
