//! Client configuration and stored credentials
//!
//! `config.toml` and `credentials.json` live in the config directory
//! (`$AGENTSYNC_CONFIG_DIR`, else `~/.config/agentsync`). Environment
//! variables win over both files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientConfig, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::preflight::PreflightLimits;
use crate::protocol::{self, TOOL_NAME};

pub const ENV_BASE_URL: &str = "AGENTSYNC_BASE_URL";
pub const ENV_TOKEN: &str = "AGENTSYNC_TOKEN";
pub const ENV_STATE_DIR: &str = "AGENTSYNC_STATE_DIR";
pub const ENV_CONFIG_DIR: &str = "AGENTSYNC_CONFIG_DIR";

pub const CONFIG_FILE: &str = "config.toml";
pub const CREDENTIALS_FILE: &str = "credentials.json";

const MIB: u64 = 1024 * 1024;

pub fn default_limits() -> PreflightLimits {
    PreflightLimits {
        max_files: Some(5_000),
        max_total_bytes: Some(100 * MIB),
        max_file_bytes: Some(5 * MIB),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: protocol::retry::MAX_ATTEMPTS,
            base_delay_ms: protocol::retry::BASE_DELAY_MS,
            max_delay_ms: protocol::retry::MAX_DELAY_MS,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: Option<String>,
    /// Where checkpoints are kept; defaults to the config directory
    pub state_dir: Option<PathBuf>,
    pub concurrency: usize,
    pub max_blob_bytes: u64,
    pub timeout_secs: u64,
    pub limits: PreflightLimits,
    pub retry: RetrySettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            state_dir: None,
            concurrency: protocol::DEFAULT_CONCURRENCY,
            max_blob_bytes: 5 * MIB,
            timeout_secs: 60,
            limits: default_limits(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|e| e <= now)
    }
}

/// Fully resolved settings for one CLI run
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: SyncConfig,
    pub config_dir: PathBuf,
    pub credentials: Option<Credentials>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Same as `load` with an injectable environment lookup
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_dir = env(ENV_CONFIG_DIR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(default_config_dir)
            .ok_or_else(|| SyncError::Config("cannot determine the config directory".into()))?;

        let mut config = load_config(&config_dir.join(CONFIG_FILE))?;
        let mut credentials = load_credentials(&config_dir.join(CREDENTIALS_FILE))?;

        if let Some(url) = env(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            config.base_url = Some(url);
        }
        if let Some(dir) = env(ENV_STATE_DIR).filter(|v| !v.is_empty()) {
            config.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(token) = env(ENV_TOKEN).filter(|v| !v.is_empty()) {
            credentials = Some(Credentials {
                access_token: token,
                ..Default::default()
            });
        }

        Ok(Self {
            config,
            config_dir,
            credentials,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.config
            .state_dir
            .clone()
            .unwrap_or_else(|| self.config_dir.clone())
    }

    /// Base URL: config or env first, then the one stored with the login
    pub fn base_url(&self) -> Option<String> {
        self.config.base_url.clone().or_else(|| {
            self.credentials
                .as_ref()
                .and_then(|c| c.base_url.clone())
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let base_url = self.base_url().ok_or_else(|| {
            SyncError::Config(format!(
                "no server configured; set {ENV_BASE_URL} or base_url in {}",
                self.config_dir.join(CONFIG_FILE).display()
            ))
        })?;
        let creds = self
            .credentials
            .as_ref()
            .ok_or_else(|| SyncError::Auth("no stored credentials".into()))?;
        if creds.is_expired(Utc::now()) {
            return Err(SyncError::Auth("stored credentials have expired".into()));
        }

        let mut cfg = ClientConfig::new(base_url)
            .with_token(creds.access_token.clone(), creds.token_type.clone());
        cfg.retry = self.config.retry.into();
        cfg.timeout = Duration::from_secs(self.config.timeout_secs.max(1));
        Ok(cfg)
    }
}

fn default_config_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join(TOOL_NAME));
    }
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"))?;
    Some(PathBuf::from(home).join(".config").join(TOOL_NAME))
}

pub fn load_config(path: &Path) -> Result<SyncConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => toml::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncConfig::default()),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

pub fn load_credentials(path: &Path) -> Result<Option<Credentials>> {
    match std::fs::read(path) {
        Ok(data) => {
            let creds: Credentials = serde_json::from_slice(&data)
                .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
            Ok(Some(creds).filter(|c| !c.access_token.is_empty()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_when_files_missing() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().display().to_string();
        let settings = Settings::load_with(env_of(&[(ENV_CONFIG_DIR, dir)])).unwrap();
        assert_eq!(settings.config, SyncConfig::default());
        assert_eq!(settings.config.limits.max_files, Some(5_000));
        assert!(settings.credentials.is_none());
        assert_eq!(settings.state_dir(), tmp.path());
    }

    #[test]
    fn test_toml_and_env_overrides() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE),
            "base_url = \"https://file.example\"\nconcurrency = 8\n\n[limits]\nmax_files = 10\n\n[retry]\nmax_attempts = 2\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join(CREDENTIALS_FILE),
            r#"{"accessToken":"stored","tokenType":"Token"}"#,
        )
        .unwrap();

        let settings = Settings::load_with(env_of(&[
            (ENV_CONFIG_DIR, tmp.path().display().to_string()),
            (ENV_BASE_URL, "https://env.example".into()),
            (ENV_STATE_DIR, "/tmp/agentsync-state".into()),
        ]))
        .unwrap();
        assert_eq!(settings.config.concurrency, 8);
        assert_eq!(settings.config.limits.max_files, Some(10));
        assert_eq!(settings.config.limits.max_file_bytes, None);
        assert_eq!(settings.state_dir(), PathBuf::from("/tmp/agentsync-state"));

        let client = settings.client_config().unwrap();
        assert_eq!(client.base_url, "https://env.example");
        assert_eq!(client.token.as_deref(), Some("stored"));
        assert_eq!(client.token_type.as_deref(), Some("Token"));
        assert_eq!(client.retry.max_attempts, 2);
    }

    #[test]
    fn test_env_token_replaces_stored_credentials() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CREDENTIALS_FILE),
            r#"{"accessToken":"stored","baseUrl":"https://login.example"}"#,
        )
        .unwrap();
        let settings = Settings::load_with(env_of(&[
            (ENV_CONFIG_DIR, tmp.path().display().to_string()),
            (ENV_TOKEN, "from-env".into()),
        ]))
        .unwrap();
        assert!(matches!(settings.client_config(), Err(SyncError::Config(_))));

        let tmp2 = TempDir::new().unwrap();
        std::fs::write(
            tmp2.path().join(CREDENTIALS_FILE),
            r#"{"accessToken":"stored","baseUrl":"https://login.example"}"#,
        )
        .unwrap();
        let settings = Settings::load_with(env_of(&[(ENV_CONFIG_DIR, tmp2.path().display().to_string())])).unwrap();
        assert_eq!(settings.client_config().unwrap().base_url, "https://login.example");
    }

    #[test]
    fn test_expired_credentials_need_login() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CREDENTIALS_FILE),
            r#"{"accessToken":"old","baseUrl":"https://x.example","expiry":"2001-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let settings = Settings::load_with(env_of(&[(ENV_CONFIG_DIR, tmp.path().display().to_string())])).unwrap();
        let err = settings.client_config().unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("login"));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "concurrency = \"many\"").unwrap();
        let err = Settings::load_with(env_of(&[(ENV_CONFIG_DIR, tmp.path().display().to_string())])).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
