use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const API_KEY_ENV: &str = "RELAY_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: DeploymentMode,
    pub api: ApiConfig,
    pub proxy: ProxyConfig,
    pub auth: AuthConfig,
    pub polling: PollingConfig,
    pub history: HistoryConfig,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentMode {
    /// Calls go straight to the backend with the configured API key.
    SelfHosted,
    /// Calls go through the proxy with the signed-in user's token.
    Hosted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// File holding the API key, as written by a desktop shell.
    pub credential_file: Option<PathBuf>,
    /// Account the self-hosted task listing is scoped to.
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub refresh_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub sync_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("dev", "research-relay", "research-relay")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".research-relay"));

        Config {
            mode: DeploymentMode::SelfHosted,
            api: ApiConfig::default(),
            proxy: ProxyConfig::default(),
            auth: AuthConfig::default(),
            polling: PollingConfig::default(),
            history: HistoryConfig::default(),
            data_dir,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            api_key: None,
            credential_file: None,
            account_id: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api/proxy".to_string(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_url: "http://localhost:3000/api/auth/refresh".to_string(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            sync_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn config_file() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "research-relay", "research-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        if let Some(config_file) = Self::config_file() {
            if config_file.exists() {
                return Self::load_from(&config_file);
            }
        }
        Ok(Config::default())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write to the default location and return the path written.
    pub fn save(&self) -> Result<PathBuf> {
        let Some(config_file) = Self::config_file() else {
            anyhow::bail!("No configuration directory is available on this system");
        };
        self.save_to(&config_file)?;
        Ok(config_file)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// API key for the direct path: env var, then config, then credential file.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }
        if let Some(key) = self.api.api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            return Some(key.trim().to_string());
        }
        let path = self.api.credential_file.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(content) => Some(content.trim().to_string()).filter(|k| !k.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to read credential file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.polling.request_timeout_secs.max(1))
    }

    pub fn history_sync_interval(&self) -> Duration {
        Duration::from_millis(self.history.sync_interval_ms.clamp(100, 2000))
    }

    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn history_file(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
mode = "hosted"

[proxy]
base_url = "https://app.example.com/api/proxy"
"#,
        )
        .unwrap();
        assert_eq!(config.mode, DeploymentMode::Hosted);
        assert_eq!(config.proxy.base_url, "https://app.example.com/api/proxy");
        assert_eq!(config.polling.interval_secs, 10);
        assert_eq!(config.history.capacity, 50);
    }

    #[test]
    fn test_credential_file_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, "sk-from-file\n").unwrap();

        let mut config = Config::default();
        config.api.credential_file = Some(path);
        if std::env::var(API_KEY_ENV).is_err() {
            assert_eq!(config.resolve_api_key().as_deref(), Some("sk-from-file"));
            config.api.api_key = Some("sk-inline".into());
            assert_eq!(config.resolve_api_key().as_deref(), Some("sk-inline"));
        }
    }

    #[test]
    fn test_sync_interval_is_bounded() {
        let mut config = Config::default();
        config.history.sync_interval_ms = 60_000;
        assert_eq!(config.history_sync_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay").join("config.toml");

        let mut config = Config::default();
        config.mode = DeploymentMode::Hosted;
        config.history.sync_interval_ms = 250;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.mode, DeploymentMode::Hosted);
        assert_eq!(loaded.history_sync_interval(), Duration::from_millis(250));
    }
}
