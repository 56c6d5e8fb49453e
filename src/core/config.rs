use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::batch::text::{Preset, SpeakerMap};
use crate::core::llm::{ModelRegistry, ModelTarget};
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "promptbatch.toml";
pub const LOG_ENV: &str = "PROMPTBATCH_LOG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub batch: BatchSettings,
    pub preprocess: PreprocessConfig,
    pub store: StoreSettings,
    pub notify: NotifySettings,
    pub models: Vec<ModelTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub concurrency: usize,
    pub max_concurrency: usize,
    pub dispatch_interval_ms: u64,
    pub output_column: String,
    pub persist_debounce_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_concurrency: 20,
            dispatch_interval_ms: 50,
            output_column: "模型输出".to_string(),
            persist_debounce_ms: 500,
            request_timeout_secs: 120,
        }
    }
}

impl BatchSettings {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Text preprocessing applied to the input column before each remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub enabled: bool,
    pub preset: Preset,
    pub remove_timestamps: bool,
    pub remove_html_tags: bool,
    pub normalize_whitespace: bool,
    pub remove_data_markers: bool,
    pub enhance_roles: bool,
    pub custom_patterns: Vec<String>,
    pub speaker_map: SpeakerMap,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            preset: Preset::Custom,
            remove_timestamps: true,
            remove_html_tags: false,
            normalize_whitespace: true,
            remove_data_markers: false,
            enhance_roles: false,
            custom_patterns: Vec::new(),
            speaker_map: SpeakerMap::standard(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Byte ceiling of the job store; writes beyond it are rejected.
    pub capacity_bytes: usize,
    pub max_saved_jobs: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            capacity_bytes: 5 * 1024 * 1024,
            max_saved_jobs: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub enabled: bool,
    pub webhook: String,
    pub secret: String,
}

impl AppConfig {
    /// Read the config from `path`, or from the data directory when `None`.
    /// A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => NativePlatform::data_dir().join(CONFIG_FILE),
        };
        if !config_path.exists() {
            if path.is_some() {
                anyhow::bail!("Config file {} does not exist", config_path.display());
            }
            info!("No {} found, using defaults.", CONFIG_FILE);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config in {}", config_path.display()))?;
        info!(
            "Loaded config from {}: {} model(s), concurrency={}",
            config_path.display(),
            config.models.len(),
            config.batch.concurrency
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(content)?;
        config.batch.max_concurrency = config.batch.max_concurrency.max(1);
        config.batch.concurrency = config.batch.concurrency.clamp(1, config.batch.max_concurrency);
        Ok(config)
    }

    /// Effective data directory; the config value wins over the platform default.
    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => expand_home(dir),
            None => NativePlatform::data_dir(),
        }
    }

    /// Log filter: `PROMPTBATCH_LOG`, then the config value, then `info`.
    pub fn log_level(&self) -> String {
        std::env::var(LOG_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.log_level.clone())
            .unwrap_or_else(|| "info".to_string())
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::with_overrides(&self.models)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map(|h| h.join(rest)).unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.batch.concurrency, 5);
        assert_eq!(config.batch.max_concurrency, 20);
        assert_eq!(config.batch.dispatch_interval(), Duration::from_millis(50));
        assert_eq!(config.batch.output_column, "模型输出");
        assert_eq!(config.store.capacity_bytes, 5_242_880);
        assert_eq!(config.store.max_saved_jobs, 20);
        assert!(!config.preprocess.enabled);
        assert_eq!(config.preprocess.speaker_map.resolve("乘客"), "用户");
    }

    #[test]
    fn parse_partial_file_keeps_other_defaults() {
        let config = AppConfig::parse(
            r#"
log_level = "debug"

[batch]
concurrency = 50
max_concurrency = 8

[preprocess]
enabled = true
preset = "conversation"
speaker_map = { "驾驶员" = "驾驶员" }

[[models]]
id = "local"
base_url = "http://localhost:8080"
request_path = "/v1/chat/completions"
supports_streaming = true
headers = { "X-Team" = "ops" }
"#,
        )
        .unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.batch.concurrency, 8);
        assert_eq!(config.batch.dispatch_interval_ms, 50);
        assert_eq!(config.preprocess.preset, Preset::Conversation);
        assert_eq!(config.preprocess.speaker_map.resolve("员"), "驾驶员");
        assert_eq!(config.models[0].endpoint(), "http://localhost:8080/v1/chat/completions");
        assert!(config.models[0].supports_streaming);
        assert!(config.registry().get("local").is_some());
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(AppConfig::parse("[batch\nconcurrency = 1").is_err());
    }

    #[tokio::test]
    async fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("absent.toml");
        assert!(AppConfig::load(Some(&explicit)).await.is_err());
    }

    #[tokio::test]
    async fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[notify]\nenabled = true\nwebhook = \"https://example.com/hook\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).await.unwrap();
        assert!(config.notify.enabled);
        assert_eq!(config.notify.webhook, "https://example.com/hook");
    }

    #[test]
    fn data_dir_expands_home() {
        let config = AppConfig {
            data_dir: Some(PathBuf::from("~/jobs")),
            ..AppConfig::default()
        };
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.data_dir(), home.join("jobs"));
        }
    }
}
