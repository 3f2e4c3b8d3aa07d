//! Configuration loader and validator for the edge collector agent.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::WatchedFolder;
use crate::retry::RetrySchedule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub watch: Watch,
    #[serde(default)]
    pub queue: Queue,
    pub transmission: Transmission,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Overrides `sqlite://{data_dir}/outbox.db` when set.
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Folder watching and debounce settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Watch {
    #[serde(default)]
    pub folders: Vec<WatchedFolder>,
    #[serde(default = "defaults::debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "defaults::tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "defaults::hash_cache_size")]
    pub hash_cache_size: usize,
    #[serde(default = "defaults::reinstall_delay_secs")]
    pub reinstall_delay_secs: u64,
}

/// Outbox queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::retry_delays_secs")]
    pub retry_delays_secs: Vec<u64>,
    #[serde(default = "defaults::drain_interval_secs")]
    pub drain_interval_secs: u64,
    #[serde(default = "defaults::drain_batch")]
    pub drain_batch: usize,
    #[serde(default = "defaults::stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
    #[serde(default = "defaults::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "defaults::sent_retention_days")]
    pub sent_retention_days: u32,
}

/// Remote ingestion endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transmission {
    pub endpoint: String,
    pub health_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "defaults::health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "defaults::send_attempts")]
    pub max_attempts: u32,
    #[serde(default = "defaults::compression_threshold_bytes")]
    pub compression_threshold_bytes: usize,
    #[serde(default = "defaults::health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "defaults::health_min_spacing_secs")]
    pub health_min_spacing_secs: u64,
    #[serde(default = "defaults::send_concurrency")]
    pub send_concurrency: usize,
}

mod defaults {
    pub fn debounce_ms() -> u64 {
        2000
    }
    pub fn tick_ms() -> u64 {
        1000
    }
    pub fn batch_size() -> usize {
        20
    }
    pub fn max_concurrency() -> usize {
        5
    }
    pub fn hash_cache_size() -> usize {
        10_000
    }
    pub fn reinstall_delay_secs() -> u64 {
        5
    }
    pub fn max_attempts() -> u32 {
        5
    }
    pub fn retry_delays_secs() -> Vec<u64> {
        vec![1, 2, 4, 8, 16]
    }
    pub fn drain_interval_secs() -> u64 {
        10
    }
    pub fn drain_batch() -> usize {
        50
    }
    pub fn stuck_timeout_secs() -> u64 {
        300
    }
    pub fn sweep_interval_secs() -> u64 {
        60
    }
    pub fn sent_retention_days() -> u32 {
        30
    }
    pub fn timeout_secs() -> u64 {
        30
    }
    pub fn health_timeout_secs() -> u64 {
        5
    }
    pub fn send_attempts() -> u32 {
        3
    }
    pub fn compression_threshold_bytes() -> usize {
        1024
    }
    pub fn health_interval_secs() -> u64 {
        60
    }
    pub fn health_min_spacing_secs() -> u64 {
        30
    }
    pub fn send_concurrency() -> usize {
        4
    }
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            folders: Vec::new(),
            debounce_ms: defaults::debounce_ms(),
            tick_ms: defaults::tick_ms(),
            batch_size: defaults::batch_size(),
            max_concurrency: defaults::max_concurrency(),
            hash_cache_size: defaults::hash_cache_size(),
            reinstall_delay_secs: defaults::reinstall_delay_secs(),
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            retry_delays_secs: defaults::retry_delays_secs(),
            drain_interval_secs: defaults::drain_interval_secs(),
            drain_batch: defaults::drain_batch(),
            stuck_timeout_secs: defaults::stuck_timeout_secs(),
            sweep_interval_secs: defaults::sweep_interval_secs(),
            sent_retention_days: defaults::sent_retention_days(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Database URL, honouring `DATABASE_URL` first, then `app.database_url`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/outbox.db", self.app.data_dir))
    }

    pub fn retry_schedule(&self) -> RetrySchedule {
        RetrySchedule::from_secs(&self.queue.retry_delays_secs)
    }
}

impl Watch {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.watch.debounce_ms == 0 {
        return Err(ConfigError::Invalid("watch.debounce_ms must be > 0"));
    }
    if cfg.watch.tick_ms == 0 {
        return Err(ConfigError::Invalid("watch.tick_ms must be > 0"));
    }
    if cfg.watch.batch_size == 0 {
        return Err(ConfigError::Invalid("watch.batch_size must be > 0"));
    }
    if cfg.watch.max_concurrency == 0 {
        return Err(ConfigError::Invalid("watch.max_concurrency must be > 0"));
    }
    if cfg.watch.hash_cache_size == 0 {
        return Err(ConfigError::Invalid("watch.hash_cache_size must be > 0"));
    }
    if cfg
        .watch
        .folders
        .iter()
        .any(|f| f.path.as_os_str().is_empty())
    {
        return Err(ConfigError::Invalid("watch.folders[].path must be non-empty"));
    }

    if cfg.queue.max_attempts == 0 {
        return Err(ConfigError::Invalid("queue.max_attempts must be > 0"));
    }
    if cfg.queue.retry_delays_secs.is_empty() {
        return Err(ConfigError::Invalid("queue.retry_delays_secs must be non-empty"));
    }
    if cfg.queue.drain_interval_secs == 0 {
        return Err(ConfigError::Invalid("queue.drain_interval_secs must be > 0"));
    }
    if cfg.queue.drain_batch == 0 {
        return Err(ConfigError::Invalid("queue.drain_batch must be > 0"));
    }
    if cfg.queue.stuck_timeout_secs == 0 {
        return Err(ConfigError::Invalid("queue.stuck_timeout_secs must be > 0"));
    }
    if cfg.queue.sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid("queue.sweep_interval_secs must be > 0"));
    }

    let tx = &cfg.transmission;
    if tx.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("transmission.endpoint must be non-empty"));
    }
    if reqwest::Url::parse(&tx.endpoint).is_err() {
        return Err(ConfigError::Invalid("transmission.endpoint must be a valid URL"));
    }
    if reqwest::Url::parse(&tx.health_url).is_err() {
        return Err(ConfigError::Invalid("transmission.health_url must be a valid URL"));
    }
    if tx.timeout_secs == 0 || tx.health_timeout_secs == 0 {
        return Err(ConfigError::Invalid("transmission timeouts must be > 0"));
    }
    if tx.max_attempts == 0 {
        return Err(ConfigError::Invalid("transmission.max_attempts must be > 0"));
    }
    if tx.health_interval_secs == 0 {
        return Err(ConfigError::Invalid("transmission.health_interval_secs must be > 0"));
    }
    if tx.send_concurrency == 0 {
        return Err(ConfigError::Invalid("transmission.send_concurrency must be > 0"));
    }

    Ok(())
}

/// Returns a complete example YAML document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

watch:
  debounce_ms: 2000
  tick_ms: 1000
  batch_size: 20
  max_concurrency: 5
  folders:
    - path: "./inbox"
      include: ["*.xml"]
      exclude: ["*.tmp", "*-canc.xml"]
      recursive: true
      max_file_size: 10485760

queue:
  max_attempts: 5
  retry_delays_secs: [1, 2, 4, 8, 16]
  drain_interval_secs: 10
  drain_batch: 50
  stuck_timeout_secs: 300
  sweep_interval_secs: 60
  sent_retention_days: 30

transmission:
  endpoint: "https://ingest.example.com/api/v1/documents"
  health_url: "https://ingest.example.com/health"
  api_key: "YOUR_INGEST_API_KEY"
  timeout_secs: 30
  health_timeout_secs: 5
  max_attempts: 3
  compression_threshold_bytes: 1024
  health_interval_secs: 60
  health_min_spacing_secs: 30
  send_concurrency: 4
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.watch.folders.len(), 1);
        assert_eq!(cfg.watch.folders[0].include, vec!["*.xml".to_string()]);
        assert_eq!(cfg.retry_schedule(), RetrySchedule::default());
    }

    #[test]
    fn minimal_document_takes_defaults() {
        let yaml = r#"
app:
  data_dir: "./data"
transmission:
  endpoint: "http://localhost:8080/docs"
  health_url: "http://localhost:8080/health"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.watch.debounce_ms, 2000);
        assert_eq!(cfg.watch.max_concurrency, 5);
        assert_eq!(cfg.queue.max_attempts, 5);
        assert_eq!(cfg.queue.drain_interval_secs, 10);
        assert_eq!(cfg.transmission.compression_threshold_bytes, 1024);
        assert!(cfg.transmission.api_key.is_none());
    }

    #[test]
    fn invalid_endpoint() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transmission.endpoint = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("transmission.endpoint")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.transmission.endpoint = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_queue_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.max_attempts = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_attempts")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.retry_delays_secs.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.watch.max_concurrency = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.queue.retry_delays_secs, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let err = load(Some(&td.path().join("absent.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
