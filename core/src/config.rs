use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const ENV_PREFIX: &str = "CONTEXT_";

/// Immutable runtime configuration, resolved once at startup and passed
/// down by reference. Values come from an optional TOML file layered
/// under `CONTEXT_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// PostgreSQL connection string. The only setting with no default.
    pub postgres_url: String,
    /// Base URL of the remote vector service. When unset the engine runs
    /// against the PostgreSQL-backed vector store.
    pub vector_store_url: Option<String>,
    /// Base URL of the external crawler service.
    pub crawler_url: Option<String>,
    /// Base URL of the embedding provider.
    pub embedder_url: String,
    /// Model name sent to the embedding provider.
    pub embedder_model: String,

    /// Shared connection pool bound.
    pub pool_max: u32,
    /// Upper bound on content forwarded into the pipeline per document.
    pub request_body_limit_bytes: usize,

    /// Safety-net cadence of the metadata monitor.
    pub postgres_polling_interval_secs: u64,
    /// Per-session crawl progress polling cadence.
    pub crawl_polling_interval_ms: u64,
    /// Vector-store snapshot cadence.
    pub vector_store_polling_interval_secs: u64,

    /// Watcher debounce window.
    pub debounce_ms: u64,
    /// Per-file write quiescence threshold.
    pub write_stability_ms: u64,
    /// Watcher health-check cadence.
    pub watcher_health_interval_secs: u64,
    /// Restart configured watchers that are not running.
    pub auto_recover: bool,
    /// Sidecar JSON backup of watcher configs; survives DB resets.
    pub watch_backup_path: Option<PathBuf>,

    /// Default retry budget for new jobs.
    pub default_max_retries: i32,
    /// Base of the exponential retry backoff, in seconds.
    pub retry_backoff_base_secs: u64,
    /// Terminal job rows older than this are removed by maintenance.
    pub job_retention_days: i64,
    /// Concurrent ingestion worker loops per process.
    pub worker_count: usize,

    /// Query-time fallback to dense-only when off.
    pub enable_hybrid_search: bool,
    /// Overall per-query deadline.
    pub query_timeout_ms: u64,
    /// Per-collection oversampling multiplier before fusion.
    pub oversample_factor: usize,

    /// How long shutdown waits for in-flight syncs and jobs.
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            postgres_url: String::new(),
            vector_store_url: None,
            crawler_url: None,
            embedder_url: "http://127.0.0.1:11434".to_string(),
            embedder_model: "nomic-embed-text".to_string(),
            pool_max: 20,
            request_body_limit_bytes: 10 * 1024 * 1024,
            postgres_polling_interval_secs: 30,
            crawl_polling_interval_ms: 1000,
            vector_store_polling_interval_secs: 5,
            debounce_ms: 2000,
            write_stability_ms: 500,
            watcher_health_interval_secs: 30,
            auto_recover: true,
            watch_backup_path: None,
            default_max_retries: 3,
            retry_backoff_base_secs: 30,
            job_retention_days: 14,
            worker_count: 2,
            enable_hybrid_search: false,
            query_timeout_ms: 10_000,
            oversample_factor: 3,
            shutdown_grace_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration: defaults, then the TOML file (if present),
    /// then environment overrides. Fails with a config error when the
    /// result is not usable.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| EngineError::config(format!("cannot read {path:?}: {e}")))?;
                toml::from_str(&raw)
                    .map_err(|e| EngineError::config(format!("invalid config {path:?}: {e}")))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `CONTEXT_CONFIG` wins; otherwise the platform config directory.
    fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(format!("{ENV_PREFIX}CONFIG")) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|d| d.join("context-core").join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}POSTGRES_URL")) {
            self.postgres_url = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}VECTOR_STORE_URL")) {
            self.vector_store_url = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}CRAWLER_URL")) {
            self.crawler_url = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}EMBEDDER_URL")) {
            self.embedder_url = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}EMBEDDER_MODEL")) {
            self.embedder_model = v;
        }
        if let Some(v) = env_parse(format!("{ENV_PREFIX}POOL_MAX")) {
            self.pool_max = v;
        }
        if let Some(v) = env_parse(format!("{ENV_PREFIX}DEBOUNCE_MS")) {
            self.debounce_ms = v;
        }
        if let Some(v) = env_parse(format!("{ENV_PREFIX}WRITE_STABILITY_MS")) {
            self.write_stability_ms = v;
        }
        if let Some(v) = env_parse(format!("{ENV_PREFIX}WORKER_COUNT")) {
            self.worker_count = v;
        }
        if let Some(v) = env_parse(format!("{ENV_PREFIX}MAX_RETRIES")) {
            self.default_max_retries = v;
        }
        if let Some(v) = env_parse(format!("{ENV_PREFIX}QUERY_TIMEOUT_MS")) {
            self.query_timeout_ms = v;
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}ENABLE_HYBRID_SEARCH")) {
            self.enable_hybrid_search = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}AUTO_RECOVER")) {
            self.auto_recover = !matches!(v.as_str(), "0" | "false" | "no");
        }
        if let Ok(v) = std::env::var(format!("{ENV_PREFIX}WATCH_BACKUP_PATH")) {
            self.watch_backup_path = Some(PathBuf::from(v));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.postgres_url.is_empty() {
            return Err(EngineError::config(
                "postgres_url is required (set CONTEXT_POSTGRES_URL or the config file)",
            ));
        }
        if self.pool_max == 0 {
            return Err(EngineError::config("pool_max must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(EngineError::config("worker_count must be at least 1"));
        }
        if self.oversample_factor == 0 {
            return Err(EngineError::config("oversample_factor must be at least 1"));
        }
        Ok(())
    }

    /// Default location of the watcher sidecar backup when none is
    /// configured.
    pub fn watch_backup_or_default(&self) -> PathBuf {
        self.watch_backup_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("context-core")
                .join("watchers.json")
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: String) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.pool_max, 20);
        assert_eq!(config.debounce_ms, 2000);
        assert_eq!(config.write_stability_ms, 500);
        assert_eq!(config.watcher_health_interval_secs, 30);
        assert_eq!(config.postgres_polling_interval_secs, 30);
        assert_eq!(config.crawl_polling_interval_ms, 1000);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.request_body_limit_bytes, 10 * 1024 * 1024);
        assert!(!config.enable_hybrid_search);
        assert!(config.auto_recover);
    }

    #[test]
    fn missing_postgres_url_is_a_config_error() {
        let config = EngineConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = EngineConfig::default();
        config.postgres_url = "postgres://localhost/context".to_string();
        config.enable_hybrid_search = true;
        let raw = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.postgres_url, config.postgres_url);
        assert!(parsed.enable_hybrid_search);
    }
}
