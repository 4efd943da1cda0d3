//! TOML configuration for evalrunner.
//!
//! Every section has compiled-in defaults, so an empty (or absent) file is a
//! valid configuration. The file is located through an explicit path, the
//! `EVALRUNNER_CONFIG` environment variable, or `./evalrunner.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "EVALRUNNER_CONFIG";

const LOCAL_CONFIG: &str = "evalrunner.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runner: RunnerConfig,
    pub evaluation: EvaluationConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration for the process.
    ///
    /// An explicit path must load; the environment and local fallbacks only
    /// warn and fall through to the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{CONFIG_ENV} set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Parallel runner and executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Maximum number of test executors in flight per run.
    pub max_concurrency: usize,
    /// Default adapter deadline; an adapter's own `timeout` key overrides it.
    pub adapter_timeout_secs: u64,
    pub evaluation_timeout_secs: u64,
    /// Capacity of the progress event queue; events beyond it are dropped.
    pub progress_buffer: usize,
    /// Interrupt running executors on cancellation instead of letting them finish.
    pub interrupt_in_flight: bool,
    pub retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            adapter_timeout_secs: 60,
            evaluation_timeout_secs: 120,
            progress_buffer: 256,
            interrupt_in_flight: false,
            retry: RetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_secs)
    }

    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout_secs)
    }
}

/// Retry policy for adapter invocations. One attempt means retries are off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

// ---------------------------------------------------------------------------
// Evaluation service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Base URL of the DeepEval-compatible scoring service.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout_secs: 120,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage / server / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/evalrunner.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Directory searched for suite files by name.
    pub suites_dir: PathBuf,
    /// How long shutdown waits for cancelled runs to write their final record.
    pub shutdown_grace_secs: u64,
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            suites_dir: PathBuf::from("test_suites"),
            shutdown_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.runner.max_concurrency, 10);
        assert_eq!(cfg.runner.retry.max_attempts, 1);
        assert!(!cfg.runner.interrupt_in_flight);
        assert_eq!(cfg.evaluation.base_url, "http://localhost:8001");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.server.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [runner]
            max_concurrency = 4

            [runner.retry]
            max_attempts = 3

            [storage]
            db_path = "/tmp/x.db"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.runner.max_concurrency, 4);
        assert_eq!(cfg.runner.adapter_timeout_secs, 60);
        assert_eq!(cfg.runner.retry.max_attempts, 3);
        assert_eq!(cfg.runner.retry.backoff_ms, 500);
        assert_eq!(cfg.storage.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.server, ServerConfig::default());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            backoff_ms: 100,
            max_backoff_ms: 350,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(350));
        assert_eq!(retry.backoff(80), Duration::from_millis(350));
    }

    #[test]
    fn test_explicit_path_must_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\njson = true").unwrap();
        let cfg = AppConfig::resolve(Some(file.path())).unwrap();
        assert!(cfg.logging.json);

        assert!(AppConfig::resolve(Some(Path::new("/nonexistent/evalrunner.toml"))).is_err());
    }
}
