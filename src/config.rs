//! TOML configuration for the controller driver.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file located via
//! the `TRAFFICCTL_CONFIG` environment variable or the standard system path.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TRAFFICCTL_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/trafficctl/trafficctl.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the driver process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DriverConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded driver configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `TRAFFICCTL_CONFIG`.
    /// 2. `/etc/trafficctl/trafficctl.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TRAFFICCTL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Session pool
// ---------------------------------------------------------------------------

/// Session pool timing and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long `acquire` waits for a free slot before reporting the pool exhausted.
    pub acquire_timeout_sec: u64,
    /// Authentication attempts per new session.
    pub connect_attempts: u32,
    /// Delay between authentication attempts (milliseconds).
    pub connect_retry_delay_ms: u64,
    /// TCP connect / SSH handshake timeout.
    pub connect_timeout_sec: u64,
    /// Upper bound on a single appliance command.
    pub command_timeout_sec: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_sec: 300,
            connect_attempts: 3,
            connect_retry_delay_ms: 2_000,
            connect_timeout_sec: 30,
            command_timeout_sec: 120,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_sec)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Transfer
// ---------------------------------------------------------------------------

/// Remote configuration retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub connect_timeout_sec: u64,
    pub read_timeout_sec: u64,
    /// Upper bound on one whole FTP/SFTP/SCP retrieval.
    pub transfer_timeout_sec: u64,
    /// Extra attempts the lifecycle controller makes on transient fetch failures.
    pub fetch_retries: u32,
    /// Pause before a fetch re-attempt (milliseconds).
    pub retry_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: 10,
            read_timeout_sec: 60,
            transfer_timeout_sec: 600,
            fetch_retries: 1,
            retry_delay_ms: 1_000,
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_sec)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_sec)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Results polling and upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Interval between test status polls (milliseconds).
    pub poll_interval_ms: u64,
    /// Maximum time spent waiting for a test to complete.
    pub max_wait_sec: u64,
    /// Lifetime assumed for a management API token.
    pub token_ttl_sec: u64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_wait_sec: 60,
            token_ttl_sec: 600,
        }
    }
}

impl ResultsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_sec)
    }
}

// ---------------------------------------------------------------------------
// API / Logging
// ---------------------------------------------------------------------------

/// Control API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8029".to_string(),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}
