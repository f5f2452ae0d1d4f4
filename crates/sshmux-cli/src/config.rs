//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sshmux_exec::{DialConfig, FailurePolicy, PoolConfig};

/// Top-level configuration for sshmux
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSection,
    /// Dial retry settings
    #[serde(default)]
    pub dial: DialSection,
    /// Defaults for hosts given on the command line
    #[serde(default)]
    pub defaults: HostDefaults,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Whether a failed dial is remembered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Keep the failure for the life of the process
    Remember,
    /// Dial again after the cooldown
    #[default]
    Retry,
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Maximum concurrent sessions per connection
    #[serde(default = "default_session_limit")]
    pub session_limit: usize,
    /// Handling of failed dials
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Cooldown before a failed identity is dialed again
    #[serde(default)]
    pub retry_cooldown_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            session_limit: default_session_limit(),
            failure_mode: FailureMode::default(),
            retry_cooldown_secs: 0,
        }
    }
}

fn default_session_limit() -> usize {
    sshmux_exec::DEFAULT_SESSION_LIMIT
}

/// Dial retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialSection {
    /// Overall deadline for a host to become reachable
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// Timeout of one reachability probe
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Pause between probes
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl Default for DialSection {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

fn default_deadline_secs() -> u64 {
    60
}

fn default_probe_timeout_secs() -> u64 {
    15
}

fn default_retry_interval_secs() -> u64 {
    1
}

/// Defaults for hosts given on the command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDefaults {
    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to SSH private key
    pub ssh_key: Option<PathBuf>,
}

impl Default for HostDefaults {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_port(),
            ssh_key: None,
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    pub fn load_default() -> eyre::Result<Self> {
        // Check environment variable
        if let Ok(path) = std::env::var("SSHMUX_CONFIG") {
            return Self::load(Path::new(&path));
        }

        // Try common paths
        let mut paths = vec![
            PathBuf::from("sshmux.toml"),
            PathBuf::from("/etc/sshmux/sshmux.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("sshmux/sshmux.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        // Return default config if no file found
        Ok(Config::default())
    }

    /// Dial policy from the `[dial]` section
    #[must_use]
    pub fn dial_config(&self) -> DialConfig {
        DialConfig::default()
            .with_deadline(Duration::from_secs(self.dial.deadline_secs))
            .with_probe_timeout(Duration::from_secs(self.dial.probe_timeout_secs))
            .with_retry_interval(Duration::from_secs(self.dial.retry_interval_secs))
    }

    /// Pool configuration from the `[pool]` and `[dial]` sections
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        let failure_policy = match self.pool.failure_mode {
            FailureMode::Remember => FailurePolicy::Remember,
            FailureMode::Retry => {
                FailurePolicy::RetryAfter(Duration::from_secs(self.pool.retry_cooldown_secs))
            }
        };

        PoolConfig::new()
            .with_session_limit(self.pool.session_limit)
            .with_dial(self.dial_config())
            .with_failure_policy(failure_policy)
    }
}
