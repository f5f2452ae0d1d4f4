//! Pool and dial configuration

use std::time::Duration;

use crate::error::ExecError;

/// Default number of concurrent sessions per connection
pub const DEFAULT_SESSION_LIMIT: usize = 5;

/// Retry and timeout policy for establishing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialConfig {
    /// Timeout of a single reachability probe
    pub probe_timeout: Duration,
    /// Pause between failed probes
    pub retry_interval: Duration,
    /// Overall deadline for the host to become reachable
    pub deadline: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(60),
        }
    }
}

impl DialConfig {
    /// Set the overall reachability deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the per-probe timeout
    #[must_use]
    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    /// Set the pause between probes
    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Check every duration is non-zero
    ///
    /// A zero probe timeout fails every probe; a zero retry interval spins
    /// on connect until the deadline.
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` naming the zero field
    pub fn validate(&self) -> Result<(), ExecError> {
        let fields = [
            ("deadline", self.deadline),
            ("probe_timeout", self.probe_timeout),
            ("retry_interval", self.retry_interval),
        ];
        for (name, value) in fields {
            if value.is_zero() {
                return Err(ExecError::ConfigError(format!(
                    "dial {name} must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

/// What the pool does with an identity whose dial failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep returning the recorded error for the lifetime of the pool
    /// (until the identity is evicted)
    Remember,
    /// Dial again on the first acquire after the cooldown has elapsed
    RetryAfter(Duration),
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::RetryAfter(Duration::ZERO)
    }
}

/// Configuration applied to every connection a pool creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrent sessions per connection
    pub session_limit: usize,
    /// Default dial policy for `acquire`
    pub dial: DialConfig,
    /// Handling of failed dials
    pub failure_policy: FailurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_limit: DEFAULT_SESSION_LIMIT,
            dial: DialConfig::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl PoolConfig {
    /// Defaults: 5 sessions, 60s dial deadline, failed dials retried immediately
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-connection session limit
    #[must_use]
    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.session_limit = limit;
        self
    }

    /// Set the default dial policy
    #[must_use]
    pub fn with_dial(mut self, dial: DialConfig) -> Self {
        self.dial = dial;
        self
    }

    /// Set the failed-dial policy
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for a session limit outside
    /// `1..=Semaphore::MAX_PERMITS` or a zero dial duration
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.session_limit == 0 {
            return Err(ExecError::ConfigError(
                "session_limit must be at least 1".to_string(),
            ));
        }
        if self.session_limit > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ExecError::ConfigError(format!(
                "session_limit must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        self.dial.validate()
    }
}
