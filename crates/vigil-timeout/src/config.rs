//! Timeout configuration

use std::time::Duration;

use vigil_core::{StreamError, StreamResult, TimeoutMode};

/// Environment variable holding the deadline, e.g. `1500ms` or `2s`
pub const ENV_TIMEOUT: &str = "VIGIL_STREAM_TIMEOUT";

/// Environment variable holding the mode, e.g. `UNTIL_FIRST`
pub const ENV_TIMEOUT_MODE: &str = "VIGIL_STREAM_TIMEOUT_MODE";

/// Deadline and policy for a timeout stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Maximum permitted delay under `mode`
    pub deadline: Duration,
    /// Which progress event the deadline measures
    pub mode: TimeoutMode,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            deadline: Duration::from_secs(10),
            mode: TimeoutMode::UntilNext,
        }
    }
}

impl TimeoutConfig {
    pub fn new(deadline: Duration, mode: TimeoutMode) -> Self {
        TimeoutConfig { deadline, mode }
    }

    /// Interactive feeds: every element within a second
    pub fn interactive() -> Self {
        TimeoutConfig {
            deadline: Duration::from_secs(1),
            mode: TimeoutMode::UntilNext,
        }
    }

    /// Slow producers that must start within five seconds
    pub fn first_byte() -> Self {
        TimeoutConfig {
            deadline: Duration::from_secs(5),
            mode: TimeoutMode::UntilFirst,
        }
    }

    /// Bounded transfers: the whole stream within a minute
    pub fn whole_stream() -> Self {
        TimeoutConfig {
            deadline: Duration::from_secs(60),
            mode: TimeoutMode::UntilEos,
        }
    }

    /// A zero deadline is rejected
    pub fn validate(&self) -> StreamResult<()> {
        if self.deadline.is_zero() {
            return Err(StreamError::InvalidDeadline(self.deadline));
        }
        Ok(())
    }

    /// Defaults overridden by `VIGIL_STREAM_TIMEOUT` and `VIGIL_STREAM_TIMEOUT_MODE`
    pub fn from_env() -> StreamResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the env keys
    pub fn from_lookup<F>(lookup: F) -> StreamResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = TimeoutConfig::default();

        if let Some(raw) = lookup(ENV_TIMEOUT) {
            config.deadline = humantime::parse_duration(raw.trim()).map_err(|e| {
                StreamError::InvalidConfig(format!("{ENV_TIMEOUT}={raw:?}: {e}"))
            })?;
        }

        if let Some(raw) = lookup(ENV_TIMEOUT_MODE) {
            config.mode = raw.parse()?;
        }

        config.validate()?;
        Ok(config)
    }
}
