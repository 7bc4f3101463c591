//! Error types for Vigil streams

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::TimeoutMode;

/// Raised when the armed deadline elapses before the policy-defined progress
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stream timed out: no progress within {deadline:?} ({mode})")]
pub struct TimeoutError {
    /// The deadline that elapsed
    pub deadline: Duration,
    /// The policy that armed it
    pub mode: TimeoutMode,
}

impl TimeoutError {
    pub fn new(deadline: Duration, mode: TimeoutMode) -> Self {
        TimeoutError { deadline, mode }
    }
}

/// Core stream errors
#[derive(Error, Debug, Clone)]
pub enum StreamError {
    // Configuration errors
    #[error("Invalid deadline: {0:?} (must be positive)")]
    InvalidDeadline(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Liveness errors
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    // Lifecycle errors
    #[error("Stream aborted")]
    Aborted,

    #[error("Subscription cancelled")]
    Cancelled,

    #[error("Stream already subscribed")]
    AlreadySubscribed,

    #[error("Invalid demand: {0} (must be positive)")]
    InvalidDemand(u64),

    // Producer errors
    #[error("Upstream failure: {0}")]
    Upstream(Arc<dyn std::error::Error + Send + Sync>),
}

impl StreamError {
    /// Wrap a producer failure
    pub fn upstream<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StreamError::Upstream(Arc::new(err))
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout(_))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;
