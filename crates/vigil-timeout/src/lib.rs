//! Vigil Timeout - Liveness deadlines for demand-regulated streams
//!
//! Wrapping a stream installs a guard between the producer and the consumer
//! of every subscription. The guard forwards all signals unchanged, keeps one
//! deadline timer armed according to the TimeoutMode, and when the timer
//! fires it cancels the upstream subscription and fails the consumer with a
//! TimeoutError. The consumer sees exactly one terminal signal.
//!
//! ```ignore
//! use std::time::Duration;
//! use vigil_core::TimeoutMode;
//! use vigil_timeout::StreamTimeoutExt;
//!
//! let guarded = stream.timeout(Duration::from_secs(1), TimeoutMode::UntilNext)?;
//! guarded.subscribe(consumer, executor, &[]);
//! ```

pub mod config;
pub mod guard;
pub mod transition;
pub mod wrapper;

pub use config::*;
pub use guard::*;
pub use transition::*;
pub use wrapper::*;
