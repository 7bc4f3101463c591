//! Vigil Core - Fundamental types and primitives
//!
//! This crate defines the contract shared by every Vigil crate:
//! - The push-style, demand-regulated stream contract (StreamMessage, Subscriber, Subscription)
//! - Timeout policies (TimeoutMode)
//! - Error taxonomy (StreamError, TimeoutError)
//! - Execution contexts and the timer service (Executor, TimerService, TimerHandle)
//! - The once-only completion event (Completion)

pub mod completion;
pub mod error;
pub mod executor;
pub mod mode;
pub mod stream;

pub use completion::*;
pub use error::*;
pub use executor::*;
pub use mode::*;
pub use stream::*;
