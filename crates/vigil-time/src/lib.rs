//! Vigil Time - Execution contexts for stream subscriptions
//!
//! This crate implements the scheduling substrate:
//! - EventLoop: a tokio task draining a serial job queue, timers on tokio::time
//! - ManualEventLoop: a deterministic virtual-time loop driven by the caller

pub mod event_loop;
pub mod manual;

pub use event_loop::*;
pub use manual::*;
