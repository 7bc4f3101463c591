//! Vigil Test Harness - Deadline enforcement validation
//!
//! This crate provides:
//! - Recording and scripted subscribers
//! - Timeline simulation on virtual time
//! - The reference scenario catalog, on virtual time and on tokio
//! - Property checks for every timeout mode

pub mod properties;
pub mod recording;
pub mod scenarios;
pub mod timeline;

pub use properties::*;
pub use recording::*;
pub use scenarios::*;
pub use timeline::*;

use tracing_subscriber::EnvFilter;

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
