//! Vigil Stream - Reference producer for the stream contract
//!
//! `DefaultStream` buffers written elements and delivers them only as far as
//! the subscriber's demand allows. It supports a single subscriber, normal
//! close, failure close and idempotent abort.

pub mod default;

pub use default::*;
