//! Shared utilities for mcpauth.
//!
//! - Logging setup with tracing
//! - Wall-clock helpers used for token expiry and lockfile timestamps
//! - RAII timing of remote calls

pub mod clock;
pub mod log;
pub mod timing;

pub use clock::{now_millis, now_secs};
pub use log::{LogConfig, LogLevel};
pub use timing::TimingGuard;
