//! Cross-cutting helpers.
//!
//! - [`backoff`] - retry delay schedules
//! - [`breaker`] - counting circuit breaker
//! - [`shutdown`] - signal-driven cancellation
//! - [`telemetry`] - tracing and OpenTelemetry setup

pub mod backoff;
pub mod breaker;
pub mod shutdown;
pub mod telemetry;

pub use shutdown::*;
pub use telemetry::*;
