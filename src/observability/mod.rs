//! Observability for the transit monitor
//!
//! Structured logging via `tracing`; the monitor has no other telemetry
//! surface of its own besides the metrics it forwards.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
