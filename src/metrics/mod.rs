//! Custom metric payloads and their delivery to Azure Monitor

pub mod azure;
pub mod emitter;
pub mod payload;

pub use azure::{AzureMonitorConfig, AzureMonitorEmitter};
pub use emitter::{
    emit_rate_snapshot, emit_with_backoff, EmitError, EmitRetryPolicy, LogEmitter, MetricEmitter,
};
pub use payload::{
    rate_metric, sanitize_dimension_value, CustomMetric, MetricValue, RateSnapshot, SeriesEntry,
    TopicRate,
};
