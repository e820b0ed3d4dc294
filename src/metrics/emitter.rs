//! Metric emission with escalating retry
//!
//! [`MetricEmitter`] is the dumb transport. The retry policy lives here, on
//! the caller side: after a failed submission wait 5 minutes, then 10
//! minutes, then give up.

use super::payload::{rate_metric, CustomMetric, RateSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Metric submission errors
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Metric rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Failed to serialize metric: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Access token cache error: {0}")]
    TokenCache(#[from] std::io::Error),
    #[error("Failed to obtain access token: {0}")]
    TokenRefresh(String),
    #[error("Access token still rejected after {0} attempts")]
    AttemptsExhausted(u32),
}

/// Transport for custom metrics
#[async_trait]
pub trait MetricEmitter: Send + Sync {
    async fn emit(&self, metric: &CustomMetric) -> Result<(), EmitError>;
}

/// Emitter that only logs the payload, used in debug mode
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmitter;

#[async_trait]
impl MetricEmitter for LogEmitter {
    async fn emit(&self, metric: &CustomMetric) -> Result<(), EmitError> {
        let payload = serde_json::to_string(metric)?;
        info!(metric = %metric.metric_name(), "{}", payload);
        Ok(())
    }
}

/// Delays between submission attempts of one payload
#[derive(Debug, Clone, PartialEq)]
pub struct EmitRetryPolicy {
    /// Wait before attempt n+2; attempts = backoff.len() + 1
    pub backoff: Vec<Duration>,
}

impl Default for EmitRetryPolicy {
    fn default() -> Self {
        Self {
            backoff: vec![Duration::from_secs(300), Duration::from_secs(600)],
        }
    }
}

impl EmitRetryPolicy {
    pub fn max_attempts(&self) -> usize {
        self.backoff.len() + 1
    }

    /// Delay after the given failed attempt (1-based), `None` when exhausted
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        self.backoff.get(attempt.checked_sub(1)?).copied()
    }
}

/// Submit one metric, retrying per policy; returns whether it was accepted
pub async fn emit_with_backoff(
    emitter: &dyn MetricEmitter,
    metric: &CustomMetric,
    policy: &EmitRetryPolicy,
) -> bool {
    for attempt in 1..=policy.max_attempts() {
        match emitter.emit(metric).await {
            Ok(()) => return true,
            Err(e) => match policy.delay_after(attempt) {
                Some(delay) => {
                    warn!(
                        "Sending {} failed ({}), trying again in {} seconds",
                        metric.metric_name(),
                        e,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        "Sending {} failed after {} attempts, dropping it: {}",
                        metric.metric_name(),
                        attempt,
                        e
                    );
                }
            },
        }
    }
    false
}

/// Build and submit the MQTT rate metric for one cycle
///
/// Takes ownership so it can run as a detached task.
pub async fn emit_rate_snapshot(
    emitter: Arc<dyn MetricEmitter>,
    snapshot: RateSnapshot,
    policy: EmitRetryPolicy,
) -> bool {
    let metric = match rate_metric(&snapshot, Utc::now()) {
        Some(metric) => metric,
        None => {
            info!("No MQTT data to send");
            return false;
        }
    };

    let sent = emit_with_backoff(emitter.as_ref(), &metric, &policy).await;
    if sent {
        info!(topics = snapshot.len(), "MQTT metrics sent at {}", metric.time);
    } else {
        error!("Failed to send MQTT metrics for {}", metric.time);
    }
    sent
}
