//! Mock implementations for testing

use crate::metrics::{CustomMetric, EmitError, MetricEmitter};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Mock emitter that records accepted metrics
///
/// The first `failures` calls to `emit` fail with a 503 rejection.
#[derive(Debug, Default)]
pub struct MockEmitter {
    pub emitted: Arc<Mutex<Vec<CustomMetric>>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl MockEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    /// Number of `emit` calls so far, successful or not
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn emitted(&self) -> Vec<CustomMetric> {
        self.emitted.lock().await.clone()
    }
}

#[async_trait]
impl MetricEmitter for MockEmitter {
    async fn emit(&self, metric: &CustomMetric) -> Result<(), EmitError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EmitError::Rejected {
                status: 503,
                body: "Mock emitter failure".to_string(),
            });
        }

        self.emitted.lock().await.push(metric.clone());
        Ok(())
    }
}
