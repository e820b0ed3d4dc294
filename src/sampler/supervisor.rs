//! Measurement cycle driver
//!
//! Owns one [`BrokerConnection`] per topic. Every period it drains all rate
//! windows into a snapshot, hands the snapshot to a detached emission task,
//! and restarts every connection that is not subscribed.

use super::connection::{BrokerConnection, ConnectionSettings, ConnectionState};
use crate::config::{MonitorConfig, Topic};
use crate::cycle_span;
use crate::metrics::{emit_rate_snapshot, EmitRetryPolicy, MetricEmitter, RateSnapshot, TopicRate};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, Instrument};

pub struct TopicSupervisor {
    connections: Vec<BrokerConnection>,
    period: Duration,
    emitter: Arc<dyn MetricEmitter>,
    retry_policy: EmitRetryPolicy,
}

impl TopicSupervisor {
    pub fn new(
        topics: Vec<Topic>,
        settings: ConnectionSettings,
        period: Duration,
        emitter: Arc<dyn MetricEmitter>,
        retry_policy: EmitRetryPolicy,
    ) -> Self {
        let connections = topics
            .into_iter()
            .map(|topic| BrokerConnection::new(topic, settings))
            .collect();
        Self {
            connections,
            period,
            emitter,
            retry_policy,
        }
    }

    pub fn from_config(config: &MonitorConfig, emitter: Arc<dyn MetricEmitter>) -> Self {
        let settings = ConnectionSettings {
            keep_alive: config.keep_alive(),
            connect_timeout: config.connect_timeout(),
        };
        Self::new(
            config.mqtt.topics.clone(),
            settings,
            config.monitor_period(),
            emitter,
            EmitRetryPolicy::default(),
        )
    }

    pub fn connections(&self) -> &[BrokerConnection] {
        &self.connections
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Drain every connection's rate window, skipping topics without data
    pub async fn collect_snapshot(&self) -> RateSnapshot {
        let mut snapshot = Vec::with_capacity(self.connections.len());
        for connection in &self.connections {
            if let Some(rate) = connection.take_rate(Instant::now()).await {
                snapshot.push(TopicRate::new(connection.topic().key(), rate));
            }
        }
        snapshot
    }

    /// Start a connection attempt for every topic that is not subscribed
    ///
    /// Returns how many new attempts were started.
    pub async fn restart_stopped(&self) -> usize {
        let mut started = 0;
        for connection in &self.connections {
            let state = connection.state().await;
            if state == ConnectionState::Subscribed {
                continue;
            }
            if state != ConnectionState::Connecting {
                info!(
                    "Topic {} was not running ({state:?}), starting it",
                    connection.topic().name
                );
            }
            if connection.start().await {
                started += 1;
            }
        }
        started
    }

    /// One measurement cycle: snapshot, detached emission, reconnection pass
    pub async fn run_cycle(&self) -> JoinHandle<bool> {
        let snapshot = self.collect_snapshot().await;
        debug!(topics = snapshot.len(), "Collected rate snapshot");

        let emission = tokio::spawn(
            emit_rate_snapshot(self.emitter.clone(), snapshot, self.retry_policy.clone())
                .in_current_span(),
        );

        self.restart_stopped().await;
        emission
    }

    /// Run forever, one cycle per period
    pub async fn run(&self) {
        info!(
            topics = self.connections.len(),
            "Starting MQTT topic listener, period {:?}",
            self.period
        );
        self.restart_stopped().await;

        run_on_schedule(self.period, move |cycle| async move {
            // Emission handles are dropped; the task keeps running detached
            let _ = self.run_cycle().instrument(cycle_span!(cycle)).await;
        })
        .await
    }
}

/// Call `cycle` with an increasing cycle number, once per `period`
///
/// The first call happens one period after start. Each next deadline is
/// measured from the wake-up, so a cycle that overruns its period is followed
/// immediately and does not shorten the ones after it.
pub async fn run_on_schedule<F, Fut>(period: Duration, mut cycle: F)
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut deadline = Instant::now() + period;
    let mut count: u64 = 0;
    loop {
        let now = Instant::now();
        if deadline > now {
            debug!("Sleeping for {:?}", deadline - now);
            tokio::time::sleep_until(deadline).await;
        }
        deadline = Instant::now() + period;

        count += 1;
        cycle(count).await;
    }
}
