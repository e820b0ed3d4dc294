//! Pulsar topic statistics collector
//!
//! Polls the Pulsar admin REST API once per configured topic and turns the
//! stats into four custom metrics: rate in, rate out, storage size and the
//! backlog of one subscription.

use super::CollectorError;
use crate::config::PulsarSection;
use crate::metrics::{CustomMetric, MetricEmitter, MetricValue, SeriesEntry};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const PULSAR_NAMESPACE: &str = "Pulsar";
pub const TOPIC_DIMENSION: &str = "Topic";
pub const METRIC_MSG_RATE_IN: &str = "Msg Rate In";
pub const METRIC_MSG_RATE_OUT: &str = "Msg Rate Out";
pub const METRIC_STORAGE_SIZE: &str = "Storage Size";
pub const METRIC_MSG_BACKLOG: &str = "Msg Backlog";

/// Fields of the admin API topic stats this collector uses
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicStats {
    #[serde(default)]
    pub msg_rate_in: f64,
    #[serde(default)]
    pub msg_rate_out: f64,
    #[serde(default)]
    pub storage_size: f64,
    #[serde(default)]
    pub subscriptions: HashMap<String, SubscriptionStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    #[serde(default)]
    pub msg_backlog: u64,
}

/// Stats URL; `v2` topics are partitioned
pub fn stats_url(admin_url: &str, namespace: &str, topic: &str) -> String {
    let endpoint = if topic.ends_with("v2") {
        "partitioned-stats"
    } else {
        "stats"
    };
    format!(
        "{}/admin/v2/persistent/{namespace}/{topic}/{endpoint}",
        admin_url.trim_end_matches('/')
    )
}

fn value_series<F>(stats: &BTreeMap<String, TopicStats>, topics: &[String], value: F) -> Vec<SeriesEntry>
where
    F: Fn(&TopicStats) -> f64,
{
    topics
        .iter()
        .filter_map(|topic| {
            stats
                .get(topic)
                .map(|s| SeriesEntry::new(topic.clone(), MetricValue::from_rate(value(s))))
        })
        .collect()
}

fn backlog_series(
    stats: &BTreeMap<String, TopicStats>,
    topics: &[String],
    subscription: &str,
) -> Vec<SeriesEntry> {
    topics
        .iter()
        .filter_map(|topic| {
            let backlog = stats.get(topic)?.subscriptions.get(subscription)?.msg_backlog;
            Some(SeriesEntry::new(topic.clone(), MetricValue::from_count(backlog)))
        })
        .collect()
}

/// Metrics for the collected stats; metrics without any series are omitted
pub fn build_metrics(
    section: &PulsarSection,
    stats: &BTreeMap<String, TopicStats>,
    time: DateTime<Utc>,
) -> Vec<CustomMetric> {
    let candidates = [
        (
            METRIC_MSG_RATE_IN,
            value_series(stats, &section.msg_rate_in_topics, |s| s.msg_rate_in),
        ),
        (
            METRIC_MSG_RATE_OUT,
            value_series(stats, &section.msg_rate_out_topics, |s| s.msg_rate_out),
        ),
        (
            METRIC_STORAGE_SIZE,
            value_series(stats, &section.storage_size_topics, |s| s.storage_size),
        ),
        (
            METRIC_MSG_BACKLOG,
            backlog_series(stats, &section.backlog_topics, &section.backlog_subscription),
        ),
    ];

    candidates
        .into_iter()
        .filter(|(_, series)| !series.is_empty())
        .map(|(name, series)| {
            CustomMetric::new(time, name, PULSAR_NAMESPACE, TOPIC_DIMENSION, series)
        })
        .collect()
}

pub struct PulsarCollector {
    section: PulsarSection,
    client: Client,
    fetch_attempts: u32,
}

impl PulsarCollector {
    pub fn new(section: PulsarSection) -> Result<Self, CollectorError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            section,
            client,
            fetch_attempts: 3,
        })
    }

    /// Every topic named in any of the metric lists, deduplicated
    pub fn topics(&self) -> BTreeSet<String> {
        self.section
            .msg_rate_in_topics
            .iter()
            .chain(&self.section.msg_rate_out_topics)
            .chain(&self.section.storage_size_topics)
            .chain(&self.section.backlog_topics)
            .cloned()
            .collect()
    }

    async fn fetch_topic_stats(&self, topic: &str) -> Result<TopicStats, CollectorError> {
        let url = stats_url(&self.section.admin_url, &self.section.namespace, topic);
        let stats = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<TopicStats>()
            .await?;
        debug!(
            topic,
            msg_rate_in = stats.msg_rate_in,
            msg_rate_out = stats.msg_rate_out,
            storage_size = stats.storage_size,
            "Fetched topic stats"
        );
        Ok(stats)
    }

    /// Fetch stats for every topic, skipping topics that keep failing
    pub async fn collect(&self) -> BTreeMap<String, TopicStats> {
        let mut collected = BTreeMap::new();
        for topic in self.topics() {
            for attempt in 1..=self.fetch_attempts {
                match self.fetch_topic_stats(&topic).await {
                    Ok(stats) => {
                        collected.insert(topic.clone(), stats);
                        break;
                    }
                    Err(e) if attempt < self.fetch_attempts => {
                        debug!("Attempt {attempt} to fetch stats of {topic} failed: {e}");
                    }
                    Err(e) => {
                        warn!(
                            "Failed to fetch stats of {topic} from {}, is Pulsar running and accepting requests? {e}",
                            self.section.admin_url
                        );
                    }
                }
            }
        }
        collected
    }

    /// Collect and send; returns the number of metrics accepted
    ///
    /// Send failures are logged per metric and do not stop the others.
    pub async fn run(&self, emitter: &dyn MetricEmitter) -> usize {
        let stats = self.collect().await;
        if stats.is_empty() {
            info!("Not sending metrics, no topic stats were collected");
            return 0;
        }

        let mut sent = 0;
        for metric in build_metrics(&self.section, &stats, Utc::now()) {
            match emitter.emit(&metric).await {
                Ok(()) => sent += 1,
                Err(e) => error!("Failed to send {}: {}", metric.metric_name(), e),
            }
        }
        info!("Pulsar metrics sent: {sent}");
        sent
    }
}
