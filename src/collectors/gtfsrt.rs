//! GTFS-Realtime feed poller
//!
//! Downloads each configured feed, counts its entities and measures how old
//! the feed header timestamp is.

use super::CollectorError;
use crate::metrics::{CustomMetric, MetricEmitter, MetricValue, SeriesEntry};
use chrono::{DateTime, Utc};
use prost::Message;
use reqwest::Client;
use std::time::Duration;
use tracing::{error, info};

pub const GTFSRT_NAMESPACE: &str = "GTFSRT";
pub const URL_DIMENSION: &str = "URL";
pub const METRIC_ENTITY_COUNT: &str = "Entity Count";
pub const METRIC_TIMESTAMP_AGE: &str = "Timestamp Age";

/// Subset of `transit_realtime.FeedMessage`; unknown fields are skipped
#[derive(Clone, PartialEq, prost::Message)]
pub struct FeedMessage {
    #[prost(message, optional, tag = "1")]
    pub header: Option<FeedHeader>,
    #[prost(message, repeated, tag = "2")]
    pub entity: Vec<FeedEntity>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FeedHeader {
    #[prost(string, required, tag = "1")]
    pub gtfs_realtime_version: String,
    /// POSIX seconds
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FeedEntity {
    #[prost(string, required, tag = "1")]
    pub id: String,
    #[prost(bool, optional, tag = "2")]
    pub is_deleted: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedStats {
    pub entity_count: usize,
    /// Seconds since the feed header timestamp; a missing timestamp counts as 0
    pub timestamp_age_secs: i64,
}

pub fn feed_stats(feed: &FeedMessage, now_unix: i64) -> FeedStats {
    let published = feed
        .header
        .as_ref()
        .and_then(|h| h.timestamp)
        .and_then(|t| i64::try_from(t).ok())
        .unwrap_or(0);
    FeedStats {
        entity_count: feed.entity.len(),
        timestamp_age_secs: now_unix - published,
    }
}

/// `Entity Count` and `Timestamp Age` for one feed
pub fn build_metrics(url: &str, stats: &FeedStats, time: DateTime<Utc>) -> Vec<CustomMetric> {
    let metric = |name: &str, value: MetricValue| {
        CustomMetric::new(
            time,
            name,
            GTFSRT_NAMESPACE,
            URL_DIMENSION,
            vec![SeriesEntry::new(url, value)],
        )
    };
    vec![
        metric(
            METRIC_ENTITY_COUNT,
            MetricValue::from_count(stats.entity_count as u64),
        ),
        metric(
            METRIC_TIMESTAMP_AGE,
            MetricValue::Integer(stats.timestamp_age_secs),
        ),
    ]
}

pub struct GtfsrtPoller {
    urls: Vec<String>,
    client: Client,
}

impl GtfsrtPoller {
    pub fn new(urls: Vec<String>) -> Result<Self, CollectorError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { urls, client })
    }

    pub async fn fetch_feed(&self, url: &str) -> Result<FeedMessage, CollectorError> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(FeedMessage::decode(bytes)?)
    }

    /// Poll every feed and send its metrics; returns the number accepted
    pub async fn run(&self, emitter: &dyn MetricEmitter) -> usize {
        let mut sent = 0;
        for url in &self.urls {
            let feed = match self.fetch_feed(url).await {
                Ok(feed) => feed,
                Err(e) => {
                    error!("Failed to read GTFS-RT feed {url}: {e}");
                    continue;
                }
            };

            let now = Utc::now();
            let stats = feed_stats(&feed, now.timestamp());
            info!(
                url = %url,
                entities = stats.entity_count,
                age_secs = stats.timestamp_age_secs,
                "Polled GTFS-RT feed"
            );

            for metric in build_metrics(url, &stats, now) {
                match emitter.emit(&metric).await {
                    Ok(()) => sent += 1,
                    Err(e) => error!("Failed to send {} for {url}: {e}", metric.metric_name()),
                }
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(entities: usize, timestamp: Option<u64>) -> FeedMessage {
        FeedMessage {
            header: Some(FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp,
            }),
            entity: (0..entities)
                .map(|i| FeedEntity {
                    id: format!("vehicle-{i}"),
                    is_deleted: None,
                })
                .collect(),
        }
    }

    #[test]
    fn test_feed_stats() {
        let stats = feed_stats(&feed(3, Some(1_700_000_000)), 1_700_000_042);
        assert_eq!(
            stats,
            FeedStats {
                entity_count: 3,
                timestamp_age_secs: 42
            }
        );
    }

    #[test]
    fn test_decode_skips_unknown_fields() {
        let bytes = feed(2, Some(10)).encode_to_vec();
        let decoded = FeedMessage::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded.entity.len(), 2);
        assert_eq!(decoded.header.and_then(|h| h.timestamp), Some(10));
    }

    #[test]
    fn test_build_metrics() {
        let stats = FeedStats {
            entity_count: 120,
            timestamp_age_secs: 5,
        };
        let metrics = build_metrics("https://example.org/vp", &stats, Utc::now());
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].metric_name(), METRIC_ENTITY_COUNT);
        assert_eq!(metrics[0].series()[0].sum, MetricValue::Integer(120));
        assert_eq!(metrics[1].metric_name(), METRIC_TIMESTAMP_AGE);
        assert_eq!(metrics[1].series()[0].dim_values, vec!["https://example.org/vp"]);
        assert_eq!(metrics[1].data.base_data.dim_names, vec![URL_DIMENSION]);
    }
}
