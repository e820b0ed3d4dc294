//! One-shot collectors for Pulsar topic stats and GTFS-RT feed health

pub mod gtfsrt;
pub mod pulsar;

use thiserror::Error;

pub use gtfsrt::{FeedStats, GtfsrtPoller};
pub use pulsar::{PulsarCollector, TopicStats};

/// Collector errors
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to decode feed: {0}")]
    Decode(#[from] prost::DecodeError),
}
