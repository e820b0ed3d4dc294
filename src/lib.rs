//! Transit data pipeline monitor
//!
//! Samples message rates of MQTT topics, polls Pulsar topic statistics and
//! GTFS-Realtime feeds, and forwards the results as Azure Monitor custom
//! metrics.
//!
//! # Overview
//!
//! - [`sampler`] - long-running MQTT topic-rate sampler
//! - [`collectors`] - one-shot Pulsar and GTFS-RT collectors
//! - [`metrics`] - custom metric payloads and their transports
//! - [`config`] - environment and TOML configuration
//!
//! # Quick Start
//!
//! ```rust
//! use chrono::Utc;
//! use transit_monitor::metrics::{rate_metric, TopicRate};
//!
//! let snapshot = vec![TopicRate::new("mqtt.example.org:/hfp/v2/#:1883", 15.3)];
//! let metric = rate_metric(&snapshot, Utc::now()).unwrap();
//! let json = serde_json::to_string(&metric).unwrap();
//! assert!(json.contains("\"dimValues\":[\"mqtt.example.org:/hfp/v2/*:1883\"]"));
//! ```

pub mod collectors;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod sampler;
pub mod testing;

pub use config::{MonitorConfig, Topic};
pub use error::{MonitorError, MonitorResult};
pub use metrics::{CustomMetric, MetricEmitter};
pub use sampler::TopicSupervisor;
