//! MQTT topic-rate sampler
//!
//! # Architecture
//!
//! - [`window`] - pure rate computation over a measurement window
//! - [`connection`] - per-topic connection state machine and its network task
//! - [`supervisor`] - periodic cycle: snapshot, emit, reconnect
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use transit_monitor::config::MonitorConfig;
//! use transit_monitor::metrics::LogEmitter;
//! use transit_monitor::sampler::TopicSupervisor;
//!
//! # tokio_test::block_on(async {
//! let config = MonitorConfig::from_env()?;
//! let supervisor = TopicSupervisor::from_config(&config, Arc::new(LogEmitter));
//! supervisor.run().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod connection;
pub mod supervisor;
pub mod window;

pub use connection::{
    route_event, BrokerConnection, ConnectionSettings, ConnectionState, ConnectionTracker,
    EventRoute,
};
pub use supervisor::{run_on_schedule, TopicSupervisor};
pub use window::{compute_rate, minimum_window, MeasurementWindow};
