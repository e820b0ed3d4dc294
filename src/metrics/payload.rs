//! Azure Monitor custom metric payload
//!
//! Shape of the JSON document accepted by the custom metrics ingestion
//! endpoint, plus the value rounding and dimension sanitizing applied to
//! every series entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MQTT_NAMESPACE: &str = "MQTT";
pub const MSG_COUNT_METRIC: &str = "Msg Count";
pub const TOPIC_DIMENSION: &str = "Topic";

/// Rate of one topic for one measurement cycle
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRate {
    pub key: String,
    pub rate: f64,
}

impl TopicRate {
    pub fn new(key: impl Into<String>, rate: f64) -> Self {
        Self {
            key: key.into(),
            rate,
        }
    }
}

/// Per-cycle rates in topic configuration order
pub type RateSnapshot = Vec<TopicRate>;

/// Series value, serialized as a JSON integer or float
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Decimal(f64),
}

impl MetricValue {
    /// Round to 2 decimals, or to a whole number above 10
    ///
    /// Whole numbers round half to even, so 12.5 becomes 12.
    pub fn from_rate(value: f64) -> Self {
        let rounded = (value * 100.0).round() / 100.0;
        if rounded.abs() > 10.0 {
            MetricValue::Integer(rounded.round_ties_even() as i64)
        } else {
            MetricValue::Decimal(rounded)
        }
    }

    pub fn from_count(count: u64) -> Self {
        MetricValue::Integer(i64::try_from(count).unwrap_or(i64::MAX))
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Integer(v) => v as f64,
            MetricValue::Decimal(v) => v,
        }
    }
}

/// One series entry, one per dimension value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry {
    #[serde(rename = "dimValues")]
    pub dim_values: Vec<String>,
    pub sum: MetricValue,
    pub count: u32,
}

impl SeriesEntry {
    pub fn new(dim_value: impl Into<String>, sum: MetricValue) -> Self {
        Self {
            dim_values: vec![dim_value.into()],
            sum,
            count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseData {
    pub metric: String,
    pub namespace: String,
    #[serde(rename = "dimNames")]
    pub dim_names: Vec<String>,
    pub series: Vec<SeriesEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricData {
    #[serde(rename = "baseData")]
    pub base_data: BaseData,
}

/// Complete custom metric document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetric {
    /// UTC, ISO-8601, seconds precision
    pub time: String,
    pub data: MetricData,
}

impl CustomMetric {
    pub fn new(
        time: DateTime<Utc>,
        metric: &str,
        namespace: &str,
        dimension: &str,
        series: Vec<SeriesEntry>,
    ) -> Self {
        Self {
            time: format_metric_time(time),
            data: MetricData {
                base_data: BaseData {
                    metric: metric.to_string(),
                    namespace: namespace.to_string(),
                    dim_names: vec![dimension.to_string()],
                    series,
                },
            },
        }
    }

    pub fn series(&self) -> &[SeriesEntry] {
        &self.data.base_data.series
    }

    pub fn metric_name(&self) -> &str {
        &self.data.base_data.metric
    }
}

pub fn format_metric_time(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Replace characters the ingestion endpoint rejects in dimension values
pub fn sanitize_dimension_value(value: &str) -> String {
    value.replace('#', "*").replace('+', "^")
}

/// One series entry per topic, in snapshot order
pub fn rate_series(snapshot: &[TopicRate]) -> Vec<SeriesEntry> {
    snapshot
        .iter()
        .map(|entry| {
            SeriesEntry::new(
                sanitize_dimension_value(&entry.key),
                MetricValue::from_rate(entry.rate),
            )
        })
        .collect()
}

/// MQTT message rate metric for one cycle, `None` when there is nothing to send
pub fn rate_metric(snapshot: &[TopicRate], time: DateTime<Utc>) -> Option<CustomMetric> {
    if snapshot.is_empty() {
        return None;
    }
    Some(CustomMetric::new(
        time,
        MSG_COUNT_METRIC,
        MQTT_NAMESPACE,
        TOPIC_DIMENSION,
        rate_series(snapshot),
    ))
}
