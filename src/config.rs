//! Configuration for the transit monitor
//!
//! Configuration is read either from the process environment (the deployment
//! default) or from a TOML file. Both sources produce the same
//! [`MonitorConfig`] and go through the same validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// One MQTT topic to sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    /// Broker host name or IP address
    pub address: String,
    /// Topic filter, may contain `+` and `#` wildcards
    pub name: String,
    /// Broker TCP port
    pub port: u16,
}

impl Topic {
    pub fn new(address: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            port,
        }
    }

    /// Identity key `address:name:port` used as the metric dimension
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.address, self.name, self.port)
    }

    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorConfig {
    /// Shorter monitor period and log-only metric emission
    #[serde(default)]
    pub is_debug: bool,
    #[serde(default)]
    pub mqtt: MqttSection,
    pub azure: Option<AzureSection>,
    pub pulsar: Option<PulsarSection>,
    pub gtfsrt: Option<GtfsrtSection>,
}

/// MQTT sampler section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// MQTT keep-alive; disconnects are detected after roughly twice this
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Measurement cycle length. Defaults to 60, or 20 in debug mode.
    pub monitor_period_secs: Option<u64>,
    /// Upper bound for waiting on CONNACK, 0 disables the bound
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            keep_alive_secs: default_keep_alive(),
            monitor_period_secs: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_keep_alive() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    30
}

/// Azure Monitor custom metrics section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AzureSection {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Resource the custom metrics are reported for
    pub resource_id: String,
    /// File the bearer token is cached in between runs
    pub access_token_path: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "westeurope".to_string()
}

/// Pulsar admin API section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PulsarSection {
    pub admin_url: String,
    pub namespace: String,
    #[serde(default = "default_rate_in_topics")]
    pub msg_rate_in_topics: Vec<String>,
    #[serde(default = "default_rate_out_topics")]
    pub msg_rate_out_topics: Vec<String>,
    #[serde(default = "default_storage_size_topics")]
    pub storage_size_topics: Vec<String>,
    #[serde(default = "default_backlog_topics")]
    pub backlog_topics: Vec<String>,
    /// Subscription whose backlog is reported for each backlog topic
    #[serde(default = "default_backlog_subscription")]
    pub backlog_subscription: String,
}

impl PulsarSection {
    pub fn new(admin_url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            admin_url: admin_url.into(),
            namespace: namespace.into(),
            msg_rate_in_topics: default_rate_in_topics(),
            msg_rate_out_topics: default_rate_out_topics(),
            storage_size_topics: default_storage_size_topics(),
            backlog_topics: default_backlog_topics(),
            backlog_subscription: default_backlog_subscription(),
        }
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_rate_in_topics() -> Vec<String> {
    to_strings(&[
        "hfp-mqtt-raw/v2",
        "hfp-mqtt-raw/apc",
        "hfp-mqtt-raw/partial-apc",
        "hfp-mqtt-raw-deduplicated/v2",
        "hfp-mqtt-raw-deduplicated/apc",
        "hfp-mqtt-raw-deduplicated/partial-apc",
        "hfp/v2",
        "hfp/expanded-apc",
        "hfp/expanded-apc-mqtt-backfeed",
        "gtfs-rt/feedmessage-vehicleposition",
        "metro-ats-mqtt-raw/metro-estimate",
        "metro-ats-mqtt-raw-deduplicated/metro-estimate",
        "source-metro-ats/metro-estimate",
        "source-pt-roi/arrival",
        "source-pt-roi/departure",
        "internal-messages/pubtrans-stop-estimate",
        "internal-messages/feedmessage-tripupdate",
        "gtfs-rt/feedmessage-tripupdate",
        "internal-messages/stop-cancellation",
    ])
}

fn default_rate_out_topics() -> Vec<String> {
    to_strings(&[
        "hfp-mqtt-raw/v2",
        "hfp/passenger-count",
        "gtfs-rt/feedmessage-vehicleposition",
        "gtfs-rt/feedmessage-tripupdate",
    ])
}

fn default_storage_size_topics() -> Vec<String> {
    to_strings(&["hfp/v2", "gtfs-rt/feedmessage-vehicleposition"])
}

fn default_backlog_topics() -> Vec<String> {
    to_strings(&["hfp/v2"])
}

fn default_backlog_subscription() -> String {
    "transitdata_partial_apc_expander_combiner_hfp".to_string()
}

/// GTFS-Realtime poller section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GtfsrtSection {
    pub urls: Vec<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid topic entry {key}: {reason}")]
    InvalidTopic { key: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MonitorConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: MonitorConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key/value lookup
    ///
    /// Sections other than `mqtt` are only present when their first required
    /// variable is set; missing companions are reported as errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_debug = lookup("IS_DEBUG").as_deref() == Some("True");

        let mqtt = MqttSection {
            topics: topics_from_lookup(&lookup)?,
            keep_alive_secs: parse_optional_u64(&lookup, "MQTT_KEEP_ALIVE_SECS")?
                .unwrap_or_else(default_keep_alive),
            monitor_period_secs: parse_optional_u64(&lookup, "MONITOR_PERIOD_SECS")?,
            connect_timeout_secs: parse_optional_u64(&lookup, "MQTT_CONNECT_TIMEOUT_SECS")?
                .unwrap_or_else(default_connect_timeout),
        };

        let azure = match lookup("TENANT_ID") {
            Some(tenant_id) => Some(AzureSection {
                tenant_id,
                client_id: required(&lookup, "CLIENT_ID")?,
                client_secret: required(&lookup, "CLIENT_SECRET")?,
                resource_id: required(&lookup, "MONITOR_DATA_COLLECTOR_RESOURCE_ID")?,
                access_token_path: required(&lookup, "ACCESS_TOKEN_PATH")?,
                region: lookup("AZURE_REGION").unwrap_or_else(default_region),
            }),
            None => None,
        };

        let pulsar = match lookup("ADMIN_URL") {
            Some(admin_url) => Some(PulsarSection::new(
                admin_url,
                required(&lookup, "NAMESPACE")?,
            )),
            None => None,
        };

        let gtfsrt = lookup("GTFSRT_URLS").map(|urls| GtfsrtSection {
            urls: urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
        });

        let config = MonitorConfig {
            is_debug,
            mqtt,
            azure,
            pulsar,
            gtfsrt,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "MQTT keep-alive must be at least one second".to_string(),
            ));
        }
        if self.mqtt.monitor_period_secs == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "Monitor period must be at least one second".to_string(),
            ));
        }
        if let Some(pulsar) = &self.pulsar {
            validate_url("pulsar admin_url", &pulsar.admin_url)?;
        }
        if let Some(gtfsrt) = &self.gtfsrt {
            for feed in &gtfsrt.urls {
                validate_url("gtfsrt url", feed)?;
            }
        }
        for (index, topic) in self.mqtt.topics.iter().enumerate() {
            if topic.address.is_empty() || topic.name.is_empty() {
                return Err(ConfigError::InvalidTopic {
                    key: format!("topics[{index}]"),
                    reason: "address and topic name are required".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Length of one measurement cycle
    pub fn monitor_period(&self) -> Duration {
        let default = if self.is_debug { 20 } else { 60 };
        Duration::from_secs(self.mqtt.monitor_period_secs.unwrap_or(default))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.mqtt.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Azure section, required unless running in debug mode
    pub fn require_azure(&self) -> Result<&AzureSection, ConfigError> {
        self.azure
            .as_ref()
            .ok_or_else(|| ConfigError::EnvVarNotFound("TENANT_ID".to_string()))
    }

    pub fn require_pulsar(&self) -> Result<&PulsarSection, ConfigError> {
        self.pulsar
            .as_ref()
            .ok_or_else(|| ConfigError::EnvVarNotFound("ADMIN_URL".to_string()))
    }

    pub fn require_gtfsrt(&self) -> Result<&GtfsrtSection, ConfigError> {
        self.gtfsrt
            .as_ref()
            .ok_or_else(|| ConfigError::EnvVarNotFound("GTFSRT_URLS".to_string()))
    }
}

fn validate_url(field: &str, value: &str) -> Result<(), ConfigError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        Ok(parsed) => Err(ConfigError::InvalidConfig(format!(
            "{field} must use http or https, got '{}'",
            parsed.scheme()
        ))),
        Err(e) => Err(ConfigError::InvalidConfig(format!(
            "{field} '{value}' is not a valid URL: {e}"
        ))),
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).ok_or_else(|| ConfigError::EnvVarNotFound(key.to_string()))
}

fn parse_optional_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| {
            value.trim().parse::<u64>().map_err(|_| {
                ConfigError::InvalidConfig(format!("{key} must be a whole number, got '{value}'"))
            })
        })
        .transpose()
}

/// Read `TOPIC1`, `TOPIC2`, ... until the first missing index
pub fn topics_from_lookup<F>(lookup: &F) -> Result<Vec<Topic>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut topics = Vec::new();
    for index in 1.. {
        let key = format!("TOPIC{index}");
        match lookup(&key) {
            Some(entry) => topics.push(parse_topic_entry(&key, &entry)?),
            None => break,
        }
    }
    Ok(topics)
}

/// Parse one `address,topic,port` entry
pub fn parse_topic_entry(key: &str, entry: &str) -> Result<Topic, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidTopic {
        key: key.to_string(),
        reason: format!("{reason}, expected address,topic,port but got '{entry}'"),
    };

    if entry.matches(',').count() != 2 {
        return Err(invalid("wrong number of fields"));
    }

    let mut fields = entry.split(',').map(str::trim);
    let (address, name, port) = match (fields.next(), fields.next(), fields.next()) {
        (Some(a), Some(n), Some(p)) => (a, n, p),
        _ => return Err(invalid("wrong number of fields")),
    };

    if address.is_empty() || name.is_empty() || port.is_empty() {
        return Err(invalid("empty field"));
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| invalid("port is not a valid number"))?;

    Ok(Topic::new(address, name, port))
}
