//! Azure Monitor custom metrics client
//!
//! Posts metric documents with a bearer token cached in a file. When the
//! endpoint reports the token as expired or invalid, a new one is requested
//! with the client-credentials grant, written back to the cache file, and
//! the submission is retried.

use super::emitter::{EmitError, MetricEmitter};
use super::payload::CustomMetric;
use crate::config::AzureSection;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
const MONITORING_RESOURCE: &str = "https://monitoring.azure.com/";

/// Azure Monitor client configuration
#[derive(Debug, Clone)]
pub struct AzureMonitorConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub resource_id: String,
    pub access_token_path: PathBuf,
    pub monitoring_base_url: String,
    pub login_base_url: String,
    pub timeout: Duration,
    /// HTTP submissions per `emit` call, including token refresh retries
    pub attempts: u32,
}

impl AzureMonitorConfig {
    pub fn from_section(section: &AzureSection) -> Self {
        Self {
            tenant_id: section.tenant_id.clone(),
            client_id: section.client_id.clone(),
            client_secret: section.client_secret.clone(),
            resource_id: section.resource_id.clone(),
            access_token_path: PathBuf::from(&section.access_token_path),
            monitoring_base_url: format!("https://{}.monitoring.azure.com", section.region),
            login_base_url: LOGIN_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
            attempts: 3,
        }
    }

    pub fn metrics_url(&self) -> String {
        format!(
            "{}/{}/metrics",
            self.monitoring_base_url.trim_end_matches('/'),
            self.resource_id.trim_start_matches('/')
        )
    }

    pub fn token_url(&self) -> String {
        format!(
            "{}/{}/oauth2/token",
            self.login_base_url.trim_end_matches('/'),
            self.tenant_id
        )
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Error")]
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "Code")]
    code: String,
}

/// Result of one metric POST
#[derive(Debug, PartialEq)]
enum SubmitOutcome {
    Accepted,
    TokenRejected(String),
    Rejected { status: u16, body: String },
}

/// Classify a non-success response body (pure function)
fn classify_failure(status: u16, body: String) -> SubmitOutcome {
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(response) if matches!(response.error.code.as_str(), "TokenExpired" | "InvalidToken") => {
            SubmitOutcome::TokenRejected(response.error.code)
        }
        _ => SubmitOutcome::Rejected { status, body },
    }
}

/// HTTP emitter for Azure Monitor custom metrics
pub struct AzureMonitorEmitter {
    config: AzureMonitorConfig,
    client: Client,
}

impl AzureMonitorEmitter {
    pub fn new(config: AzureMonitorConfig) -> Result<Self, EmitError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Read the cached token, creating an empty cache file if missing
    async fn read_cached_token(&self) -> Result<String, EmitError> {
        match tokio::fs::read_to_string(&self.config.access_token_path).await {
            Ok(token) => Ok(token.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::write(&self.config.access_token_path, "").await?;
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Request a new token and persist it to the cache file
    async fn refresh_token(&self) -> Result<String, EmitError> {
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("resource", MONITORING_RESOURCE),
        ];

        let response = self
            .client
            .post(self.config.token_url())
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EmitError::TokenRefresh(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| EmitError::TokenRefresh(e.to_string()))?;

        debug!("Saving access token to {}", self.config.access_token_path.display());
        tokio::fs::write(&self.config.access_token_path, &token.access_token).await?;
        Ok(token.access_token)
    }

    async fn submit(&self, body: &str, token: &str) -> Result<SubmitOutcome, EmitError> {
        let response = self
            .client
            .post(self.config.metrics_url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .bearer_auth(token)
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(SubmitOutcome::Accepted);
        }
        let text = response.text().await.unwrap_or_default();
        Ok(classify_failure(status.as_u16(), text))
    }
}

#[async_trait]
impl MetricEmitter for AzureMonitorEmitter {
    async fn emit(&self, metric: &CustomMetric) -> Result<(), EmitError> {
        let body = serde_json::to_string(metric)?;
        let mut token = self.read_cached_token().await?;

        for _ in 0..self.config.attempts {
            match self.submit(&body, &token).await? {
                SubmitOutcome::Accepted => {
                    debug!(metric = %metric.metric_name(), "Metric accepted");
                    return Ok(());
                }
                SubmitOutcome::TokenRejected(code) => {
                    info!("Stored access token was rejected ({code}), getting a new access token");
                    token = self.refresh_token().await?;
                }
                SubmitOutcome::Rejected { status, body } => {
                    warn!("Metric request failed with status {status}: {body}");
                    return Err(EmitError::Rejected { status, body });
                }
            }
        }

        Err(EmitError::AttemptsExhausted(self.config.attempts))
    }
}
