//! Crate-wide error type
//!
//! Each concern owns its own error enum; [`MonitorError`] gathers them for
//! the command entry points.

use crate::collectors::CollectorError;
use crate::config::ConfigError;
use crate::metrics::EmitError;
use thiserror::Error;

/// Main error type for monitor commands
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metric emission failed: {0}")]
    Emit(#[from] EmitError),

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for monitor commands
pub type MonitorResult<T> = Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_converts() {
        let error: MonitorError = ConfigError::EnvVarNotFound("TOPIC1".to_string()).into();
        assert!(matches!(error, MonitorError::Config(_)));
        assert_eq!(
            error.to_string(),
            "Configuration error: Environment variable not found: TOPIC1"
        );
    }

    #[test]
    fn test_emit_error_converts() {
        let error: MonitorError = EmitError::Rejected {
            status: 500,
            body: "boom".to_string(),
        }
        .into();
        assert!(matches!(error, MonitorError::Emit(_)));
        assert!(error.to_string().contains("500"));
    }
}
