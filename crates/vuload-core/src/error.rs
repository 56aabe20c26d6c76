use thiserror::Error;

/// Canonical error type for configuration and metric operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Human-readable explanation of the violated constraint.
        message: String,
    },

    /// Threshold expression could not be parsed or does not fit its metric.
    #[error("invalid threshold `{expression}` on `{metric}`: {reason}")]
    InvalidThreshold {
        /// Metric the threshold was declared on.
        metric: String,
        /// Raw expression as written in the configuration.
        expression: String,
        /// Why the expression was rejected.
        reason: String,
    },

    /// Threshold references a metric the engine does not produce.
    #[error("unknown metric `{0}`")]
    UnknownMetric(String),

    /// Duration string could not be parsed.
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    /// Error raised by the layered configuration loader.
    #[error("configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },
}

impl CoreError {
    /// Creates an `InvalidConfig` variant.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an `InvalidThreshold` variant.
    #[must_use]
    pub fn invalid_threshold(
        metric: impl Into<String>,
        expression: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidThreshold {
            metric: metric.into(),
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for errors that stem from user-supplied configuration.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::InvalidThreshold { .. }
                | Self::UnknownMetric(_)
                | Self::InvalidDuration(_)
                | Self::Source(_)
        )
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
