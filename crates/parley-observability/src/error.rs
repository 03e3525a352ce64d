//! Observability error type

/// Observability error
#[derive(Debug, thiserror::Error, Clone)]
pub enum ObservabilityError {
    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Config {
        /// Description
        message: String,
    },

    /// The log subscriber could not be installed or updated
    #[error("Logging error: {message}")]
    Logging {
        /// Description
        message: String,
    },

    /// The metrics recorder could not be installed
    #[error("Metrics error: {message}")]
    Metrics {
        /// Description
        message: String,
    },

    /// IO failure, e.g. creating the log directory
    #[error("IO error: {message}")]
    Io {
        /// Description
        message: String,
    },
}

impl ObservabilityError {
    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Logging error
    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }

    /// Metrics error
    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics {
            message: message.into(),
        }
    }

    /// Error category, for log fields
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Logging { .. } => "logging",
            Self::Metrics { .. } => "metrics",
            Self::Io { .. } => "io",
        }
    }
}

impl From<std::io::Error> for ObservabilityError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Result alias
pub type Result<T> = std::result::Result<T, ObservabilityError>;
