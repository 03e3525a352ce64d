//! Parley observability infrastructure
//!
//! Structured logging through `tracing` and Prometheus metrics through the
//! `metrics` facade.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
#[allow(missing_docs)]
pub mod metrics;

pub use config::Config;
pub use error::{ObservabilityError, Result};
pub use logging::{session_span, LogManager};
pub use metrics::{MetricsCollector, RelayMetrics};

use std::sync::Arc;

/// Handle to the installed logging and metrics infrastructure
#[derive(Debug)]
pub struct Observability {
    log_manager: Arc<LogManager>,
    metrics: Arc<MetricsCollector>,
    config: Config,
}

impl Observability {
    /// Install the global subscriber and metrics recorder.
    ///
    /// Can only succeed once per process.
    pub fn init(config: Config) -> Result<Self> {
        let log_manager = Arc::new(LogManager::new(&config)?);
        let metrics = Arc::new(MetricsCollector::new(&config)?);

        tracing::info!(
            target: "parley_observability",
            metrics = metrics.is_enabled(),
            "Observability infrastructure initialized"
        );

        Ok(Self {
            log_manager,
            metrics,
            config,
        })
    }

    /// The log manager
    pub fn log_manager(&self) -> Arc<LogManager> {
        Arc::clone(&self.log_manager)
    }

    /// The metrics collector
    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// The configuration this handle was built from
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Change the log filter at runtime
    pub fn update_log_level(&self, level: &str) -> Result<()> {
        self.log_manager.update_level(level)
    }

    /// Flush pending log output
    pub fn shutdown(self) {
        tracing::info!(
            target: "parley_observability",
            "Shutting down observability infrastructure"
        );
        // dropping the last LogManager releases the file writer guard
        drop(self.log_manager);
    }
}

/// Common imports
pub mod prelude {
    //! Types most call sites need

    pub use crate::{Config, Observability, RelayMetrics, Result};

    pub use tracing::{debug, error, info, instrument, trace, warn, Span};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_init() {
        let config = Config::default()
            .with_log_level("debug")
            .with_json_format(false);

        let obs = Observability::init(config).unwrap();
        assert_eq!(obs.log_manager().level(), "debug");
        assert!(obs.metrics().is_enabled());

        obs.update_log_level("parley_broker=trace,info").unwrap();
        assert_eq!(obs.log_manager().level(), "parley_broker=trace,info");

        // a second install fails
        assert!(Observability::init(Config::default()).is_err());
        obs.shutdown();
    }
}
