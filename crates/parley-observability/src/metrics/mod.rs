//! Metrics collection
//!
//! Installs the global `metrics` recorder (Prometheus) and provides the
//! relay's metric helpers. The helpers are no-ops until a recorder exists,
//! so library code can call them unconditionally.

use metrics::{describe_counter, describe_gauge, Unit};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::Config;
#[cfg(feature = "prometheus")]
use crate::error::ObservabilityError;
use crate::error::Result;

pub const SESSIONS_ACTIVE: &str = "parley_sessions_active";
pub const SESSIONS_OPENED: &str = "parley_sessions_opened_total";
pub const SESSIONS_CLOSED: &str = "parley_sessions_closed_total";
pub const HANDSHAKES_REJECTED: &str = "parley_handshakes_rejected_total";
pub const FRAMES_RECEIVED: &str = "parley_frames_received_total";
pub const FRAMES_MALFORMED: &str = "parley_frames_malformed_total";
pub const MESSAGES_PUBLISHED: &str = "parley_messages_published_total";
pub const DELIVERIES: &str = "parley_deliveries_total";
pub const DELIVERY_FAILURES: &str = "parley_delivery_failures_total";

/// Owns the Prometheus handle used to render `/metrics`
pub struct MetricsCollector {
    #[cfg(feature = "prometheus")]
    handle: Option<PrometheusHandle>,
    enabled: bool,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl MetricsCollector {
    /// Install the global recorder when metrics are enabled
    pub fn new(config: &Config) -> Result<Self> {
        if !config.metrics.enabled {
            return Ok(Self::disabled());
        }

        #[cfg(feature = "prometheus")]
        let handle = {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder).map_err(|e| {
                ObservabilityError::metrics(format!("Failed to set global recorder: {}", e))
            })?;
            Some(handle)
        };

        register_descriptions();

        tracing::info!(target: "parley_observability", "Metrics collector initialized");

        Ok(Self {
            #[cfg(feature = "prometheus")]
            handle,
            enabled: true,
        })
    }

    /// A collector that renders nothing
    pub fn disabled() -> Self {
        Self {
            #[cfg(feature = "prometheus")]
            handle: None,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Metrics in the Prometheus text format
    pub fn render(&self) -> String {
        #[cfg(feature = "prometheus")]
        {
            self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
        }
        #[cfg(not(feature = "prometheus"))]
        {
            String::new()
        }
    }
}

fn register_descriptions() {
    describe_gauge!(SESSIONS_ACTIVE, Unit::Count, "Number of open sessions");
    describe_counter!(SESSIONS_OPENED, Unit::Count, "Sessions accepted");
    describe_counter!(SESSIONS_CLOSED, Unit::Count, "Sessions closed, by reason");
    describe_counter!(HANDSHAKES_REJECTED, Unit::Count, "Connections refused at handshake");
    describe_counter!(FRAMES_RECEIVED, Unit::Count, "Inbound STOMP frames, by command");
    describe_counter!(FRAMES_MALFORMED, Unit::Count, "Inbound frames that failed to parse");
    describe_counter!(MESSAGES_PUBLISHED, Unit::Count, "Messages published to topics");
    describe_counter!(DELIVERIES, Unit::Count, "MESSAGE frames handed to subscriber transports");
    describe_counter!(DELIVERY_FAILURES, Unit::Count, "Fan-out sends that failed");
}

/// Session and fan-out metrics
pub struct RelayMetrics;

impl RelayMetrics {
    pub fn session_opened(transport: &'static str) {
        metrics::counter!(SESSIONS_OPENED, "transport" => transport).increment(1);
        metrics::gauge!(SESSIONS_ACTIVE).increment(1.0);
    }

    pub fn session_closed(reason: &'static str) {
        metrics::counter!(SESSIONS_CLOSED, "reason" => reason).increment(1);
        metrics::gauge!(SESSIONS_ACTIVE).decrement(1.0);
    }

    pub fn handshake_rejected() {
        metrics::counter!(HANDSHAKES_REJECTED).increment(1);
    }

    pub fn frame_received(command: &'static str) {
        metrics::counter!(FRAMES_RECEIVED, "command" => command).increment(1);
    }

    pub fn frame_malformed() {
        metrics::counter!(FRAMES_MALFORMED).increment(1);
    }

    /// One publish and its fan-out result
    pub fn published(delivered: usize, failed: usize) {
        metrics::counter!(MESSAGES_PUBLISHED).increment(1);
        metrics::counter!(DELIVERIES).increment(delivered as u64);
        if failed > 0 {
            metrics::counter!(DELIVERY_FAILURES).increment(failed as u64);
        }
    }
}
