//! Parley HTTP server
//!
//! Mounts the broker endpoint next to the health and metrics routes.

pub mod chat;

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use parley_broker::{Broker, HandlerRegistry, SessionEvent};
use parley_config::Config;
use parley_observability::MetricsCollector;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
    metrics: Arc<MetricsCollector>,
}

/// Build the application router around a new broker using `handlers`
pub fn build_app(
    config: Arc<Config>,
    handlers: HandlerRegistry,
    metrics: Arc<MetricsCollector>,
) -> (Router, Arc<Broker>) {
    let broker = Broker::new(config, handlers);
    let state = Arc::new(AppState {
        broker: Arc::clone(&broker),
        metrics,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(parley_broker::endpoint::router(Arc::clone(&broker)))
        .layer(TraceLayer::new_for_http());

    (app, broker)
}

/// Bind `config.server` and serve until `shutdown` resolves, then close every
/// session.
pub async fn run_server<F>(
    config: Arc<Config>,
    handlers: HandlerRegistry,
    metrics: Arc<MetricsCollector>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let (app, broker) = build_app(config, handlers, metrics);
    tokio::spawn(log_session_events(broker.sessions().subscribe_events()));

    tracing::info!("Parley server listening on http://{}", listener.local_addr()?);

    let closing = Arc::clone(&broker);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            closing.shutdown();
        })
        .await?;

    tracing::info!("Parley server stopped");
    Ok(())
}

async fn log_session_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Opened { session_id, transport }) => {
                tracing::debug!(%session_id, %transport, "Session event: opened");
            }
            Ok(SessionEvent::Closed { session_id, reason }) => {
                tracing::debug!(%session_id, reason = reason.as_str(), "Session event: closed");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Session event log lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "sessions": state.broker.sessions().count(),
        "topics": state.broker.registry().topic_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
