//! HTTP surface of the broker endpoint
//!
//! ```text
//! GET  {endpoint}                               native WebSocket, or the SockJS welcome
//! GET  {endpoint}/websocket                     native WebSocket
//! GET  {endpoint}/info                          SockJS info
//! GET  {endpoint}/{server}/{session}/websocket  SockJS over WebSocket
//! POST {endpoint}/{server}/{session}/xhr        SockJS long poll
//! POST {endpoint}/{server}/{session}/xhr_send   SockJS client payload
//! ```

use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_observability::RelayMetrics;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::{BrokerError, Result};
use crate::transport::{
    EndpointRoute, Framing, Negotiated, PollingTransport, Transport, TransportError,
    WebSocketTransport,
};

const JAVASCRIPT: &str = "application/javascript; charset=UTF-8";
const WELCOME: &str = "Welcome to SockJS!\n";

struct EndpointState {
    broker: Arc<Broker>,
    /// SockJS session id -> polling transport
    polls: DashMap<String, Arc<PollingTransport>>,
}

/// Routes of the broker endpoint, with CORS applied
pub fn router(broker: Arc<Broker>) -> Router {
    let paths = EndpointPaths::new(&broker.config().broker.endpoint);
    let cors = cors_layer(broker.sessions().allowed_origins());
    let state = Arc::new(EndpointState {
        broker,
        polls: DashMap::new(),
    });

    info!(endpoint = %paths.root, "Broker endpoint mounted");

    Router::new()
        .route(&paths.root, get(root_handler))
        .route(&paths.websocket, get(websocket_handler))
        .route(&paths.info, get(info_handler))
        .route(&paths.sockjs_websocket, get(sockjs_websocket_handler))
        .route(&paths.xhr, post(xhr_handler))
        .route(&paths.xhr_send, post(xhr_send_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EndpointPaths {
    root: String,
    websocket: String,
    info: String,
    sockjs_websocket: String,
    xhr: String,
    xhr_send: String,
}

impl EndpointPaths {
    fn new(endpoint: &str) -> Self {
        let base = endpoint.trim_end_matches('/');
        let root = if base.is_empty() { "/".to_string() } else { base.to_string() };
        Self {
            websocket: format!("{}/websocket", base),
            info: format!("{}/info", base),
            sockjs_websocket: format!("{}/:server/:session/websocket", base),
            xhr: format!("{}/:server/:session/xhr", base),
            xhr_send: format!("{}/:server/:session/xhr_send", base),
            root,
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin.trim_end_matches('/')).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

fn origin_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Origin and capacity checks, run before any upgrade
fn admit(broker: &Broker, origin: Option<&str>) -> Result<()> {
    broker.sessions().admit(origin).map_err(|e| {
        RelayMetrics::handshake_rejected();
        warn!(origin = ?origin, "Handshake rejected: {}", e);
        e
    })
}

fn negotiate(broker: &Broker, route: EndpointRoute, upgrade: bool) -> Result<Negotiated> {
    broker.negotiator().negotiate(route, upgrade).map_err(|e| {
        RelayMetrics::handshake_rejected();
        debug!(?route, "Negotiation failed: {}", e);
        BrokerError::from(e)
    })
}

async fn root_handler(
    State(state): State<Arc<EndpointState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    upgrade(&state, EndpointRoute::Root, Framing::Raw, headers, ws)
}

async fn websocket_handler(
    State(state): State<Arc<EndpointState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    upgrade(&state, EndpointRoute::RawWebSocket, Framing::Raw, headers, ws)
}

async fn sockjs_websocket_handler(
    State(state): State<Arc<EndpointState>>,
    Path((_server, _session)): Path<(String, String)>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    upgrade(&state, EndpointRoute::SockJsWebSocket, Framing::SockJs, headers, ws)
}

fn upgrade(
    state: &EndpointState,
    route: EndpointRoute,
    framing: Framing,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let broker = &state.broker;
    match negotiate(broker, route, ws.is_some()) {
        Ok(Negotiated::Welcome) => {
            return ([(header::CONTENT_TYPE, "text/plain; charset=UTF-8")], WELCOME).into_response();
        }
        Ok(Negotiated::Info) => return info_response(broker),
        Ok(Negotiated::Transport(_)) => {}
        Err(e) => return e.into_response(),
    }
    let Some(ws) = ws else {
        return BrokerError::from(crate::error::HandshakeError::UpgradeRequired).into_response();
    };

    let origin = origin_of(&headers);
    if let Err(e) = admit(broker, origin.as_deref()) {
        return e.into_response();
    }

    let broker = Arc::clone(broker);
    ws.max_message_size(broker.config().broker.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            let transport = WebSocketTransport::spawn(socket, framing, broker.transport_settings());
            let accepted = broker.sessions().accept(origin.as_deref(), transport.clone());
            match accepted {
                Ok(session) => broker.run_session(session).await,
                Err(e) => {
                    RelayMetrics::handshake_rejected();
                    warn!("Session refused after upgrade: {}", e);
                    transport.close();
                }
            }
        })
}

async fn info_handler(State(state): State<Arc<EndpointState>>) -> Response {
    match negotiate(&state.broker, EndpointRoute::Info, false) {
        Ok(_) => info_response(&state.broker),
        Err(e) => e.into_response(),
    }
}

fn info_response(broker: &Broker) -> Response {
    let entropy = uuid::Uuid::new_v4().as_u128() as u32;
    (
        [(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0")],
        Json(json!({
            "websocket": broker.negotiator().websocket_enabled(),
            "origins": ["*:*"],
            "cookie_needed": false,
            "entropy": entropy,
        })),
    )
        .into_response()
}

async fn xhr_handler(
    State(state): State<Arc<EndpointState>>,
    Path((_server, session_key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let existing = state.polls.get(&session_key).map(|t| Arc::clone(t.value()));
    let transport = match existing {
        Some(existing) => existing,
        None => match open_polling_session(&state, &session_key, &headers) {
            Ok(transport) => transport,
            Err(e) => return e.into_response(),
        },
    };

    let body = transport.poll().await.to_body();
    ([(header::CONTENT_TYPE, JAVASCRIPT)], body).into_response()
}

fn open_polling_session(
    state: &Arc<EndpointState>,
    session_key: &str,
    headers: &HeaderMap,
) -> Result<Arc<PollingTransport>> {
    let broker = &state.broker;
    negotiate(broker, EndpointRoute::SockJsXhr, false)?;
    let origin = origin_of(headers);
    admit(broker, origin.as_deref())?;

    let transport = match state.polls.entry(session_key.to_string()) {
        Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
        Entry::Vacant(slot) => {
            let transport = Arc::new(PollingTransport::new(broker.transport_settings()));
            let session = broker.sessions().accept(origin.as_deref(), transport.clone())?;
            slot.insert(Arc::clone(&transport));

            tokio::spawn(Arc::clone(broker).run_session(Arc::clone(&session)));
            tokio::spawn(forget_after_close(
                Arc::clone(state),
                session_key.to_string(),
                Arc::clone(&transport),
                session.cancelled(),
            ));
            transport
        }
    };

    debug!(session_key, "Polling session opened");
    Ok(transport)
}

/// Keep a closed polling session answerable for the disconnect delay so the
/// client still sees the close frame, then drop it.
async fn forget_after_close(
    state: Arc<EndpointState>,
    session_key: String,
    transport: Arc<PollingTransport>,
    closed: tokio_util::sync::CancellationToken,
) {
    closed.cancelled().await;
    tokio::time::sleep(state.broker.transport_settings().disconnect_delay).await;
    state
        .polls
        .remove_if(&session_key, |_, current| Arc::ptr_eq(current, &transport));
}

async fn xhr_send_handler(
    State(state): State<Arc<EndpointState>>,
    Path((_server, session_key)): Path<(String, String)>,
    body: String,
) -> Response {
    let Some(transport) = state.polls.get(&session_key).map(|t| Arc::clone(t.value())) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if body.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Payload expected.").into_response();
    }

    match transport.accept_inbound(&body).await {
        Ok(_) => (
            StatusCode::NO_CONTENT,
            [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
        )
            .into_response(),
        Err(TransportError::Protocol(detail)) => {
            debug!(session_key, "Rejected xhr_send payload: {}", detail);
            (StatusCode::INTERNAL_SERVER_ERROR, "Broken JSON encoding.").into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_under_endpoint() {
        let paths = EndpointPaths::new("/ws/");
        assert_eq!(paths.root, "/ws");
        assert_eq!(paths.websocket, "/ws/websocket");
        assert_eq!(paths.info, "/ws/info");
        assert_eq!(paths.xhr, "/ws/:server/:session/xhr");
        assert_eq!(paths.xhr_send, "/ws/:server/:session/xhr_send");
        assert_eq!(paths.sockjs_websocket, "/ws/:server/:session/websocket");
    }

    #[test]
    fn test_paths_at_root() {
        let paths = EndpointPaths::new("/");
        assert_eq!(paths.root, "/");
        assert_eq!(paths.info, "/info");
    }

    #[test]
    fn test_origin_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(origin_of(&headers), None);
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://localhost:3000"));
        assert_eq!(origin_of(&headers).as_deref(), Some("http://localhost:3000"));
    }
}
