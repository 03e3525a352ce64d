//! Broker error taxonomy

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::frame::{Frame, FrameError};
use crate::handler::HandlerError;
use crate::transport::TransportError;

/// Why a connection was refused before a session existed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("request carries no Origin header")]
    MissingOrigin,

    #[error("origin {0:?} is not allowed")]
    OriginRejected(String),

    #[error("WebSocket upgrade required")]
    UpgradeRequired,

    #[error("transport {0} is disabled")]
    TransportDisabled(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unroutable destination: {0}")]
    UnroutableDestination(String),

    #[error("no handler registered for {0}")]
    NoHandlerRegistered(String),

    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("handler for {destination} failed: {source}")]
    Handler {
        destination: String,
        #[source]
        source: HandlerError,
    },
}

impl From<FrameError> for BrokerError {
    fn from(err: FrameError) -> Self {
        BrokerError::MalformedFrame(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Short name, for logs and the ERROR frame `message` header
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::HandshakeFailed(_) => "HandshakeFailed",
            BrokerError::MalformedFrame(_) => "MalformedFrame",
            BrokerError::UnroutableDestination(_) => "UnroutableDestination",
            BrokerError::NoHandlerRegistered(_) => "NoHandlerRegistered",
            BrokerError::TransportFailure(_) => "TransportFailure",
            BrokerError::ResourceExhausted(_) => "ResourceExhausted",
            BrokerError::Handler { .. } => "HandlerFailed",
        }
    }

    /// Whether the client is told with an ERROR frame
    pub fn notifies_client(&self) -> bool {
        matches!(
            self,
            BrokerError::MalformedFrame(_)
                | BrokerError::UnroutableDestination(_)
                | BrokerError::Handler { .. }
        )
    }

    /// STOMP ERROR frame for the originating session
    pub fn to_error_frame(&self, receipt: Option<&str>) -> Frame {
        let frame = Frame::error(self.kind(), &self.to_string());
        match receipt {
            Some(id) => frame.header("receipt-id", id),
            None => frame,
        }
    }

    /// HTTP status when the error ends a request before any session exists
    pub fn status_code(&self) -> StatusCode {
        match self {
            BrokerError::HandshakeFailed(HandshakeError::UpgradeRequired) => StatusCode::BAD_REQUEST,
            BrokerError::HandshakeFailed(HandshakeError::TransportDisabled(_)) => StatusCode::NOT_FOUND,
            BrokerError::HandshakeFailed(_) => StatusCode::FORBIDDEN,
            BrokerError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::MalformedFrame(_) => StatusCode::BAD_REQUEST,
            BrokerError::UnroutableDestination(_) | BrokerError::NoHandlerRegistered(_) => {
                StatusCode::NOT_FOUND
            }
            BrokerError::TransportFailure(_) | BrokerError::Handler { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = match &self {
            BrokerError::HandshakeFailed(HandshakeError::UpgradeRequired) => {
                "Can \"Upgrade\" only to \"WebSocket\".".to_string()
            }
            other => other.to_string(),
        };
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err: BrokerError = HandshakeError::OriginRejected("http://evil".into()).into();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            BrokerError::from(HandshakeError::UpgradeRequired).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            BrokerError::ResourceExhausted("sessions".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_frame() {
        let err = BrokerError::UnroutableDestination("/queue/x".into());
        let frame = err.to_error_frame(Some("r-1"));
        assert_eq!(frame.get("message"), Some("UnroutableDestination"));
        assert_eq!(frame.get("receipt-id"), Some("r-1"));
        assert_eq!(frame.body_str(), Some("unroutable destination: /queue/x"));
        assert!(err.notifies_client());
        assert!(!BrokerError::NoHandlerRegistered("/app/x".into()).notifies_client());
    }

    #[test]
    fn test_frame_error_is_malformed() {
        let err: BrokerError = FrameError::MissingTerminator.into();
        assert_eq!(err.kind(), "MalformedFrame");
    }
}
