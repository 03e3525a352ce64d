//! Transport negotiation
//!
//! Maps an endpoint request onto a transport. The native upgrade is tried
//! first; a SockJS client whose upgrade never arrives is told so with a 400
//! and retries over XHR polling.

use parley_config::TransportConfig;

use super::TransportKind;
use crate::error::HandshakeError;

/// Which endpoint path a request hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRoute {
    /// `{endpoint}`
    Root,
    /// `{endpoint}/websocket`
    RawWebSocket,
    /// `{endpoint}/info`
    Info,
    /// `{endpoint}/{server}/{session}/websocket`
    SockJsWebSocket,
    /// `{endpoint}/{server}/{session}/xhr` and `xhr_send`
    SockJsXhr,
}

/// Outcome of negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiated {
    /// Open a session over this transport
    Transport(TransportKind),
    /// Plain greeting, no session
    Welcome,
    /// SockJS server capabilities, no session
    Info,
}

#[derive(Debug, Clone)]
pub struct Negotiator {
    websocket_enabled: bool,
    fallback_enabled: bool,
}

impl Negotiator {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            websocket_enabled: config.websocket_enabled,
            fallback_enabled: config.fallback_enabled,
        }
    }

    pub fn websocket_enabled(&self) -> bool {
        self.websocket_enabled
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    /// Decide the transport for a request. `upgrade` tells whether the
    /// request carried valid WebSocket upgrade headers.
    pub fn negotiate(&self, route: EndpointRoute, upgrade: bool) -> Result<Negotiated, HandshakeError> {
        match route {
            EndpointRoute::Root if !upgrade => Ok(Negotiated::Welcome),
            EndpointRoute::Info => Ok(Negotiated::Info),
            EndpointRoute::Root | EndpointRoute::RawWebSocket => {
                self.websocket(TransportKind::WebSocket, upgrade)
            }
            EndpointRoute::SockJsWebSocket => {
                self.websocket(TransportKind::SockJsWebSocket, upgrade)
            }
            EndpointRoute::SockJsXhr if self.fallback_enabled => {
                Ok(Negotiated::Transport(TransportKind::XhrPolling))
            }
            EndpointRoute::SockJsXhr => Err(HandshakeError::TransportDisabled(
                TransportKind::XhrPolling.as_str(),
            )),
        }
    }

    fn websocket(&self, kind: TransportKind, upgrade: bool) -> Result<Negotiated, HandshakeError> {
        if !self.websocket_enabled {
            return Err(HandshakeError::TransportDisabled(kind.as_str()));
        }
        if !upgrade {
            return Err(HandshakeError::UpgradeRequired);
        }
        Ok(Negotiated::Transport(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(websocket: bool, fallback: bool) -> Negotiator {
        Negotiator::new(&TransportConfig {
            websocket_enabled: websocket,
            fallback_enabled: fallback,
            ..TransportConfig::default()
        })
    }

    #[test]
    fn test_native_upgrade_preferred() {
        let n = negotiator(true, true);
        assert_eq!(
            n.negotiate(EndpointRoute::Root, true),
            Ok(Negotiated::Transport(TransportKind::WebSocket))
        );
        assert_eq!(
            n.negotiate(EndpointRoute::SockJsWebSocket, true),
            Ok(Negotiated::Transport(TransportKind::SockJsWebSocket))
        );
        assert_eq!(n.negotiate(EndpointRoute::Root, false), Ok(Negotiated::Welcome));
    }

    #[test]
    fn test_missing_upgrade_is_downgrade_signal() {
        let n = negotiator(true, true);
        assert_eq!(
            n.negotiate(EndpointRoute::SockJsWebSocket, false),
            Err(HandshakeError::UpgradeRequired)
        );
        assert_eq!(
            n.negotiate(EndpointRoute::SockJsXhr, false),
            Ok(Negotiated::Transport(TransportKind::XhrPolling))
        );
    }

    #[test]
    fn test_disabled_transports() {
        let n = negotiator(false, true);
        assert!(matches!(
            n.negotiate(EndpointRoute::RawWebSocket, true),
            Err(HandshakeError::TransportDisabled(_))
        ));

        let n = negotiator(true, false);
        assert!(matches!(
            n.negotiate(EndpointRoute::SockJsXhr, false),
            Err(HandshakeError::TransportDisabled("xhr-polling"))
        ));
        assert_eq!(n.negotiate(EndpointRoute::Info, false), Ok(Negotiated::Info));
    }
}
