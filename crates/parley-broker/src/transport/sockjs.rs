//! SockJS framing
//!
//! Server frames are `o` (open), `h` (heartbeat), `a[...]` (a JSON array of
//! messages) and `c[code,"reason"]` (close). Clients send a JSON array of
//! strings, or a single JSON string.

use super::TransportError;

pub const OPEN: &str = "o";
pub const HEARTBEAT: &str = "h";

pub const GO_AWAY: (u16, &str) = (3000, "Go away!");
pub const ANOTHER_CONNECTION: (u16, &str) = (2010, "Another connection still open");

pub fn close_frame(code: u16, reason: &str) -> String {
    format!("c[{},{}]", code, serde_json::Value::from(reason))
}

/// `a[...]` carrying `messages` in order
pub fn array_frame<S: AsRef<str>>(messages: &[S]) -> String {
    let values: Vec<&str> = messages.iter().map(AsRef::as_ref).collect();
    let json = serde_json::to_string(&values).unwrap_or_else(|_| "[]".to_string());
    format!("a{}", json)
}

/// An outbound payload as a SockJS message. Messages are JSON strings, so
/// bytes that are not UTF-8 are replaced.
pub fn message_text(payload: Vec<u8>) -> String {
    String::from_utf8(payload)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Messages carried by one client payload
pub fn decode_client_payload(payload: &str) -> Result<Vec<String>, TransportError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::String(message)) => Ok(vec![message]),
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                serde_json::Value::String(message) => Ok(message),
                other => Err(TransportError::Protocol(format!(
                    "expected a string message, got {}",
                    other
                ))),
            })
            .collect(),
        Ok(other) => Err(TransportError::Protocol(format!(
            "expected a JSON array of strings, got {}",
            other
        ))),
        Err(e) => Err(TransportError::Protocol(format!("broken JSON encoding: {}", e))),
    }
}
