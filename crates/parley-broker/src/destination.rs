//! Destination namespaces

use parley_config::BrokerConfig;

/// Which namespace a destination falls in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Topics any session can subscribe to
    Broadcast,
    /// Server-side handler routes
    Application,
}

/// The two configured prefixes
#[derive(Debug, Clone)]
pub struct Destinations {
    broadcast_prefix: String,
    application_prefix: String,
}

impl Destinations {
    pub fn new(broadcast_prefix: impl Into<String>, application_prefix: impl Into<String>) -> Self {
        Self {
            broadcast_prefix: broadcast_prefix.into(),
            application_prefix: application_prefix.into(),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.broadcast_prefix, &config.application_prefix)
    }

    pub fn broadcast_prefix(&self) -> &str {
        &self.broadcast_prefix
    }

    pub fn application_prefix(&self) -> &str {
        &self.application_prefix
    }

    /// Namespace of `destination` and the remainder after its prefix.
    ///
    /// The remainder is empty or starts with `/`.
    pub fn classify<'a>(&self, destination: &'a str) -> Option<(Namespace, &'a str)> {
        if let Some(rest) = strip_segment_prefix(destination, &self.broadcast_prefix) {
            return Some((Namespace::Broadcast, rest));
        }
        strip_segment_prefix(destination, &self.application_prefix)
            .map(|rest| (Namespace::Application, rest))
    }

    pub fn is_topic(&self, destination: &str) -> bool {
        matches!(self.classify(destination), Some((Namespace::Broadcast, _)))
    }

    /// Topic an application route replies to when it declares none
    pub fn default_topic(&self, remainder: &str) -> String {
        format!("{}{}", self.broadcast_prefix, remainder)
    }
}

/// `path` minus `prefix`, when `prefix` is a whole-segment ancestor of `path`
pub fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destinations() -> Destinations {
        Destinations::new("/topic", "/app")
    }

    #[test]
    fn test_classify() {
        let d = destinations();
        assert_eq!(
            d.classify("/topic/messages"),
            Some((Namespace::Broadcast, "/messages"))
        );
        assert_eq!(
            d.classify("/app/sendMessage/42"),
            Some((Namespace::Application, "/sendMessage/42"))
        );
        assert_eq!(d.classify("/topic"), Some((Namespace::Broadcast, "")));
    }

    #[test]
    fn test_segment_aware() {
        let d = destinations();
        assert_eq!(d.classify("/topics/x"), None);
        assert_eq!(d.classify("/application"), None);
        assert_eq!(d.classify("/queue/a"), None);
        assert_eq!(d.classify(""), None);
    }

    #[test]
    fn test_default_topic() {
        assert_eq!(destinations().default_topic("/chat"), "/topic/chat");
    }
}
