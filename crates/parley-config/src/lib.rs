//! Parley configuration
//!
//! Typed settings for the relay: the HTTP listener, the broker namespaces and
//! allowed origins, transport negotiation and logging.

pub mod config;
pub mod loader;

pub use config::{
    BrokerConfig, Config, ConfigError, ConfigResult, HeartbeatConfig, LogLevel, LoggingConfig,
    ServerConfig, TransportConfig,
};
pub use loader::ConfigLoader;

use std::path::PathBuf;

/// Expand a leading `~/` to the user's home directory
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().map(|home| home.join(rest)),
        None => Some(PathBuf::from(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/.parley/config.json");
        assert!(expanded.is_some());
        assert!(!expanded.unwrap().to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_expand_plain_path() {
        assert_eq!(expand_tilde("conf/parley.toml"), Some(PathBuf::from("conf/parley.toml")));
    }
}
