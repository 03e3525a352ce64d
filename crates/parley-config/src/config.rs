use serde::{Deserialize, Serialize};

/// Top-level relay configuration.
///
/// Built once at process start and shared behind an `Arc`; nothing mutates
/// it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            transport: TransportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Message broker settings: the connection endpoint and the two namespaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Path of the connection endpoint (e.g. `/chat`)
    pub endpoint: String,
    /// Destination prefix of broadcast topics (e.g. `/topic`)
    pub broadcast_prefix: String,
    /// Destination prefix of application handlers (e.g. `/app`)
    pub application_prefix: String,
    /// Origins permitted to open a connection. `*` admits any origin.
    pub allowed_origins: Vec<String>,
    /// Upper bound on concurrently open sessions
    pub max_sessions: usize,
    /// Largest accepted STOMP frame, headers included
    pub max_frame_bytes: usize,
    pub heartbeat: HeartbeatConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: "/chat".to_string(),
            broadcast_prefix: "/topic".to_string(),
            application_prefix: "/app".to_string(),
            allowed_origins: vec!["http://localhost:5173".to_string()],
            max_sessions: 1000,
            max_frame_bytes: 64 * 1024,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Server side of the STOMP `heart-beat` negotiation, in milliseconds.
/// Zero disables the respective direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            send_ms: 10_000,
            receive_ms: 10_000,
        }
    }
}

/// Transport negotiation and buffering
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Offer the native WebSocket upgrade
    pub websocket_enabled: bool,
    /// Offer the HTTP long-polling fallback
    pub fallback_enabled: bool,
    /// Frames buffered per session before it is closed as a slow consumer
    pub outbound_queue_capacity: usize,
    /// How long a long-poll request is held open when there is nothing to send
    pub poll_timeout_secs: u64,
    /// Idle time without a poll after which a fallback session is dropped
    pub disconnect_delay_secs: u64,
    /// Interval of SockJS `h` frames on the framed WebSocket
    pub sockjs_heartbeat_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_enabled: true,
            fallback_enabled: true,
            outbound_queue_capacity: 1024,
            poll_timeout_secs: 25,
            disconnect_delay_secs: 5,
            sockjs_heartbeat_secs: 25,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub json: bool,
    /// Optional log file; rotated daily
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            file: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
