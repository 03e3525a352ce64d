use crate::config::{Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Loads and validates the relay configuration.
///
/// The result is frozen for the lifetime of the process. There is no save or
/// reload path.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults. `.json` and `.toml` are accepted,
    /// and `${VAR}` / `${VAR:-default}` references are expanded before parsing.
    pub async fn load(path: &Path) -> ConfigResult<Config> {
        let config = if path.exists() {
            info!("Loading config from {:?}", path);
            let content = tokio::fs::read_to_string(path).await?;
            let content = Self::expand_env_vars(&content)?;
            Self::parse(path, &content)?
        } else {
            info!("Config file {:?} not found, using defaults", path);
            Config::default()
        };

        Self::validate(&config)?;
        Ok(config)
    }

    /// Default config location (`~/.parley/config.json`)
    pub fn default_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            ConfigError::Validation("Could not find home directory".to_string())
        })?;
        Ok(home.join(".parley").join("config.json"))
    }

    fn parse(path: &Path, content: &str) -> ConfigResult<Config> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(content)?),
            Some("toml") => Ok(toml::from_str(content)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }

    /// Check the invariants the broker relies on.
    pub fn validate(config: &Config) -> ConfigResult<()> {
        if config.server.port == 0 {
            return Err(ConfigError::Validation(
                "Server port cannot be 0".to_string(),
            ));
        }

        let broker = &config.broker;
        for (name, value) in [
            ("endpoint", &broker.endpoint),
            ("broadcast_prefix", &broker.broadcast_prefix),
            ("application_prefix", &broker.application_prefix),
        ] {
            if !value.starts_with('/') || value.len() < 2 || value.ends_with('/') {
                return Err(ConfigError::Validation(format!(
                    "broker.{} must look like \"/name\", got {:?}",
                    name, value
                )));
            }
        }

        if overlaps(&broker.broadcast_prefix, &broker.application_prefix) {
            return Err(ConfigError::Validation(format!(
                "broadcast prefix {:?} and application prefix {:?} overlap",
                broker.broadcast_prefix, broker.application_prefix
            )));
        }

        if broker.max_sessions == 0 {
            return Err(ConfigError::Validation(
                "broker.max_sessions must be greater than 0".to_string(),
            ));
        }

        if broker.max_frame_bytes < 64 {
            return Err(ConfigError::Validation(
                "broker.max_frame_bytes must be at least 64".to_string(),
            ));
        }

        if broker.allowed_origins.is_empty() {
            warn!("broker.allowed_origins is empty, every connection will be refused");
        }

        let transport = &config.transport;
        if !transport.websocket_enabled && !transport.fallback_enabled {
            return Err(ConfigError::Validation(
                "at least one transport must be enabled".to_string(),
            ));
        }

        if transport.outbound_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "transport.outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }

        if transport.poll_timeout_secs == 0 || transport.disconnect_delay_secs == 0 {
            return Err(ConfigError::Validation(
                "transport poll timeout and disconnect delay must be greater than 0".to_string(),
            ));
        }

        debug!("Config validated");
        Ok(())
    }

    /// Expand `${VAR}` and `${VAR:-default}`
    fn expand_env_vars(content: &str) -> ConfigResult<String> {
        let re = Regex::new(r"\$\{([^}]+)\}")
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        let mut result = content.to_string();

        for cap in re.captures_iter(content) {
            let full_match = &cap[0];
            let var_expr = &cap[1];

            let (var_name, default_value) = match var_expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (var_expr, None),
            };

            let replacement = match std::env::var(var_name) {
                Ok(val) => val,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    None => return Err(ConfigError::EnvVarNotFound(var_name.to_string())),
                },
            };

            result = result.replace(full_match, &replacement);
        }

        Ok(result)
    }
}

/// Two prefixes overlap when one is the other or a path-segment ancestor of it.
fn overlaps(a: &str, b: &str) -> bool {
    let nested = |outer: &str, inner: &str| {
        inner == outer || inner.strip_prefix(outer).is_some_and(|rest| rest.starts_with('/'))
    };
    nested(a, b) || nested(b, a)
}
