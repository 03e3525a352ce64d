//! Structured logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` behind a reload
//! handle, a stdout layer (plain or JSON) and an optional daily-rotated file.

use std::path::Path;

use parking_lot::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    layer::{Layered, SubscriberExt},
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{Config, LoggingConfig};
use crate::error::{ObservabilityError, Result};

type ReloadHandle = Handle<EnvFilter, Registry>;
type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync + 'static>;

/// Owns the installed subscriber's reload handle and file writer guard
pub struct LogManager {
    config: LoggingConfig,
    reload_handle: ReloadHandle,
    /// Flushes the file writer on drop
    _file_guard: Option<WorkerGuard>,
    current_level: Mutex<String>,
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("config", &self.config)
            .field("current_level", &*self.current_level.lock())
            .finish()
    }
}

impl LogManager {
    /// Install the global subscriber. Fails if one is already installed.
    pub fn new(config: &Config) -> Result<Self> {
        let logging = config.logging.clone();

        let filter = build_filter(&logging.level, &logging)?;
        let (filter, reload_handle) = reload::Layer::new(filter);

        let mut layers: Vec<BoxedLayer> = Vec::new();

        if logging.json_format {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(logging.include_target)
                    .with_line_number(logging.include_line_number)
                    .boxed(),
            );
        } else {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_target(logging.include_target)
                    .with_line_number(logging.include_line_number)
                    .with_ansi(logging.ansi_colors)
                    .boxed(),
            );
        }

        let file_guard = match logging.file_path.as_deref() {
            Some(path) => {
                let (writer, guard) = file_writer(path)?;
                layers.push(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true)
                        .boxed(),
                );
                Some(guard)
            }
            None => None,
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(layers)
            .try_init()
            .map_err(|e| ObservabilityError::logging(format!("Failed to install subscriber: {}", e)))?;

        tracing::info!(
            target: "parley_observability",
            app = %config.app_name,
            "Log manager initialized with level: {}",
            logging.level
        );

        Ok(Self {
            current_level: Mutex::new(logging.level.clone()),
            config: logging,
            reload_handle,
            _file_guard: file_guard,
        })
    }

    /// Swap the active filter
    pub fn update_level(&self, level: &str) -> Result<()> {
        let new_filter = build_filter(level, &self.config)?;
        self.reload_handle
            .modify(|filter| *filter = new_filter)
            .map_err(|e| ObservabilityError::logging(format!("Failed to update log level: {}", e)))?;

        *self.current_level.lock() = level.to_string();
        tracing::info!(target: "parley_observability", "Log level updated to: {}", level);
        Ok(())
    }

    /// The level currently in effect
    pub fn level(&self) -> String {
        self.current_level.lock().clone()
    }
}

fn build_filter(level: &str, config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level)
        .map_err(|e| ObservabilityError::logging(format!("Invalid log level: {}", e)))?;

    for (module, module_level) in &config.module_levels {
        let directive = format!("{}={}", module, module_level)
            .parse()
            .map_err(|e| ObservabilityError::logging(format!("Invalid directive: {}", e)))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}

fn file_writer(path: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| ObservabilityError::config(format!("Log path has no file name: {:?}", path)))?;

    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Span wrapping everything a session does
pub fn session_span(session_id: &str, transport: &str) -> tracing::Span {
    tracing::info_span!(
        "session",
        session_id = %session_id,
        transport = %transport,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_with_modules() {
        let config = Config::default()
            .with_module_level("parley_broker", "trace")
            .logging;
        assert!(build_filter("info", &config).is_ok());
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        let config = Config::default()
            .with_module_level("parley_broker", "not a level!")
            .logging;
        assert!(build_filter("info", &config).is_err());
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("parley.log");
        let (_writer, _guard) = file_writer(&path).unwrap();
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn test_session_span() {
        let span = session_span("sess-1", "websocket");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "session");
        }
    }
}
