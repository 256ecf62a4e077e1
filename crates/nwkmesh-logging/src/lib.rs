//! Multi-node JSONL logging for nwkmesh
//!
//! # Features
//!
//! - **JSONL Output**: structured JSON lines for log aggregation (default)
//! - **Node Context**: tag spans with the node's short and IEEE address
//! - **File Rotation**: daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use nwkmesh_logging::{LogConfig, NwkSubscriberBuilder};
//!
//! // JSONL to console
//! let _guard = NwkSubscriberBuilder::new().init()?;
//!
//! // Pretty human-readable output
//! let _guard = NwkSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .init()?;
//! ```
//!
//! # Node Context
//!
//! A simulation runs many nodes on one thread. Wrap each node's work in a
//! [`NodeContextGuard`] and enter its [`node_span`] so interleaved lines can
//! be told apart:
//!
//! ```ignore
//! let _guard = NodeContextGuard::new(short, ieee, DeviceType::Router);
//! let node = NodeContextGuard::current().unwrap();
//! node_span(&node).in_scope(|| layer.poll_timers());
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleConfig, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{NodeContextData, NodeContextGuard};
pub use layers::{NodeContextExtension, NodeContextLayer, jsonl_layer, node_span};
pub use tracing_appender::non_blocking::WorkerGuard;

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while setting up logging
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid log configuration: {0}")]
    Config(String),

    #[error("invalid filter directives: {0}")]
    Filter(String),

    #[error("log file appender: {0}")]
    Appender(String),

    #[error("global subscriber already set: {0}")]
    AlreadySet(String),
}

/// Builder for configuring and initializing the nwkmesh logging subscriber
///
/// Console output defaults to JSONL. Use [`LogConfig::development`] for
/// pretty output.
pub struct NwkSubscriberBuilder {
    config: LogConfig,
}

impl NwkSubscriberBuilder {
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Filter from `RUST_LOG`, falling back to the configured directives
    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(self.config.directives())
                .map_err(|e| LoggingError::Filter(e.to_string())),
        }
    }

    /// Install the subscriber globally
    ///
    /// The returned guard flushes the file writer on drop and must be held
    /// for the life of the program when file output is enabled.
    pub fn init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        let env_filter = self.env_filter()?;
        let jsonl = &self.config.jsonl;

        let (file_layer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = file_writer(file_config)?;
                let layer = jsonl_layer(
                    writer,
                    jsonl.flatten_events,
                    jsonl.include_spans,
                    jsonl.include_location,
                    jsonl.include_thread_info,
                );
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let console = &self.config.console;
        let pretty_layer = (console.enabled && console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
        });
        let json_console_layer = (console.enabled && !console.pretty).then(|| {
            jsonl_layer(
                std::io::stdout,
                jsonl.flatten_events,
                jsonl.include_spans,
                jsonl.include_location,
                jsonl.include_thread_info,
            )
        });

        Registry::default()
            .with(env_filter)
            .with(NodeContextLayer::new())
            .with(pretty_layer)
            .with(json_console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| LoggingError::AlreadySet(e.to_string()))?;

        Ok(guard)
    }
}

impl Default for NwkSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-blocking writer for the configured rotation
fn file_writer(config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&config.directory)?;
    let rotation = match config.rotation {
        RotationStrategy::Never => {
            // Truncate a single file
            let path = config.directory.join(format!("{}.log", config.prefix));
            return Ok(tracing_appender::non_blocking(File::create(path)?));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.prefix)
        .filename_suffix("log");
    if let Some(max_files) = config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder
        .build(&config.directory)
        .map_err(|e| LoggingError::Appender(e.to_string()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// JSONL to console
pub fn init_default() -> Result<Option<WorkerGuard>, LoggingError> {
    NwkSubscriberBuilder::new().init()
}

/// Verbose, pretty console output
pub fn init_development() -> Result<Option<WorkerGuard>, LoggingError> {
    NwkSubscriberBuilder::new()
        .with_config(LogConfig::development())
        .init()
}

/// Warnings only; a subscriber that is already installed is kept
pub fn init_testing() {
    let _ = NwkSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_creation() {
        let builder = NwkSubscriberBuilder::new();
        assert_eq!(builder.config().default_level, "info");
    }

    #[test]
    fn test_default_is_jsonl() {
        let builder = NwkSubscriberBuilder::new();
        assert!(!builder.config().console.pretty);
    }

    #[test]
    fn test_builder_with_config() {
        let builder = NwkSubscriberBuilder::new().with_config(LogConfig::development());
        assert_eq!(builder.config().default_level, "debug");
        assert!(builder.config().console.pretty);
    }

    #[test]
    fn test_builder_with_level_and_console() {
        let builder = NwkSubscriberBuilder::new()
            .with_level("trace")
            .with_console(false);
        assert_eq!(builder.config().default_level, "trace");
        assert!(!builder.config().console.enabled);
    }

    #[test]
    fn test_invalid_directives_are_reported() {
        let builder = NwkSubscriberBuilder::new().with_level("info,nwkmesh=notalevel");
        // RUST_LOG may be set in the environment; only check the fallback
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(builder.env_filter(), Err(LoggingError::Filter(_))));
        }
    }

    #[test]
    fn test_never_rotation_creates_single_file() {
        let dir = std::env::temp_dir().join(format!("nwkmesh-log-{}", uuid::Uuid::new_v4()));
        let config = FileConfig {
            directory: dir.clone(),
            prefix: "node".to_string(),
            rotation: RotationStrategy::Never,
            max_files: None,
        };
        let (_writer, guard) = file_writer(&config).unwrap();
        drop(guard);
        assert!(dir.join("node.log").exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_init_testing_is_idempotent() {
        init_testing();
        init_testing();
        tracing::warn!("still logging");
    }
}
