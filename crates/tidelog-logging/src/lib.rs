//! Structured JSONL logging for tidelog
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines format for log aggregation (default)
//! - **Scavenge Context Injection**: Tie log entries to a scavenge run and phase
//! - **Per-phase levels**: Turn one phase up or down without touching the rest
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//!
//! # Quick Start
//!
//! ```ignore
//! use tidelog_logging::{ConsoleFormat, LogConfig, TidelogSubscriberBuilder};
//!
//! let config = LogConfig {
//!     console: ConsoleFormat::Pretty,
//!     ..LogConfig::default()
//! }
//! .with_phase_level("executing_chunks", "debug");
//! let _guard = TidelogSubscriberBuilder::new().with_config(config).init();
//! ```
//!
//! # Scavenge Context
//!
//! Use [`ScavengeContextGuard`] to tag a thread with the run being executed,
//! and [`phase_span`] to carry it into log records:
//!
//! ```ignore
//! use tidelog_logging::{ScavengeContextGuard, phase_span};
//!
//! let _run = ScavengeContextGuard::new(scavenge_point.event_number);
//! let _phase = ScavengeContextGuard::enter_phase("executing_chunks");
//! let _span = phase_span("executing_chunks").entered();
//! tracing::info!("Rewriting chunk");
//! ```

pub mod config;
pub mod context;
pub mod layers;

pub use config::{ConsoleFormat, FileConfig, JsonlConfig, LogConfig, RotationStrategy};
pub use context::{PHASE_SPAN, ScavengeContextData, ScavengeContextGuard, phase_span};
pub use layers::{ScavengeContextExtension, ScavengeContextLayer};

use std::fs::{self, File};

use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log directory or file could not be created
    #[error("Failed to open log output: {0}")]
    Io(#[from] std::io::Error),

    /// The rolling appender rejected its configuration
    #[error("Failed to create rolling appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    /// A global subscriber is already installed
    #[error("Failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    /// A level or filter directive did not parse
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    /// A phase level override names something that is not a phase
    #[error("Invalid phase name in phase_levels: {0:?}")]
    Phase(String),
}

/// Builder for configuring and initializing the tidelog logging subscriber
///
/// By default, console output uses JSONL format.
pub struct TidelogSubscriberBuilder {
    config: LogConfig,
}

impl TidelogSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
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

    /// Initialize the subscriber globally
    ///
    /// Returns a guard that must be kept alive for the duration of the
    /// program when file output is enabled. Failures are reported on stderr
    /// and leave logging disabled.
    pub fn init(self) -> Option<WorkerGuard> {
        match self.try_init() {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Warning: Failed to initialize logging: {e}");
                None
            }
        }
    }

    /// Try to initialize the subscriber globally
    ///
    /// Returns an error if a global subscriber has already been set.
    pub fn try_init(self) -> Result<Option<WorkerGuard>, LoggingError> {
        // A bad config is an error even when RUST_LOG takes over
        let configured = EnvFilter::try_new(self.config.filter_directives()?)?;
        let env_filter = EnvFilter::try_from_default_env().unwrap_or(configured);

        let console = self.config.console;
        let pretty_console = (console == ConsoleFormat::Pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(self.config.ansi)
                .with_target(true)
                .with_thread_names(self.config.jsonl.thread_names)
        });
        let jsonl_console = (console == ConsoleFormat::Jsonl)
            .then(|| layers::jsonl_layer(std::io::stdout, &self.config.jsonl));

        let (file_layer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = create_file_writer(file_config)?;
                (
                    Some(layers::jsonl_layer(writer, &self.config.jsonl)),
                    Some(guard),
                )
            }
            None => (None, None),
        };

        Registry::default()
            .with(env_filter)
            .with(ScavengeContextLayer::new())
            .with(pretty_console)
            .with(jsonl_console)
            .with(file_layer)
            .try_init()?;

        Ok(guard)
    }
}

impl Default for TidelogSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// File name prefix of log files
const LOG_FILE_PREFIX: &str = "tidelog";

/// Create a non-blocking file writer; truncates for `Never`, appends otherwise
fn create_file_writer(file_config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
    fs::create_dir_all(&file_config.directory)?;

    let rotation = match file_config.rotation {
        RotationStrategy::Never => {
            let file_path = file_config.directory.join(format!("{LOG_FILE_PREFIX}.log"));
            let file = File::create(&file_path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log");
    if let Some(max_files) = file_config.max_files {
        builder = builder.max_log_files(max_files);
    }
    let appender = builder.build(&file_config.directory)?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Initialize logging for testing (minimal output)
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_testing() {
    let _ = TidelogSubscriberBuilder::new()
        .with_config(LogConfig::testing())
        .try_init();
}
