//! Logging configuration, the `[logging]` table of the tool's config file
//!
//! ```toml
//! [logging]
//! default_level = "info"
//! console = "pretty"
//!
//! # Louder or quieter output for single scavenge phases
//! [logging.phase_levels]
//! executing_chunks = "debug"
//! accumulating = "warn"
//!
//! [logging.file]
//! directory = "/var/log/tidelog"
//! rotation = "daily"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::LoggingError;
use crate::context::PHASE_SPAN;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for everything without an override; `RUST_LOG` replaces it
    pub default_level: String,
    /// Level per scavenge phase, keyed by phase name (`calculating`, ...)
    pub phase_levels: BTreeMap<String, String>,
    /// Console output format
    pub console: ConsoleFormat,
    /// ANSI colors in pretty console output
    pub ansi: bool,
    /// Optional JSONL file output
    pub file: Option<FileConfig>,
    /// Fields of JSONL records
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            phase_levels: BTreeMap::new(),
            console: ConsoleFormat::Jsonl,
            ansi: false,
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Quiet JSONL console output for test binaries
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            ..Default::default()
        }
    }

    /// Override the level of one phase
    pub fn with_phase_level(mut self, phase: impl Into<String>, level: impl Into<String>) -> Self {
        self.phase_levels.insert(phase.into(), level.into());
        self
    }

    /// `EnvFilter` directives for the default level and every phase override
    ///
    /// Phase overrides match the span created by
    /// [`phase_span`](crate::context::phase_span), so they cover chunk
    /// executor workers as well as the coordinating thread.
    pub fn filter_directives(&self) -> Result<String, LoggingError> {
        let mut directives = vec![self.default_level.clone()];
        for (phase, level) in &self.phase_levels {
            if phase.is_empty() || !phase.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
                return Err(LoggingError::Phase(phase.clone()));
            }
            directives.push(format!("[{PHASE_SPAN}{{phase={phase}}}]={level}"));
        }
        Ok(directives.join(","))
    }
}

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    /// One JSON object per line
    #[default]
    Jsonl,
    /// Human-readable
    Pretty,
    /// No console output
    Off,
}

/// Rolling JSONL file output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    pub rotation: RotationStrategy,
    /// Rotated files kept; `None` keeps all
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            rotation: RotationStrategy::Daily,
            max_files: Some(7),
        }
    }
}

/// File rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// A single file, truncated on start
    Never,
}

/// JSONL record contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Every enclosing span, not just the innermost; carries run and phase
    pub span_list: bool,
    /// Thread names, which identify chunk executor workers
    pub thread_names: bool,
    /// Source file and line
    pub location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            span_list: true,
            thread_names: true,
            location: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::EnvFilter;

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.default_level, "info");
        assert_eq!(config.console, ConsoleFormat::Jsonl);
        assert!(config.file.is_none());
        assert_eq!(config.filter_directives().unwrap(), "info");
    }

    #[test]
    fn test_phase_levels_become_span_directives() {
        let config = LogConfig::default()
            .with_phase_level("executing_chunks", "debug")
            .with_phase_level("accumulating", "warn");
        let directives = config.filter_directives().unwrap();
        assert_eq!(
            directives,
            "info,[phase{phase=accumulating}]=warn,[phase{phase=executing_chunks}]=debug"
        );
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn test_rejects_malformed_phase_name() {
        let config = LogConfig::default().with_phase_level("calc}]=trace,[x", "debug");
        assert!(matches!(
            config.filter_directives(),
            Err(LoggingError::Phase(_))
        ));
    }

    #[test]
    fn test_logging_table() {
        let config: LogConfig = serde_json::from_str(
            r#"{
                "default_level": "debug",
                "console": "pretty",
                "phase_levels": {"calculating": "trace"},
                "file": {"rotation": "hourly"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.console, ConsoleFormat::Pretty);
        assert_eq!(config.phase_levels["calculating"], "trace");
        let file = config.file.unwrap();
        assert_eq!(file.rotation, RotationStrategy::Hourly);
        assert_eq!(file.max_files, Some(7));
        assert!(config.jsonl.thread_names);
    }
}
