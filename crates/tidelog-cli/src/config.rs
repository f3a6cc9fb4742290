use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use tidelog_logging::{ConsoleFormat, LogConfig};
use tidelog_scavenge::{RedbStateConfig, ScavengeConfig};
use tidelog_storage::FileLogConfig;

/// Settings loaded from the optional TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub storage: StorageConfig,
    pub scavenge: ScavengeConfig,
    pub logging: LogConfig,
}

/// Where the log and the scavenge state live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub chunk_size: u64,
    pub index_timestamps: bool,
    pub sync_on_write: bool,
    /// redb cache size in bytes
    pub state_cache_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let log = FileLogConfig::default();
        Self {
            data_dir: PathBuf::from("./data"),
            chunk_size: log.chunk_size,
            index_timestamps: log.index_timestamps,
            sync_on_write: log.sync_on_write,
            state_cache_size: RedbStateConfig::default().cache_size,
        }
    }
}

impl StorageConfig {
    /// Chunk directory configuration
    pub fn file_log(&self) -> FileLogConfig {
        let mut config = FileLogConfig::with_base_dir(self.data_dir.join("chunks"))
            .with_chunk_size(self.chunk_size)
            .with_index_timestamps(self.index_timestamps);
        config.sync_on_write = self.sync_on_write;
        config
    }

    /// Scavenge state database configuration
    pub fn state(&self) -> RedbStateConfig {
        RedbStateConfig {
            db_path: self.data_dir.join("scavenge.redb"),
            cache_size: self.state_cache_size,
        }
    }
}

impl ToolConfig {
    /// Load from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Parse from TOML text; missing sections take their defaults
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command line overrides
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(data_dir) = &cli.data_dir {
            self.storage.data_dir = data_dir.clone();
        }
        if let Some(level) = &cli.log_level {
            self.logging.default_level = level.clone();
        }
        if cli.pretty {
            self.logging.console = ConsoleFormat::Pretty;
            self.logging.ansi = true;
        }
        if let Command::Scavenge {
            threshold,
            threads,
            no_merge,
            clean_archived,
            ..
        } = &cli.command
        {
            if let Some(threshold) = threshold {
                self.scavenge.threshold = *threshold;
            }
            if let Some(threads) = threads {
                self.scavenge.chunk_executor_threads = (*threads).max(1);
            }
            if *no_merge {
                self.scavenge.merge_chunks = false;
            }
            if *clean_archived {
                self.scavenge.clean_archived = true;
            }
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "tidelog", about = "Inspect and scavenge a tidelog file log")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Data directory (overrides the config file)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    /// Human-readable console logs instead of JSONL
    #[arg(long, global = true)]
    pub pretty: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run or resume a scavenge; Ctrl-C stops at the next checkpoint
    Scavenge {
        /// Minimum chunk weight to rewrite a chunk; negative rewrites all
        #[arg(long, allow_negative_numbers = true)]
        threshold: Option<f32>,
        /// Chunk executor worker threads
        #[arg(long)]
        threads: Option<usize>,
        /// Skip merging small chunks
        #[arg(long)]
        no_merge: bool,
        /// Also drop state rows of archived streams
        #[arg(long)]
        clean_archived: bool,
        /// Start a new run at this time (RFC 3339) instead of now
        #[arg(long)]
        effective_now: Option<DateTime<Utc>>,
    },
    /// Show the scavenge checkpoint, chunks and collisions
    Status,
    /// Append events to a stream
    Append {
        stream: String,
        /// Number of events to append
        #[arg(long, default_value_t = 1)]
        count: u64,
        /// Event type
        #[arg(long, default_value = "event")]
        event_type: String,
        /// JSON body of each event
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Set discard policies on a stream
    SetMetadata {
        stream: String,
        /// Maximum event age in seconds
        #[arg(long)]
        max_age: Option<u64>,
        /// Number of newest events to keep
        #[arg(long)]
        max_count: Option<u64>,
        /// Discard events numbered below this
        #[arg(long)]
        truncate_before: Option<u64>,
    },
    /// Hard delete a stream
    Delete { stream: String },
    /// Complete the active chunk
    CompleteChunk,
    /// Print the surviving events of a stream
    Read { stream: String },
}
