mod config;

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tidelog_core::{
    Blake3StreamHasher, ChunkReader, ScavengePointSource, StreamHasher, StreamMetadata,
};
use tidelog_logging::TidelogSubscriberBuilder;
use tidelog_scavenge::{RedbStateBackend, ScavengeOutcome, ScavengeState, Scavenger};
use tidelog_storage::FileLog;

use config::{Cli, Command, ToolConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ToolConfig::from_file(path)?,
        None => ToolConfig::default(),
    };
    config.apply(&cli);

    let _log_guard = TidelogSubscriberBuilder::new()
        .with_config(config.logging.clone())
        .init();

    let hasher: Arc<dyn StreamHasher> = Arc::new(Blake3StreamHasher);
    let log = Arc::new(
        FileLog::open(config.storage.file_log(), hasher.clone()).with_context(|| {
            format!("failed to open log in {}", config.storage.data_dir.display())
        })?,
    );

    match cli.command {
        Command::Scavenge { effective_now, .. } => {
            if let Some(effective_now) = effective_now {
                let point = log.add_scavenge_point(effective_now, config.scavenge.threshold)?;
                println!("Added scavenge point {point}");
            }
            let state = open_state(&config, hasher)?;
            let scavenger = Scavenger::new(log, state, config.scavenge.clone());
            run_scavenge(scavenger).await?;
        }

        Command::Status => {
            let state = open_state(&config, hasher)?;
            print_status(&log, &state)?;
        }

        Command::Append {
            stream,
            count,
            event_type,
            data,
        } => {
            serde_json::from_str::<serde_json::Value>(&data).context("event data is not JSON")?;
            let data = Bytes::from(data);
            let mut last = None;
            for _ in 0..count {
                let appended =
                    log.append_event(&stream, &event_type, data.clone(), chrono::Utc::now())?;
                last = Some(appended);
            }
            if let Some(last) = last {
                println!(
                    "Appended {count} event(s) to {stream}, last #{} at {}",
                    last.event_number, last.log_position
                );
            }
        }

        Command::SetMetadata {
            stream,
            max_age,
            max_count,
            truncate_before,
        } => {
            let metadata = StreamMetadata {
                max_age: max_age.map(std::time::Duration::from_secs),
                max_count,
                truncate_before,
            };
            let appended = log.set_stream_metadata(&stream, &metadata, chrono::Utc::now())?;
            println!(
                "Metadata #{} written for {stream} at {}",
                appended.event_number, appended.log_position
            );
        }

        Command::Delete { stream } => {
            let appended = log.delete_stream(&stream, chrono::Utc::now())?;
            println!("Deleted {stream} at {}", appended.log_position);
        }

        Command::CompleteChunk => match log.complete_chunk()? {
            Some(chunk) => println!(
                "Completed chunk {} ({} bytes)",
                chunk.chunk_start_number, chunk.physical_data_size
            ),
            None => println!("No active chunk"),
        },

        Command::Read { stream } => {
            for event in log.read_stream(&stream)? {
                println!(
                    "#{:<6} {:<20} {} {}",
                    event.event_number,
                    event.event_type,
                    event.timestamp.to_rfc3339(),
                    String::from_utf8_lossy(&event.data)
                );
            }
        }
    }

    Ok(())
}

fn open_state(
    config: &ToolConfig,
    hasher: Arc<dyn StreamHasher>,
) -> anyhow::Result<ScavengeState<RedbStateBackend>> {
    let state_config = config.storage.state();
    let backend = RedbStateBackend::open(state_config.clone()).with_context(|| {
        format!(
            "failed to open scavenge state {}",
            state_config.db_path.display()
        )
    })?;
    Ok(ScavengeState::new(backend, hasher))
}

/// Run the blocking scavenger off the runtime; Ctrl-C cancels it
async fn run_scavenge(scavenger: Scavenger<FileLog, RedbStateBackend>) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping at the next checkpoint");
                cancel.cancel();
            }
        })
    };

    let worker = tokio::task::spawn_blocking(move || {
        let outcome = scavenger.run(&cancel)?;
        let checkpoint = scavenger.checkpoint()?;
        Ok::<_, tidelog_scavenge::ScavengeError>((outcome, checkpoint))
    });
    let result = worker.await.context("scavenge worker panicked")?;
    interrupt.abort();

    let (outcome, checkpoint) = result.context("scavenge failed")?;
    let checkpoint = checkpoint.map_or_else(|| "none".to_string(), |c| c.to_string());
    match outcome {
        ScavengeOutcome::Completed => {
            info!(%checkpoint, "Scavenge finished");
            println!("Scavenge complete: {checkpoint}");
        }
        ScavengeOutcome::Cancelled => {
            println!("Scavenge stopped at {checkpoint}; run again to resume");
        }
    }
    Ok(())
}

fn print_status(log: &FileLog, state: &ScavengeState<RedbStateBackend>) -> anyhow::Result<()> {
    match state.checkpoint()? {
        Some(checkpoint) => println!("Checkpoint:   {checkpoint}"),
        None => println!("Checkpoint:   none"),
    }
    match log.latest_scavenge_point()? {
        Some(point) => println!(
            "Latest point: {point} (effective {}, threshold {})",
            point.effective_now.to_rfc3339(),
            point.threshold
        ),
        None => println!("Latest point: none"),
    }

    println!();
    println!("{:<12} {:>12} {:>10}  state", "chunks", "bytes", "weight");
    for chunk in log.chunks()? {
        let range = format!("{}-{}", chunk.chunk_start_number, chunk.chunk_end_number);
        let weight = state.sum_chunk_weights(chunk.chunk_start_number..=chunk.chunk_end_number)?;
        let status = if chunk.is_read_only { "complete" } else { "active" };
        println!(
            "{range:<12} {:>12} {weight:>10.1}  {status}",
            chunk.physical_data_size
        );
    }

    let collisions = state.collisions()?;
    if !collisions.is_empty() {
        println!();
        println!("Colliding streams: {}", collisions.join(", "));
    }
    Ok(())
}
