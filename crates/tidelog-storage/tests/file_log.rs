//! Integration tests for the file log
//!
//! These tests exercise the log through the collaborator traits the scavenge
//! engine uses, including reopen after rewrites and merges.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tidelog_core::{
    Blake3StreamHasher, ChunkManager, ChunkReader, IndexReader, IndexScavenger, LogRecord,
    RecordForExecutor, StreamHandle, StreamHasher, StreamMetadata,
};
use tidelog_storage::{FileLog, FileLogConfig};

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn open_log(dir: &TempDir, chunk_size: u64) -> FileLog {
    let mut config = FileLogConfig::with_base_dir(dir.path()).with_chunk_size(chunk_size);
    config.sync_on_write = false;
    FileLog::open(config, Arc::new(Blake3StreamHasher)).unwrap()
}

/// Hasher that sends every stream to the same bucket
struct ConstantHasher;

impl StreamHasher for ConstantHasher {
    fn hash(&self, _stream_id: &str) -> u64 {
        42
    }
}

// ============================================================================
// Chunk Tests
// ============================================================================

#[test]
fn test_read_forward_spans_chunks() {
    let temp = TempDir::new().unwrap();
    let log = open_log(&temp, 256);

    for i in 0..12 {
        log.append_event("orders", "OrderPlaced", Bytes::from("payload"), ts(i))
            .unwrap();
    }
    log.append_commit(0, 0, ts(20)).unwrap();

    let records = log.read_forward(0, u64::MAX, usize::MAX).unwrap();
    assert_eq!(records.len(), 13);
    assert!(records.windows(2).all(|w| w[0].record.log_position() < w[1].record.log_position()));
    assert!(matches!(records.last().unwrap().record, LogRecord::Commit(_)));

    let limited = log.read_forward(0, u64::MAX, 5).unwrap();
    assert_eq!(limited.len(), 5);
}

#[test]
fn test_merge_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let log = open_log(&temp, 4096);
        for chunk in 0..3 {
            for i in 0..3 {
                log.append_event("orders", "OrderPlaced", Bytes::new(), ts(chunk * 10 + i))
                    .unwrap();
            }
            log.complete_chunk().unwrap();
        }

        let chunks = log.chunks().unwrap();
        let mut writer = log.create_chunk_writer(0, 2).unwrap();
        let mut record = RecordForExecutor::new();
        for chunk in &chunks {
            let mut reader = log.open_chunk(chunk).unwrap();
            while reader.read_next(&mut record).unwrap() {
                writer.write_record(&record).unwrap();
            }
        }
        let merged = writer.complete().unwrap();
        assert_eq!(merged.chunk_start_number, 0);
        assert_eq!(merged.chunk_end_number, 2);
        assert_eq!(log.chunks().unwrap().len(), 1);
    }

    let log = open_log(&temp, 4096);
    let chunks = log.chunks().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].logical_chunks(), 0..=2);
    assert_eq!(log.read_stream("orders").unwrap().len(), 9);

    // New appends land after the merged range
    let next = log
        .append_event("orders", "OrderPlaced", Bytes::new(), ts(100))
        .unwrap();
    assert_eq!(next.log_position, 3 * 4096);
    assert_eq!(next.event_number, 9);
}

#[test]
fn test_writer_requires_chunk_boundaries() {
    let temp = TempDir::new().unwrap();
    let log = open_log(&temp, 4096);
    for _ in 0..2 {
        log.append_event("orders", "OrderPlaced", Bytes::new(), ts(0))
            .unwrap();
        log.complete_chunk().unwrap();
    }

    assert!(log.create_chunk_writer(0, 1).is_ok());
    assert!(log.create_chunk_writer(0, 3).is_err());
    assert!(log.create_chunk_writer(5, 5).is_err());
}

#[test]
fn test_torn_tail_is_truncated() {
    let temp = TempDir::new().unwrap();
    {
        let log = open_log(&temp, 4096);
        for i in 0..3 {
            log.append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
                .unwrap();
        }
    }

    let active = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "active"))
        .unwrap();
    let mut file = std::fs::OpenOptions::new().append(true).open(&active).unwrap();
    file.write_all(&[0, 0, 0, 50, 1, 2]).unwrap();
    drop(file);

    let log = open_log(&temp, 4096);
    assert_eq!(log.read_stream("orders").unwrap().len(), 3);
    let next = log
        .append_event("orders", "OrderPlaced", Bytes::new(), ts(10))
        .unwrap();
    assert_eq!(next.event_number, 3);
}

// ============================================================================
// Index Tests
// ============================================================================

#[test]
fn test_colliding_streams_share_hash_bucket() {
    let temp = TempDir::new().unwrap();
    let config = FileLogConfig::with_base_dir(temp.path()).with_chunk_size(4096);
    let log = FileLog::open(config, Arc::new(ConstantHasher)).unwrap();

    log.append_event("a", "E", Bytes::new(), ts(0)).unwrap();
    log.append_event("b", "E", Bytes::new(), ts(1)).unwrap();
    log.append_event("a", "E", Bytes::new(), ts(2)).unwrap();
    let sp = log.read_all().unwrap().last().unwrap().log_position() + 1;

    // The hash handle sees both streams, the id handle only one
    let by_hash = log
        .read_event_infos_forward(&StreamHandle::Hash(42), 0, 10, sp)
        .unwrap();
    assert_eq!(by_hash.len(), 3);

    let by_id = log
        .read_event_infos_forward(&StreamHandle::for_id("a"), 0, 10, sp)
        .unwrap();
    assert_eq!(by_id.len(), 2);
    assert_eq!(
        log.last_event_number(&StreamHandle::for_id("b"), sp).unwrap(),
        Some(0)
    );

    assert_eq!(log.read_stream("a").unwrap().len(), 2);
    assert_eq!(log.stream_id_at(by_hash[0].log_position).unwrap().as_deref(), Some("a"));
}

#[test]
fn test_remove_index_entries() {
    let temp = TempDir::new().unwrap();
    let log = open_log(&temp, 4096);
    for i in 0..5 {
        log.append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
            .unwrap();
    }

    let entries = log.index_entries(None, 2).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(log.remove_index_entries(&entries).unwrap(), 2);
    assert_eq!(log.remove_index_entries(&entries).unwrap(), 0);
    assert_eq!(log.indexed_event_numbers("orders"), vec![2, 3, 4]);

    let rest = log.index_entries(entries.last(), 10).unwrap();
    assert_eq!(rest.len(), 3);
}

#[test]
fn test_metadata_written_to_metastream() {
    let temp = TempDir::new().unwrap();
    let log = open_log(&temp, 4096);

    let metadata = StreamMetadata::EMPTY.with_max_count(3);
    let written = log.set_stream_metadata("orders", &metadata, ts(0)).unwrap();
    assert_eq!(written.event_number, 0);

    let events = log.read_stream("$$orders").unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_metadata());
    assert_eq!(StreamMetadata::from_json(&events[0].data).unwrap(), metadata);
}
