//! Shared fixtures for scavenge integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use tidelog_core::{
    Blake3StreamHasher, ChunkInfo, ChunkManager, ChunkReader, ChunkRecordReader, ChunkWriter,
    EventInfo, IndexEntry, IndexReader, IndexScavenger, LogError, LogPosition, LogRecord,
    RecordForExecutor, RecordForScavenge, ScavengePoint, ScavengePointSource, StreamHandle,
    StreamHasher, StreamMetadata,
};
use tidelog_logging::{ScavengeContextData, ScavengeContextGuard};
use tidelog_scavenge::{
    InMemoryStateBackend, ScavengeConfig, ScavengeOutcome, ScavengeState, Scavenger,
    StateBackend,
};
use tidelog_storage::{FileLog, FileLogConfig};

pub const CHUNK_SIZE: u64 = 4096;

pub fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn open_log(dir: &TempDir, hasher: Arc<dyn StreamHasher>) -> Arc<FileLog> {
    tidelog_logging::init_testing();
    let mut config =
        FileLogConfig::with_base_dir(dir.path().join("chunks")).with_chunk_size(CHUNK_SIZE);
    config.sync_on_write = false;
    Arc::new(FileLog::open(config, hasher).unwrap())
}

pub fn memory_state(hasher: Arc<dyn StreamHasher>) -> ScavengeState<InMemoryStateBackend> {
    ScavengeState::new(InMemoryStateBackend::new(), hasher)
}

pub fn default_hasher() -> Arc<dyn StreamHasher> {
    Arc::new(Blake3StreamHasher)
}

/// Scavenge to completion at a fixed clock
pub fn scavenge<L, B>(scavenger: &Scavenger<L, B>, log: &FileLog, effective_now: DateTime<Utc>)
where
    L: tidelog_scavenge::ScavengeLog + ?Sized,
    B: StateBackend,
{
    log.add_scavenge_point(effective_now, scavenger.config().threshold)
        .unwrap();
    let outcome = scavenger.run(&CancellationToken::new()).unwrap();
    assert_eq!(outcome, ScavengeOutcome::Completed);
}

/// Event numbers of a stream physically present in the log
pub fn physical_events(log: &FileLog, stream_id: &str) -> Vec<u64> {
    log.read_all()
        .unwrap()
        .into_iter()
        .filter_map(|record| match record {
            LogRecord::Prepare(prepare) if prepare.stream_id == stream_id => {
                Some(prepare.event_number)
            }
            _ => None,
        })
        .collect()
}

/// Streams written by [`populate`], one per chunk; the last is deleted
pub const STREAMS: [&str; 4] = ["orders", "carts", "invoices", "doomed"];

/// Four chunks of trimmed streams plus a chunk holding a tombstone
pub fn populate(log: &FileLog) {
    for (chunk, stream) in STREAMS.iter().enumerate() {
        let max_count = chunk as u64 + 1;
        log.set_stream_metadata(stream, &StreamMetadata::default().with_max_count(max_count), ts(0))
            .unwrap();
        for _ in 0..6 {
            log.append_event(stream, "changed", Bytes::from_static(b"{}"), ts(1))
                .unwrap();
        }
        log.append_event("audit", "seen", Bytes::from_static(b"{}"), ts(1))
            .unwrap();
        log.complete_chunk().unwrap();
    }
    log.delete_stream("doomed", ts(2)).unwrap();
    log.complete_chunk().unwrap();
}

/// Same records and the same index for every populated stream
pub fn assert_same_outcome(expected: &FileLog, actual: &FileLog) {
    assert_eq!(expected.read_all().unwrap(), actual.read_all().unwrap());
    for stream in STREAMS.iter().chain(["audit"].iter()) {
        assert_eq!(
            expected.indexed_event_numbers(stream),
            actual.indexed_event_numbers(stream),
            "index of {stream}"
        );
    }
}

pub fn small_config() -> ScavengeConfig {
    ScavengeConfig::default()
        .with_accumulator_commit_every(2)
        .with_calculator_batch_size(1)
        .with_calculator_buffer_size(2)
}

/// Log wrapper that fires a cancellation token after a number of reads
pub struct CancellingLog {
    inner: Arc<FileLog>,
    token: parking_lot::Mutex<CancellationToken>,
    remaining: AtomicUsize,
}

impl CancellingLog {
    pub fn new(inner: Arc<FileLog>) -> Self {
        Self {
            inner,
            token: parking_lot::Mutex::new(CancellationToken::new()),
            remaining: AtomicUsize::new(usize::MAX),
        }
    }

    /// Fresh token that fires on the `reads`-th read from now
    pub fn arm(&self, reads: usize) -> CancellationToken {
        let token = CancellationToken::new();
        *self.token.lock() = token.clone();
        self.remaining.store(reads, Ordering::SeqCst);
        token
    }

    fn tick(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous == 1 {
            self.token.lock().cancel();
        }
    }
}

impl ChunkReader for CancellingLog {
    fn chunk_size(&self) -> u64 {
        self.inner.chunk_size()
    }

    fn chunks(&self) -> Result<Vec<ChunkInfo>, LogError> {
        self.inner.chunks()
    }

    fn read_forward(
        &self,
        from: LogPosition,
        until: LogPosition,
        max_count: usize,
    ) -> Result<Vec<RecordForScavenge>, LogError> {
        let records = self.inner.read_forward(from, until, max_count);
        self.tick();
        records
    }

    fn open_chunk<'a>(
        &'a self,
        chunk: &ChunkInfo,
    ) -> Result<Box<dyn ChunkRecordReader + 'a>, LogError> {
        let reader = self.inner.open_chunk(chunk);
        self.tick();
        reader
    }

    fn stream_id_at(&self, position: LogPosition) -> Result<Option<String>, LogError> {
        self.inner.stream_id_at(position)
    }
}

impl ChunkManager for CancellingLog {
    fn create_chunk_writer<'a>(
        &'a self,
        chunk_start_number: u32,
        chunk_end_number: u32,
    ) -> Result<Box<dyn ChunkWriter + 'a>, LogError> {
        self.inner
            .create_chunk_writer(chunk_start_number, chunk_end_number)
    }
}

impl IndexReader for CancellingLog {
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: LogPosition,
    ) -> Result<Option<u64>, LogError> {
        let last = self.inner.last_event_number(handle, scavenge_point);
        self.tick();
        last
    }

    fn read_event_infos_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: u64,
        max_count: usize,
        scavenge_point: LogPosition,
    ) -> Result<Vec<EventInfo>, LogError> {
        self.inner
            .read_event_infos_forward(handle, from_event_number, max_count, scavenge_point)
    }
}

impl IndexScavenger for CancellingLog {
    fn index_entries(
        &self,
        after: Option<&IndexEntry>,
        max_count: usize,
    ) -> Result<Vec<IndexEntry>, LogError> {
        let entries = self.inner.index_entries(after, max_count);
        self.tick();
        entries
    }

    fn remove_index_entries(&self, entries: &[IndexEntry]) -> Result<usize, LogError> {
        self.inner.remove_index_entries(entries)
    }
}

impl ScavengePointSource for CancellingLog {
    fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>, LogError> {
        self.inner.latest_scavenge_point()
    }

    fn add_scavenge_point(
        &self,
        effective_now: DateTime<Utc>,
        threshold: f32,
    ) -> Result<ScavengePoint, LogError> {
        self.inner.add_scavenge_point(effective_now, threshold)
    }
}

/// Where and under which run context a chunk writer was created
#[derive(Debug, Clone)]
pub struct WriterOrigin {
    pub chunk_start_number: u32,
    pub thread: Option<String>,
    pub context: Option<ScavengeContextData>,
}

/// Log wrapper that records chunk rewrites and can fail one switch-in
///
/// Records which chunks got a writer and which were switched in, so tests
/// can tell redone work from kept work.
pub struct RecordingLog {
    inner: Arc<FileLog>,
    failing_chunk: parking_lot::Mutex<Option<u32>>,
    writers: parking_lot::Mutex<Vec<WriterOrigin>>,
    switched_in: parking_lot::Mutex<BTreeSet<u32>>,
}

impl RecordingLog {
    pub fn new(inner: Arc<FileLog>) -> Self {
        Self {
            inner,
            failing_chunk: parking_lot::Mutex::new(None),
            writers: parking_lot::Mutex::new(Vec::new()),
            switched_in: parking_lot::Mutex::new(BTreeSet::new()),
        }
    }

    /// Fail the switch-in of the chunk starting at `chunk_start_number`
    pub fn fail_switch_in(&self, chunk_start_number: u32) {
        *self.failing_chunk.lock() = Some(chunk_start_number);
    }

    /// Let every later switch-in succeed
    pub fn repair(&self) {
        *self.failing_chunk.lock() = None;
    }

    /// Writers created so far, then clears the list
    pub fn take_writers(&self) -> Vec<WriterOrigin> {
        std::mem::take(&mut *self.writers.lock())
    }

    /// Chunk start numbers whose replacement was switched in
    pub fn switched_in(&self) -> BTreeSet<u32> {
        self.switched_in.lock().clone()
    }
}

struct FailingWriter<'a> {
    inner: Box<dyn ChunkWriter + 'a>,
    log: &'a RecordingLog,
    chunk_start_number: u32,
}

impl ChunkWriter for FailingWriter<'_> {
    fn write_record(&mut self, record: &RecordForExecutor) -> Result<(), LogError> {
        self.inner.write_record(record)
    }

    fn complete(self: Box<Self>) -> Result<ChunkInfo, LogError> {
        let this = *self;
        if *this.log.failing_chunk.lock() == Some(this.chunk_start_number) {
            this.inner.abort();
            return Err(LogError::Io(format!(
                "no space left switching in chunk {}",
                this.chunk_start_number
            )));
        }
        let info = this.inner.complete()?;
        this.log.switched_in.lock().insert(this.chunk_start_number);
        Ok(info)
    }

    fn abort(self: Box<Self>) {
        self.inner.abort();
    }
}

impl ChunkReader for RecordingLog {
    fn chunk_size(&self) -> u64 {
        self.inner.chunk_size()
    }

    fn chunks(&self) -> Result<Vec<ChunkInfo>, LogError> {
        self.inner.chunks()
    }

    fn read_forward(
        &self,
        from: LogPosition,
        until: LogPosition,
        max_count: usize,
    ) -> Result<Vec<RecordForScavenge>, LogError> {
        self.inner.read_forward(from, until, max_count)
    }

    fn open_chunk<'a>(
        &'a self,
        chunk: &ChunkInfo,
    ) -> Result<Box<dyn ChunkRecordReader + 'a>, LogError> {
        self.inner.open_chunk(chunk)
    }

    fn stream_id_at(&self, position: LogPosition) -> Result<Option<String>, LogError> {
        self.inner.stream_id_at(position)
    }
}

impl ChunkManager for RecordingLog {
    fn create_chunk_writer<'a>(
        &'a self,
        chunk_start_number: u32,
        chunk_end_number: u32,
    ) -> Result<Box<dyn ChunkWriter + 'a>, LogError> {
        let inner = self
            .inner
            .create_chunk_writer(chunk_start_number, chunk_end_number)?;
        self.writers.lock().push(WriterOrigin {
            chunk_start_number,
            thread: std::thread::current().name().map(str::to_string),
            context: ScavengeContextGuard::current(),
        });
        Ok(Box::new(FailingWriter {
            inner,
            log: self,
            chunk_start_number,
        }))
    }
}

impl IndexReader for RecordingLog {
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: LogPosition,
    ) -> Result<Option<u64>, LogError> {
        self.inner.last_event_number(handle, scavenge_point)
    }

    fn read_event_infos_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: u64,
        max_count: usize,
        scavenge_point: LogPosition,
    ) -> Result<Vec<EventInfo>, LogError> {
        self.inner
            .read_event_infos_forward(handle, from_event_number, max_count, scavenge_point)
    }
}

impl IndexScavenger for RecordingLog {
    fn index_entries(
        &self,
        after: Option<&IndexEntry>,
        max_count: usize,
    ) -> Result<Vec<IndexEntry>, LogError> {
        self.inner.index_entries(after, max_count)
    }

    fn remove_index_entries(&self, entries: &[IndexEntry]) -> Result<usize, LogError> {
        self.inner.remove_index_entries(entries)
    }
}

impl ScavengePointSource for RecordingLog {
    fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>, LogError> {
        self.inner.latest_scavenge_point()
    }

    fn add_scavenge_point(
        &self,
        effective_now: DateTime<Utc>,
        threshold: f32,
    ) -> Result<ScavengePoint, LogError> {
        self.inner.add_scavenge_point(effective_now, threshold)
    }
}
