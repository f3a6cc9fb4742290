//! File-backed chunked log
//!
//! Records are appended to the active chunk until it is full, at which point
//! the chunk is completed (made read-only) and a new one is started. Log
//! positions are logical: chunk `n` covers positions
//! `n * chunk_size .. (n + 1) * chunk_size` regardless of how many bytes its
//! file holds after scavenging.
//!
//! The index and the record location map live in memory and are rebuilt by
//! replaying every chunk on open.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use tidelog_core::{
    ChunkInfo, ChunkManager, ChunkReader, ChunkRecordReader, ChunkWriter, CommitRecord,
    EventInfo, IndexEntry, IndexReader, IndexScavenger, LogError, LogPosition, LogRecord,
    PrepareRecord, RecordForExecutor, RecordForScavenge, RecordView, SCAVENGE_POINTS_STREAM,
    ScavengePoint, ScavengePointPayload, ScavengePointSource, StreamHandle, StreamHasher,
    StreamMetadata, SystemRecord, TOMBSTONE_EVENT_NUMBER, event_types, is_metastream,
    metastream_of, original_stream_of,
};

use crate::chunk_file::{
    self, DiscoveredChunk, FileChunkRecordReader, LENGTH_PREFIX_SIZE, active_path, completed_path,
    temp_path,
};
use crate::index::HashIndex;

/// Configuration for a file log
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    /// Directory holding chunk files
    pub base_dir: PathBuf,
    /// Log positions covered by one logical chunk
    pub chunk_size: u64,
    /// Whether to sync the active chunk after every append
    pub sync_on_write: bool,
    /// Largest record accepted on write or read
    pub max_record_size: usize,
    /// Whether index lookups report exact event timestamps
    pub index_timestamps: bool,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/chunks"),
            chunk_size: 256 * 1024 * 1024, // 256MB
            sync_on_write: true,
            max_record_size: 16 * 1024 * 1024, // 16MB
            index_timestamps: false,
        }
    }
}

impl FileLogConfig {
    /// Create a configuration rooted at `base_dir`
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    /// Set the logical chunk size
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set whether index lookups report exact timestamps
    pub fn with_index_timestamps(mut self, enabled: bool) -> Self {
        self.index_timestamps = enabled;
        self
    }
}

/// Where a record currently lives
#[derive(Debug, Clone)]
struct RecordLocation {
    chunk_start: u32,
    offset: u64,
    stream_id: Option<Arc<str>>,
}

#[derive(Debug)]
struct ChunkFile {
    info: ChunkInfo,
    path: PathBuf,
}

#[derive(Debug)]
struct ActiveChunk {
    number: u32,
    file: File,
    path: PathBuf,
    next_position: LogPosition,
    data_size: u64,
}

#[derive(Debug, Default)]
struct LogState {
    /// Completed chunks keyed by first logical chunk number
    chunks: BTreeMap<u32, ChunkFile>,
    active: Option<ActiveChunk>,
    next_chunk_number: u32,
    locations: BTreeMap<LogPosition, RecordLocation>,
    index: HashIndex,
    stream_versions: HashMap<String, u64>,
    latest_scavenge_point: Option<ScavengePoint>,
}

impl LogState {
    fn path_for(&self, chunk_start: u32) -> Result<&PathBuf, LogError> {
        if let Some(active) = &self.active
            && active.number == chunk_start
        {
            return Ok(&active.path);
        }
        self.chunks
            .get(&chunk_start)
            .map(|c| &c.path)
            .ok_or_else(|| LogError::not_found(format!("chunk {chunk_start}")))
    }
}

/// Result of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    pub log_position: LogPosition,
    pub event_number: u64,
}

/// Chunked, append-only log on the local filesystem
pub struct FileLog {
    config: FileLogConfig,
    hasher: Arc<dyn StreamHasher>,
    state: RwLock<LogState>,
}

impl FileLog {
    /// Open or create a log in `config.base_dir`
    #[instrument(skip_all, fields(path = %config.base_dir.display()))]
    pub fn open(config: FileLogConfig, hasher: Arc<dyn StreamHasher>) -> Result<Self, LogError> {
        if config.chunk_size <= LENGTH_PREFIX_SIZE {
            return Err(LogError::invalid_operation("chunk size too small"));
        }

        std::fs::create_dir_all(&config.base_dir)?;

        let log = Self {
            config,
            hasher,
            state: RwLock::new(LogState::default()),
        };

        {
            let mut state = log.state.write();
            for chunk in chunk_file::discover_chunks(&log.config.base_dir)? {
                log.replay_chunk(&mut state, chunk)?;
            }
            info!(
                chunks = state.chunks.len(),
                records = state.locations.len(),
                index_entries = state.index.len(),
                "Opened file log"
            );
        }

        Ok(log)
    }

    /// Configuration in use
    pub fn config(&self) -> &FileLogConfig {
        &self.config
    }

    /// Hasher shared with the index
    pub fn hasher(&self) -> Arc<dyn StreamHasher> {
        Arc::clone(&self.hasher)
    }

    fn replay_chunk(&self, state: &mut LogState, chunk: DiscoveredChunk) -> Result<(), LogError> {
        let file = File::open(&chunk.path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut buffer = Vec::new();
        let mut offset = 0u64;
        let start_position = u64::from(chunk.chunk_start_number) * self.config.chunk_size;
        let mut next_position = start_position;

        while offset < file_size {
            let read = chunk_file::read_framed(
                &mut reader,
                &mut buffer,
                offset,
                self.config.max_record_size,
            )
            .and_then(|more| {
                if more {
                    LogRecord::decode(&buffer).map(Some)
                } else {
                    Ok(None)
                }
            });

            let record = match read {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) if chunk.is_active => {
                    warn!(offset, error = %e, "Truncating torn tail of active chunk");
                    let file = OpenOptions::new().write(true).open(&chunk.path)?;
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                Err(e) => return Err(e),
            };

            let size = LENGTH_PREFIX_SIZE + buffer.len() as u64;
            next_position = record.log_position() + size;
            self.apply_record(state, &record, chunk.chunk_start_number, offset);
            offset += size;
        }

        if chunk.is_active {
            let file = OpenOptions::new().append(true).open(&chunk.path)?;
            let data_size = file.metadata()?.len();
            state.active = Some(ActiveChunk {
                number: chunk.chunk_start_number,
                file,
                path: chunk.path,
                next_position,
                data_size,
            });
        } else {
            let info = ChunkInfo {
                chunk_start_number: chunk.chunk_start_number,
                chunk_end_number: chunk.chunk_end_number,
                start_position,
                end_position: (u64::from(chunk.chunk_end_number) + 1) * self.config.chunk_size,
                physical_data_size: offset,
                is_read_only: true,
            };
            state.chunks.insert(
                chunk.chunk_start_number,
                ChunkFile {
                    info,
                    path: chunk.path,
                },
            );
        }
        state.next_chunk_number = chunk.chunk_end_number + 1;

        debug!(
            chunk_start = chunk.chunk_start_number,
            chunk_end = chunk.chunk_end_number,
            bytes = offset,
            "Replayed chunk"
        );
        Ok(())
    }

    fn apply_record(&self, state: &mut LogState, record: &LogRecord, chunk_start: u32, offset: u64) {
        let stream_id = match record {
            LogRecord::Prepare(prepare) => {
                let hash = self.hasher.hash(&prepare.stream_id);
                state.index.insert(
                    IndexEntry {
                        stream_hash: hash,
                        event_number: prepare.event_number,
                        log_position: prepare.log_position,
                    },
                    prepare.timestamp,
                );

                let version = state
                    .stream_versions
                    .entry(prepare.stream_id.clone())
                    .or_insert(prepare.event_number);
                *version = (*version).max(prepare.event_number);

                if prepare.stream_id == SCAVENGE_POINTS_STREAM
                    && prepare.event_type == event_types::SCAVENGE_POINT
                {
                    match ScavengePointPayload::from_json(&prepare.data) {
                        Ok(payload) => {
                            state.latest_scavenge_point = Some(ScavengePoint {
                                position: prepare.log_position,
                                event_number: prepare.event_number,
                                effective_now: payload.effective_now,
                                threshold: payload.threshold,
                            });
                        }
                        Err(e) => {
                            warn!(position = prepare.log_position, error = %e, "Unreadable scavenge point");
                        }
                    }
                }

                Some(Arc::from(prepare.stream_id.as_str()))
            }
            LogRecord::Commit(_) | LogRecord::System(_) => None,
        };

        state.locations.insert(
            record.log_position(),
            RecordLocation {
                chunk_start,
                offset,
                stream_id,
            },
        );
    }

    fn ensure_active<'s>(&self, state: &'s mut LogState) -> Result<&'s mut ActiveChunk, LogError> {
        if state.active.is_none() {
            let number = state.next_chunk_number;
            let path = active_path(&self.config.base_dir, number);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            debug!(chunk = number, "Started active chunk");
            state.active = Some(ActiveChunk {
                number,
                file,
                path,
                next_position: u64::from(number) * self.config.chunk_size,
                data_size: 0,
            });
            state.next_chunk_number = number + 1;
        }
        state
            .active
            .as_mut()
            .ok_or_else(|| LogError::invalid_operation("no active chunk"))
    }

    fn complete_active(&self, state: &mut LogState) -> Result<Option<ChunkInfo>, LogError> {
        let Some(active) = state.active.take() else {
            return Ok(None);
        };

        active.file.sync_all()?;
        drop(active.file);

        let path = completed_path(&self.config.base_dir, active.number, active.number);
        std::fs::rename(&active.path, &path)?;

        let info = ChunkInfo {
            chunk_start_number: active.number,
            chunk_end_number: active.number,
            start_position: u64::from(active.number) * self.config.chunk_size,
            end_position: (u64::from(active.number) + 1) * self.config.chunk_size,
            physical_data_size: active.data_size,
            is_read_only: true,
        };
        state.chunks.insert(active.number, ChunkFile { info, path });

        info!(chunk = active.number, bytes = active.data_size, "Completed chunk");
        Ok(Some(info))
    }

    /// Complete the active chunk so it becomes eligible for scavenging
    pub fn complete_chunk(&self) -> Result<Option<ChunkInfo>, LogError> {
        let mut state = self.state.write();
        self.complete_active(&mut state)
    }

    fn append_record(&self, state: &mut LogState, mut record: LogRecord) -> Result<LogPosition, LogError> {
        let chunk_size = self.config.chunk_size;

        for attempt in 0..2 {
            let active = self.ensure_active(state)?;
            let position = active.next_position;
            let chunk_end = (u64::from(active.number) + 1) * chunk_size;
            set_log_position(&mut record, position);

            let encoded = record.encode()?;
            if encoded.len() > self.config.max_record_size {
                return Err(LogError::invalid_operation(format!(
                    "record of {} bytes exceeds maximum of {}",
                    encoded.len(),
                    self.config.max_record_size
                )));
            }
            let size = LENGTH_PREFIX_SIZE + encoded.len() as u64;

            if position + size > chunk_end {
                if attempt == 0 {
                    self.complete_active(state)?;
                    continue;
                }
                return Err(LogError::invalid_operation(format!(
                    "record of {size} bytes does not fit in a chunk of {chunk_size}"
                )));
            }

            let mut framed = Vec::with_capacity(size as usize);
            framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            framed.extend_from_slice(&encoded);

            let offset = active.data_size;
            active.file.write_all(&framed)?;
            if self.config.sync_on_write {
                active.file.sync_data()?;
            }
            active.next_position += size;
            active.data_size += size;
            let chunk_start = active.number;

            self.apply_record(state, &record, chunk_start, offset);
            return Ok(position);
        }

        Err(LogError::invalid_operation("append did not find room in a chunk"))
    }

    fn append_prepare(
        &self,
        stream_id: &str,
        event_number: Option<u64>,
        event_type: &str,
        data: Bytes,
        timestamp: DateTime<Utc>,
    ) -> Result<AppendResult, LogError> {
        let mut state = self.state.write();

        let current = state.stream_versions.get(stream_id).copied();
        // A deleted stream takes its metastream with it
        let deleted = current == Some(TOMBSTONE_EVENT_NUMBER)
            || (is_metastream(stream_id)
                && state.stream_versions.get(original_stream_of(stream_id))
                    == Some(&TOMBSTONE_EVENT_NUMBER));
        if deleted {
            return Err(LogError::invalid_operation(format!(
                "stream {stream_id} is deleted"
            )));
        }
        let event_number =
            event_number.unwrap_or_else(|| current.map_or(0, |v| v.saturating_add(1)));

        let record = LogRecord::Prepare(PrepareRecord {
            log_position: 0,
            stream_id: stream_id.to_string(),
            event_number,
            event_type: event_type.to_string(),
            timestamp,
            data,
        });
        let log_position = self.append_record(&mut state, record)?;

        Ok(AppendResult {
            log_position,
            event_number,
        })
    }

    /// Append an event to a stream
    pub fn append_event(
        &self,
        stream_id: &str,
        event_type: &str,
        data: Bytes,
        timestamp: DateTime<Utc>,
    ) -> Result<AppendResult, LogError> {
        self.append_prepare(stream_id, None, event_type, data, timestamp)
    }

    /// Write metadata for a stream to its metastream
    pub fn set_stream_metadata(
        &self,
        stream_id: &str,
        metadata: &StreamMetadata,
        timestamp: DateTime<Utc>,
    ) -> Result<AppendResult, LogError> {
        let json = metadata
            .to_json()
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        self.append_prepare(
            &metastream_of(stream_id),
            None,
            event_types::METADATA,
            Bytes::from(json),
            timestamp,
        )
    }

    /// Hard delete a stream by writing its tombstone
    pub fn delete_stream(
        &self,
        stream_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<AppendResult, LogError> {
        self.append_prepare(
            stream_id,
            Some(TOMBSTONE_EVENT_NUMBER),
            event_types::STREAM_DELETED,
            Bytes::new(),
            timestamp,
        )
    }

    /// Append a commit marker
    pub fn append_commit(
        &self,
        transaction_position: LogPosition,
        first_event_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<LogPosition, LogError> {
        let mut state = self.state.write();
        self.append_record(
            &mut state,
            LogRecord::Commit(CommitRecord {
                log_position: 0,
                transaction_position,
                first_event_number,
                timestamp,
            }),
        )
    }

    /// Append an epoch record
    pub fn append_epoch(&self, epoch_number: u64, timestamp: DateTime<Utc>) -> Result<LogPosition, LogError> {
        let mut state = self.state.write();
        self.append_record(
            &mut state,
            LogRecord::System(SystemRecord {
                log_position: 0,
                epoch_number,
                timestamp,
            }),
        )
    }

    /// Last event number written to a stream
    pub fn stream_version(&self, stream_id: &str) -> Option<u64> {
        self.state.read().stream_versions.get(stream_id).copied()
    }

    /// Surviving events of a stream, resolved through the index
    pub fn read_stream(&self, stream_id: &str) -> Result<Vec<PrepareRecord>, LogError> {
        let state = self.state.read();
        let hash = self.hasher.hash(stream_id);
        let mut events = Vec::new();

        for (entry, _) in state.index.range_for_hash(hash, 0) {
            let Some(location) = state.locations.get(&entry.log_position) else {
                continue;
            };
            if location.stream_id.as_deref() != Some(stream_id) {
                continue;
            }
            let path = state.path_for(location.chunk_start)?;
            let bytes = chunk_file::read_at(path, location.offset, self.config.max_record_size)?;
            if let LogRecord::Prepare(prepare) = LogRecord::decode(&bytes)? {
                events.push(prepare);
            }
        }

        Ok(events)
    }

    /// Event numbers the index holds for a stream
    pub fn indexed_event_numbers(&self, stream_id: &str) -> Vec<u64> {
        let state = self.state.read();
        let hash = self.hasher.hash(stream_id);
        state
            .index
            .range_for_hash(hash, 0)
            .filter(|(entry, _)| {
                state
                    .locations
                    .get(&entry.log_position)
                    .and_then(|l| l.stream_id.as_deref())
                    .is_none_or(|s| s == stream_id)
            })
            .map(|(entry, _)| entry.event_number)
            .collect()
    }

    /// Every record physically present, in log order
    pub fn read_all(&self) -> Result<Vec<LogRecord>, LogError> {
        let until = {
            let state = self.state.read();
            state.locations.keys().next_back().map_or(0, |p| p + 1)
        };
        Ok(self
            .read_forward(0, until, usize::MAX)?
            .into_iter()
            .map(|r| r.record)
            .collect())
    }

    fn matching_entries<'s>(
        &self,
        state: &'s LogState,
        handle: &StreamHandle,
        from_event_number: u64,
        scavenge_point: LogPosition,
    ) -> Vec<(&'s IndexEntry, &'s DateTime<Utc>)> {
        let (hash, stream_id) = match handle {
            StreamHandle::None => return Vec::new(),
            StreamHandle::Hash(hash) => (*hash, None),
            StreamHandle::Id(id) => (self.hasher.hash(id), Some(id.as_str())),
        };

        state
            .index
            .range_for_hash(hash, from_event_number)
            .filter(|(entry, _)| entry.log_position < scavenge_point)
            .filter(|(entry, _)| match stream_id {
                None => true,
                Some(id) => state
                    .locations
                    .get(&entry.log_position)
                    .and_then(|l| l.stream_id.as_deref())
                    == Some(id),
            })
            .collect()
    }

    fn switch_in(
        &self,
        chunk_start: u32,
        chunk_end: u32,
        path: PathBuf,
        physical_data_size: u64,
        written: Vec<(LogPosition, u64, Option<Arc<str>>)>,
    ) -> Result<ChunkInfo, LogError> {
        let mut state = self.state.write();

        let replaced: Vec<u32> = state
            .chunks
            .range(chunk_start..=chunk_end)
            .map(|(start, _)| *start)
            .collect();
        for start in replaced {
            if let Some(old) = state.chunks.remove(&start)
                && old.path != path
                && let Err(e) = std::fs::remove_file(&old.path)
            {
                warn!(path = %old.path.display(), error = %e, "Failed to remove replaced chunk");
            }
        }

        let info = ChunkInfo {
            chunk_start_number: chunk_start,
            chunk_end_number: chunk_end,
            start_position: u64::from(chunk_start) * self.config.chunk_size,
            end_position: (u64::from(chunk_end) + 1) * self.config.chunk_size,
            physical_data_size,
            is_read_only: true,
        };
        state.chunks.insert(chunk_start, ChunkFile { info, path });

        let stale: Vec<LogPosition> = state
            .locations
            .range(info.start_position..info.end_position)
            .map(|(position, _)| *position)
            .collect();
        for position in stale {
            state.locations.remove(&position);
        }
        for (position, offset, stream_id) in written {
            state.locations.insert(
                position,
                RecordLocation {
                    chunk_start,
                    offset,
                    stream_id,
                },
            );
        }

        Ok(info)
    }
}

fn set_log_position(record: &mut LogRecord, position: LogPosition) {
    match record {
        LogRecord::Prepare(r) => r.log_position = position,
        LogRecord::Commit(r) => r.log_position = position,
        LogRecord::System(r) => r.log_position = position,
    }
}

impl ChunkReader for FileLog {
    fn chunk_size(&self) -> u64 {
        self.config.chunk_size
    }

    fn chunks(&self) -> Result<Vec<ChunkInfo>, LogError> {
        let state = self.state.read();
        let mut chunks: Vec<ChunkInfo> = state.chunks.values().map(|c| c.info).collect();
        if let Some(active) = &state.active {
            chunks.push(ChunkInfo {
                chunk_start_number: active.number,
                chunk_end_number: active.number,
                start_position: u64::from(active.number) * self.config.chunk_size,
                end_position: (u64::from(active.number) + 1) * self.config.chunk_size,
                physical_data_size: active.data_size,
                is_read_only: false,
            });
        }
        Ok(chunks)
    }

    fn read_forward(
        &self,
        from: LogPosition,
        until: LogPosition,
        max_count: usize,
    ) -> Result<Vec<RecordForScavenge>, LogError> {
        let state = self.state.read();
        let mut records = Vec::new();
        let mut open: Option<(u32, File)> = None;
        let mut buffer = Vec::new();

        for (_, location) in state.locations.range(from..until).take(max_count) {
            let mut file = match open.take() {
                Some((chunk, file)) if chunk == location.chunk_start => file,
                _ => File::open(state.path_for(location.chunk_start)?)?,
            };
            file.seek(SeekFrom::Start(location.offset))?;
            if !chunk_file::read_framed(
                &mut file,
                &mut buffer,
                location.offset,
                self.config.max_record_size,
            )? {
                return Err(LogError::corruption(
                    location.offset,
                    "indexed record missing from chunk",
                ));
            }
            open = Some((location.chunk_start, file));
            let record = LogRecord::decode(&buffer)
                .map_err(|e| LogError::corruption(location.offset, e.to_string()))?;
            records.push(RecordForScavenge {
                record,
                size: buffer.len(),
            });
        }

        Ok(records)
    }

    fn open_chunk<'a>(
        &'a self,
        chunk: &ChunkInfo,
    ) -> Result<Box<dyn ChunkRecordReader + 'a>, LogError> {
        let path = {
            let state = self.state.read();
            state.path_for(chunk.chunk_start_number)?.clone()
        };
        Ok(Box::new(FileChunkRecordReader::open(
            &path,
            self.config.max_record_size,
        )?))
    }

    fn stream_id_at(&self, position: LogPosition) -> Result<Option<String>, LogError> {
        let state = self.state.read();
        Ok(state
            .locations
            .get(&position)
            .and_then(|l| l.stream_id.as_deref())
            .map(str::to_string))
    }
}

/// Replacement chunk staged in a temporary file
struct FileChunkWriter<'a> {
    log: &'a FileLog,
    chunk_start: u32,
    chunk_end: u32,
    start_position: LogPosition,
    end_position: LogPosition,
    temp_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    written: Vec<(LogPosition, u64, Option<Arc<str>>)>,
}

impl ChunkWriter for FileChunkWriter<'_> {
    fn write_record(&mut self, record: &RecordForExecutor) -> Result<(), LogError> {
        let position = record.log_position();
        if position < self.start_position || position >= self.end_position {
            return Err(LogError::invalid_operation(format!(
                "record at {position} does not belong to chunks {}..={}",
                self.chunk_start, self.chunk_end
            )));
        }

        let bytes = record.raw_bytes();
        self.file.write_all(&(bytes.len() as u32).to_be_bytes())?;
        self.file.write_all(bytes)?;

        let stream_id = match record.view() {
            RecordView::Prepare { stream_id, .. } => Some(Arc::from(stream_id)),
            RecordView::NonPrepare => None,
        };
        self.written.push((position, self.offset, stream_id));
        self.offset += LENGTH_PREFIX_SIZE + bytes.len() as u64;
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<ChunkInfo, LogError> {
        let this = *self;
        let file = this
            .file
            .into_inner()
            .map_err(|e| LogError::Io(e.error().to_string()))?;
        file.sync_all()?;
        drop(file);

        let path = completed_path(&this.log.config.base_dir, this.chunk_start, this.chunk_end);
        std::fs::rename(&this.temp_path, &path)?;

        let info = this.log.switch_in(
            this.chunk_start,
            this.chunk_end,
            path,
            this.offset,
            this.written,
        )?;
        debug!(
            chunk_start = info.chunk_start_number,
            chunk_end = info.chunk_end_number,
            bytes = info.physical_data_size,
            "Switched in chunk"
        );
        Ok(info)
    }

    fn abort(self: Box<Self>) {
        let this = *self;
        drop(this.file);
        if let Err(e) = std::fs::remove_file(&this.temp_path) {
            warn!(path = %this.temp_path.display(), error = %e, "Failed to remove aborted chunk");
        }
    }
}

impl ChunkManager for FileLog {
    fn create_chunk_writer<'a>(
        &'a self,
        chunk_start_number: u32,
        chunk_end_number: u32,
    ) -> Result<Box<dyn ChunkWriter + 'a>, LogError> {
        {
            let state = self.state.read();
            if let Some(active) = &state.active
                && active.number <= chunk_end_number
                && active.number >= chunk_start_number
            {
                return Err(LogError::invalid_operation(format!(
                    "chunk {} is still being written",
                    active.number
                )));
            }

            let covered: Vec<&ChunkInfo> = state
                .chunks
                .range(chunk_start_number..=chunk_end_number)
                .map(|(_, c)| &c.info)
                .collect();
            let aligned = covered.first().map(|c| c.chunk_start_number) == Some(chunk_start_number)
                && covered.last().map(|c| c.chunk_end_number) == Some(chunk_end_number);
            if !aligned {
                return Err(LogError::invalid_operation(format!(
                    "chunks {chunk_start_number}..={chunk_end_number} do not match existing chunk boundaries"
                )));
            }
        }

        let temp_path = temp_path(&self.config.base_dir, chunk_start_number, chunk_end_number);
        let file = File::create(&temp_path)?;

        Ok(Box::new(FileChunkWriter {
            log: self,
            chunk_start: chunk_start_number,
            chunk_end: chunk_end_number,
            start_position: u64::from(chunk_start_number) * self.config.chunk_size,
            end_position: (u64::from(chunk_end_number) + 1) * self.config.chunk_size,
            temp_path,
            file: BufWriter::new(file),
            offset: 0,
            written: Vec::new(),
        }))
    }
}

impl IndexReader for FileLog {
    fn last_event_number(
        &self,
        handle: &StreamHandle,
        scavenge_point: LogPosition,
    ) -> Result<Option<u64>, LogError> {
        let state = self.state.read();
        Ok(self
            .matching_entries(&state, handle, 0, scavenge_point)
            .iter()
            .map(|(entry, _)| entry.event_number)
            .max())
    }

    fn read_event_infos_forward(
        &self,
        handle: &StreamHandle,
        from_event_number: u64,
        max_count: usize,
        scavenge_point: LogPosition,
    ) -> Result<Vec<EventInfo>, LogError> {
        let state = self.state.read();
        Ok(self
            .matching_entries(&state, handle, from_event_number, scavenge_point)
            .into_iter()
            .take(max_count)
            .map(|(entry, timestamp)| EventInfo {
                event_number: entry.event_number,
                log_position: entry.log_position,
                timestamp: self.config.index_timestamps.then_some(*timestamp),
            })
            .collect())
    }
}

impl IndexScavenger for FileLog {
    fn index_entries(
        &self,
        after: Option<&IndexEntry>,
        max_count: usize,
    ) -> Result<Vec<IndexEntry>, LogError> {
        let state = self.state.read();
        Ok(state
            .index
            .entries_after(after)
            .take(max_count)
            .map(|(entry, _)| *entry)
            .collect())
    }

    fn remove_index_entries(&self, entries: &[IndexEntry]) -> Result<usize, LogError> {
        let mut state = self.state.write();
        Ok(entries.iter().filter(|e| state.index.remove(e)).count())
    }
}

impl ScavengePointSource for FileLog {
    fn latest_scavenge_point(&self) -> Result<Option<ScavengePoint>, LogError> {
        Ok(self.state.read().latest_scavenge_point)
    }

    fn add_scavenge_point(
        &self,
        effective_now: DateTime<Utc>,
        threshold: f32,
    ) -> Result<ScavengePoint, LogError> {
        let payload = ScavengePointPayload {
            effective_now,
            threshold,
        };
        let data = payload
            .to_json()
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        let appended = self.append_event(
            SCAVENGE_POINTS_STREAM,
            event_types::SCAVENGE_POINT,
            Bytes::from(data),
            effective_now,
        )?;

        info!(
            position = appended.log_position,
            event_number = appended.event_number,
            "Added scavenge point"
        );

        Ok(ScavengePoint {
            position: appended.log_position,
            event_number: appended.event_number,
            effective_now,
            threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tidelog_core::Blake3StreamHasher;

    fn open_log(dir: &TempDir, chunk_size: u64) -> FileLog {
        let config = FileLogConfig::with_base_dir(dir.path())
            .with_chunk_size(chunk_size)
            .with_index_timestamps(true);
        FileLog::open(config, Arc::new(Blake3StreamHasher)).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_append_assigns_event_numbers() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);

        for i in 0..3 {
            let result = log
                .append_event("orders", "OrderPlaced", Bytes::from("{}"), ts(i))
                .unwrap();
            assert_eq!(result.event_number, i as u64);
        }
        assert_eq!(log.stream_version("orders"), Some(2));
        assert_eq!(log.read_stream("orders").unwrap().len(), 3);
    }

    #[test]
    fn test_chunks_roll_over() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 256);

        for i in 0..20 {
            log.append_event("orders", "OrderPlaced", Bytes::from("payload"), ts(i))
                .unwrap();
        }

        let chunks = log.chunks().unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks[..chunks.len() - 1].iter().all(|c| c.is_read_only));
        assert!(!chunks.last().unwrap().is_read_only);
        for chunk in &chunks {
            assert!(chunk.physical_data_size <= 256);
        }
    }

    #[test]
    fn test_deleted_stream_rejects_appends() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);

        log.append_event("orders", "OrderPlaced", Bytes::new(), ts(0))
            .unwrap();
        let tombstone = log.delete_stream("orders", ts(1)).unwrap();
        assert_eq!(tombstone.event_number, TOMBSTONE_EVENT_NUMBER);
        assert!(log
            .append_event("orders", "OrderPlaced", Bytes::new(), ts(2))
            .is_err());
    }

    #[test]
    fn test_deleted_stream_rejects_metadata() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);

        log.set_stream_metadata("orders", &StreamMetadata::EMPTY.with_max_count(3), ts(0))
            .unwrap();
        log.delete_stream("orders", ts(1)).unwrap();

        let err = log
            .set_stream_metadata("orders", &StreamMetadata::EMPTY.with_max_count(5), ts(2))
            .unwrap_err();
        assert!(matches!(err, LogError::InvalidOperation(_)));
        assert!(log
            .append_event("$$orders", event_types::METADATA, Bytes::from("{}"), ts(2))
            .is_err());
        assert_eq!(log.stream_version("$$orders"), Some(0));

        // Reopening keeps the stream deleted
        drop(log);
        let log = open_log(&temp, 4096);
        assert!(log
            .set_stream_metadata("orders", &StreamMetadata::EMPTY, ts(3))
            .is_err());
    }

    #[test]
    fn test_replay_restores_state() {
        let temp = TempDir::new().unwrap();
        {
            let log = open_log(&temp, 256);
            for i in 0..10 {
                log.append_event("orders", "OrderPlaced", Bytes::from("payload"), ts(i))
                    .unwrap();
            }
            log.add_scavenge_point(ts(100), 0.0).unwrap();
        }

        let log = open_log(&temp, 256);
        assert_eq!(log.stream_version("orders"), Some(9));
        assert_eq!(log.indexed_event_numbers("orders").len(), 10);
        let sp = log.latest_scavenge_point().unwrap().unwrap();
        assert_eq!(sp.effective_now, ts(100));

        let next = log
            .append_event("orders", "OrderPlaced", Bytes::new(), ts(11))
            .unwrap();
        assert_eq!(next.event_number, 10);
        assert!(next.log_position > sp.position);
    }

    #[test]
    fn test_index_reader_respects_scavenge_point() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);
        let hasher = Blake3StreamHasher;

        for i in 0..5 {
            log.append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
                .unwrap();
        }
        let sp = log.add_scavenge_point(ts(10), 0.0).unwrap();
        log.append_event("orders", "OrderPlaced", Bytes::new(), ts(11))
            .unwrap();

        let handle = StreamHandle::Hash(hasher.hash("orders"));
        assert_eq!(log.last_event_number(&handle, sp.position).unwrap(), Some(4));

        let infos = log
            .read_event_infos_forward(&handle, 2, 10, sp.position)
            .unwrap();
        let numbers: Vec<u64> = infos.iter().map(|i| i.event_number).collect();
        assert_eq!(numbers, vec![2, 3, 4]);
        assert_eq!(infos[0].timestamp, Some(ts(2)));
    }

    #[test]
    fn test_rewrite_chunk_switches_in() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);

        for i in 0..4 {
            log.append_event("orders", "OrderPlaced", Bytes::new(), ts(i))
                .unwrap();
        }
        let chunk = log.complete_chunk().unwrap().unwrap();

        let mut writer = log.create_chunk_writer(0, 0).unwrap();
        let mut reader = log.open_chunk(&chunk).unwrap();
        let mut record = RecordForExecutor::new();
        while reader.read_next(&mut record).unwrap() {
            if let RecordView::Prepare { event_number, .. } = record.view()
                && event_number >= 2
            {
                writer.write_record(&record).unwrap();
            }
        }
        let info = writer.complete().unwrap();
        assert!(info.physical_data_size < chunk.physical_data_size);

        let survivors: Vec<u64> = log
            .read_stream("orders")
            .unwrap()
            .iter()
            .map(|e| e.event_number)
            .collect();
        assert_eq!(survivors, vec![2, 3]);

        // Index still has the discarded entries until the index is scavenged
        assert_eq!(log.indexed_event_numbers("orders").len(), 4);
    }

    #[test]
    fn test_writer_rejects_active_chunk() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);
        log.append_event("orders", "OrderPlaced", Bytes::new(), ts(0))
            .unwrap();
        assert!(log.create_chunk_writer(0, 0).is_err());
    }

    #[test]
    fn test_aborted_writer_leaves_chunk_untouched() {
        let temp = TempDir::new().unwrap();
        let log = open_log(&temp, 4096);
        log.append_event("orders", "OrderPlaced", Bytes::new(), ts(0))
            .unwrap();
        let before = log.complete_chunk().unwrap().unwrap();

        let writer = log.create_chunk_writer(0, 0).unwrap();
        writer.abort();

        assert_eq!(log.chunks().unwrap()[0], before);
        assert_eq!(log.read_stream("orders").unwrap().len(), 1);
    }
}
