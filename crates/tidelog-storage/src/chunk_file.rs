//! Chunk files
//!
//! Each chunk file holds length-prefixed, postcard-serialized records:
//! ```text
//! [4 bytes: len][len bytes: serialized record][4 bytes: len][...]
//! ```
//!
//! File names encode the logical chunk range covered:
//! `chunk-000003-000005.dat` for a completed (read-only) chunk,
//! `chunk-000006-000006.active` for the chunk currently being appended to,
//! and `*.tmp` for replacement chunks that were never switched in.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::warn;

use tidelog_core::{ChunkRecordReader, LogError, RecordForExecutor};

/// Size of the length prefix in front of every record
pub const LENGTH_PREFIX_SIZE: u64 = 4;

const COMPLETED_EXTENSION: &str = "dat";
const ACTIVE_EXTENSION: &str = "active";
const TEMP_EXTENSION: &str = "tmp";

/// A chunk file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredChunk {
    pub chunk_start_number: u32,
    pub chunk_end_number: u32,
    pub path: PathBuf,
    pub is_active: bool,
}

/// Path of a completed chunk file
pub fn completed_path(dir: &Path, start: u32, end: u32) -> PathBuf {
    dir.join(format!("chunk-{start:06}-{end:06}.{COMPLETED_EXTENSION}"))
}

/// Path of the active chunk file
pub fn active_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("chunk-{number:06}-{number:06}.{ACTIVE_EXTENSION}"))
}

/// Path a replacement chunk is staged at before switch-in
pub fn temp_path(dir: &Path, start: u32, end: u32) -> PathBuf {
    dir.join(format!(
        "chunk-{start:06}-{end:06}.{COMPLETED_EXTENSION}.{TEMP_EXTENSION}"
    ))
}

fn parse_name(name: &str) -> Option<(u32, u32, &str)> {
    let rest = name.strip_prefix("chunk-")?;
    let (range, extension) = rest.split_once('.')?;
    let (start, end) = range.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?, extension))
}

/// List chunk files, deleting abandoned replacement chunks and chunks that a
/// later merge superseded
pub fn discover_chunks(dir: &Path) -> Result<Vec<DiscoveredChunk>, LogError> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((start, end, extension)) = parse_name(name) else {
            continue;
        };

        if extension.ends_with(TEMP_EXTENSION) {
            warn!(path = %path.display(), "Removing abandoned replacement chunk");
            std::fs::remove_file(&path)?;
            continue;
        }

        let is_active = match extension {
            COMPLETED_EXTENSION => false,
            ACTIVE_EXTENSION => true,
            _ => continue,
        };

        if start > end {
            return Err(LogError::corruption(
                0,
                format!("chunk file {name} has an inverted range"),
            ));
        }

        found.push(DiscoveredChunk {
            chunk_start_number: start,
            chunk_end_number: end,
            path,
            is_active,
        });
    }

    // Widest range first for a given start, so merged files win over the
    // files they replaced.
    found.sort_by(|a, b| {
        a.chunk_start_number
            .cmp(&b.chunk_start_number)
            .then(b.chunk_end_number.cmp(&a.chunk_end_number))
    });

    let mut kept: Vec<DiscoveredChunk> = Vec::with_capacity(found.len());
    for chunk in found {
        if let Some(last) = kept.last()
            && chunk.chunk_start_number <= last.chunk_end_number
        {
            warn!(
                path = %chunk.path.display(),
                covered_by = last.chunk_end_number,
                "Removing chunk superseded by a merged chunk"
            );
            std::fs::remove_file(&chunk.path)?;
            continue;
        }
        kept.push(chunk);
    }

    if let Some(position) = kept.iter().position(|c| c.is_active)
        && position + 1 != kept.len()
    {
        return Err(LogError::corruption(
            0,
            "active chunk is not the last chunk".to_string(),
        ));
    }

    Ok(kept)
}

/// Read one length-prefixed record into `buffer`
///
/// Returns `Ok(false)` on a clean end of file.
pub fn read_framed<R: Read>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    offset: u64,
    max_record_size: usize,
) -> Result<bool, LogError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE as usize];
    let mut filled = 0;
    while filled < len_buf.len() {
        let read = reader.read(&mut len_buf[filled..])?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(LogError::corruption(offset, "truncated length prefix"));
        }
        filled += read;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > max_record_size {
        return Err(LogError::corruption(
            offset,
            format!("record length {len} outside 1..={max_record_size}"),
        ));
    }

    buffer.clear();
    buffer.resize(len, 0);
    reader
        .read_exact(buffer)
        .map_err(|_| LogError::corruption(offset, "truncated record body"))?;
    Ok(true)
}

/// Read the record stored at `offset` of `path`
pub fn read_at(path: &Path, offset: u64, max_record_size: usize) -> Result<Vec<u8>, LogError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::new();
    if !read_framed(&mut file, &mut buffer, offset, max_record_size)? {
        return Err(LogError::corruption(offset, "record missing at end of chunk"));
    }
    Ok(buffer)
}

/// Sequential reader over a chunk file
pub struct FileChunkRecordReader {
    reader: BufReader<File>,
    offset: u64,
    length: u64,
    max_record_size: usize,
}

impl FileChunkRecordReader {
    /// Open a chunk file for sequential reading
    pub fn open(path: &Path, max_record_size: usize) -> Result<Self, LogError> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            offset: 0,
            length,
            max_record_size,
        })
    }
}

impl ChunkRecordReader for FileChunkRecordReader {
    fn read_next(&mut self, record: &mut RecordForExecutor) -> Result<bool, LogError> {
        if self.offset >= self.length {
            return Ok(false);
        }

        let offset = self.offset;
        if !read_framed(
            &mut self.reader,
            record.raw_buffer_mut(),
            offset,
            self.max_record_size,
        )? {
            return Ok(false);
        }

        record
            .decode_raw()
            .map_err(|e| LogError::corruption(offset, e.to_string()))?;
        self.offset += LENGTH_PREFIX_SIZE + record.raw_bytes().len() as u64;
        Ok(true)
    }
}
