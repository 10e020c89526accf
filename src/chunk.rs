//! Immutable on-disk chunks.
//!
//! A chunk directory holds three files:
//!
//! * `data` - fixed-width little-endian columns: the time column (`i64`),
//!   one code column per dimension (`u32`, `u32::MAX` for null) and one
//!   column per metric (8 bytes, `i64` or `f64` bits).
//! * `dictionaries.bin` - bincode-encoded dictionary of every dimension.
//! * `meta.json` - column offsets and row count. Written last; a directory
//!   without it is an incomplete chunk.
//!
//! The encoding is deterministic, so converting the same index twice
//! yields byte-identical files.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::index::{NULL_CODE, PartitionIndex};
use crate::mmap::PlatformMmap;
use crate::query::ScanRow;
use crate::schema::{DimensionKind, MetricKind, MetricValue};
use crate::{Result, SinkbufError};

pub const DATA_FILE_NAME: &str = "data";
pub const DICTIONARY_FILE_NAME: &str = "dictionaries.bin";
pub const META_FILE_NAME: &str = "meta.json";
pub const FORMAT_VERSION: u32 = 1;

const TIME_WIDTH: usize = 8;
const CODE_WIDTH: usize = 4;
const METRIC_WIDTH: usize = 8;

/// Column layout of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub format_version: u32,
    pub num_rows: usize,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
    pub data_size: u64,
    pub time_offset: u64,
    pub dimensions: Vec<DimensionColumnMeta>,
    pub metrics: Vec<MetricColumnMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionColumnMeta {
    pub name: String,
    pub kind: DimensionKind,
    pub offset: u64,
    pub cardinality: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricColumnMeta {
    pub name: String,
    pub kind: MetricKind,
    pub offset: u64,
}

/// Summary of a written chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub dir: PathBuf,
    pub num_rows: usize,
    pub size_bytes: u64,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
}

impl ChunkDescriptor {
    fn from_meta(dir: &Path, meta: &ChunkMeta, size_bytes: u64) -> Self {
        Self {
            dir: dir.to_path_buf(),
            num_rows: meta.num_rows,
            size_bytes,
            dimensions: meta.dimensions.iter().map(|d| d.name.clone()).collect(),
            metrics: meta.metrics.iter().map(|m| m.name.clone()).collect(),
            min_timestamp: meta.min_timestamp,
            max_timestamp: meta.max_timestamp,
        }
    }
}

/// Converts the rows currently published by `index` into a chunk at `dir`.
pub fn write_chunk(index: &PartitionIndex, dir: &Path) -> Result<ChunkDescriptor> {
    let snapshot = index.snapshot();
    let rows = snapshot.rows();
    let num_rows = snapshot.row_count();
    let aggregators = snapshot.schema().aggregators();

    let data_size = num_rows
        * (TIME_WIDTH + snapshot.dimensions().len() * CODE_WIDTH + aggregators.len() * METRIC_WIDTH);
    let mut data = BytesMut::with_capacity(data_size);

    let time_offset = data.len() as u64;
    for row in rows {
        data.put_i64_le(row.timestamp);
    }

    let mut dimensions = Vec::with_capacity(snapshot.dimensions().len());
    for (position, column) in snapshot.dimensions().iter().enumerate() {
        let offset = data.len() as u64;
        for row in rows {
            data.put_u32_le(row.code(position));
        }
        dimensions.push(DimensionColumnMeta {
            name: column.name.clone(),
            kind: column.kind,
            offset,
            cardinality: column.dictionary.values().len(),
        });
    }

    let mut metrics = Vec::with_capacity(aggregators.len());
    for (position, agg) in aggregators.iter().enumerate() {
        let offset = data.len() as u64;
        for row in rows {
            let value = row.metrics.get(position).copied().unwrap_or_else(|| agg.initial());
            data.put_u64_le(value.to_bits());
        }
        metrics.push(MetricColumnMeta {
            name: agg.name().to_string(),
            kind: agg.kind(),
            offset,
        });
    }

    let dictionaries: Vec<Vec<String>> = snapshot
        .dimensions()
        .iter()
        .map(|column| column.dictionary.values().to_vec())
        .collect();

    let meta = ChunkMeta {
        format_version: FORMAT_VERSION,
        num_rows,
        min_timestamp: snapshot.min_timestamp(),
        max_timestamp: snapshot.max_timestamp(),
        data_size: data.len() as u64,
        time_offset,
        dimensions,
        metrics,
    };
    drop(snapshot);

    fs::create_dir_all(dir).map_err(|e| SinkbufError::io_at(dir, e))?;

    let data_path = dir.join(DATA_FILE_NAME);
    write_synced(&data_path, |writer| {
        writer.write_all(&data)?;
        Ok(())
    })?;

    let dictionary_path = dir.join(DICTIONARY_FILE_NAME);
    write_synced(&dictionary_path, |writer| {
        bincode::serialize_into(writer, &dictionaries)?;
        Ok(())
    })?;

    // Metadata goes last: its presence marks the chunk as complete.
    let meta_path = dir.join(META_FILE_NAME);
    write_synced(&meta_path, |writer| {
        serde_json::to_writer_pretty(writer, &meta)?;
        Ok(())
    })?;
    sync_dir(dir)?;

    let size_bytes = chunk_size_on_disk(dir)?;
    debug!(
        "Wrote chunk {:?} with {} rows ({} bytes)",
        dir, meta.num_rows, size_bytes
    );
    Ok(ChunkDescriptor::from_meta(dir, &meta, size_bytes))
}

fn write_synced<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
{
    let file = File::create(path).map_err(|e| SinkbufError::io_at(path, e))?;
    {
        let mut writer = BufWriter::new(&file);
        write(&mut writer)?;
        writer.flush().map_err(|e| SinkbufError::io_at(path, e))?;
    }
    file.sync_all().map_err(|e| SinkbufError::io_at(path, e))?;
    Ok(())
}

/// Flushes directory entries so renames and new files survive a crash.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| SinkbufError::io_at(dir, e))?;
        handle.sync_all().map_err(|e| SinkbufError::io_at(dir, e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Total size of the chunk files in `dir`.
pub fn chunk_size_on_disk(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for name in [DATA_FILE_NAME, DICTIONARY_FILE_NAME, META_FILE_NAME] {
        let path = dir.join(name);
        total += fs::metadata(&path)
            .map_err(|e| SinkbufError::io_at(&path, e))?
            .len();
    }
    Ok(total)
}

/// Returns true when `dir` holds a complete chunk.
pub fn is_complete(dir: &Path) -> bool {
    dir.join(META_FILE_NAME).is_file()
}

/// Memory-mapped read view of a chunk.
pub struct PersistedChunk {
    dir: PathBuf,
    meta: ChunkMeta,
    dictionaries: Vec<Vec<String>>,
    data: PlatformMmap,
    size_bytes: u64,
}

impl PersistedChunk {
    /// Opens the chunk at `dir`, validating its layout against the data file.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let meta_path = dir.join(META_FILE_NAME);
        if !meta_path.exists() {
            return Err(SinkbufError::DataCorruption(format!(
                "chunk {:?} has no {}",
                dir, META_FILE_NAME
            )));
        }
        let meta_file = File::open(&meta_path).map_err(|e| SinkbufError::io_at(&meta_path, e))?;
        let meta: ChunkMeta = serde_json::from_reader(BufReader::new(meta_file))?;
        if meta.format_version != FORMAT_VERSION {
            return Err(SinkbufError::DataCorruption(format!(
                "chunk {:?} has unsupported format version {}",
                dir, meta.format_version
            )));
        }

        let dictionary_path = dir.join(DICTIONARY_FILE_NAME);
        let dictionary_file =
            File::open(&dictionary_path).map_err(|e| SinkbufError::io_at(&dictionary_path, e))?;
        let dictionaries: Vec<Vec<String>> =
            bincode::deserialize_from(BufReader::new(dictionary_file))?;
        if dictionaries.len() != meta.dimensions.len() {
            return Err(SinkbufError::DataCorruption(format!(
                "chunk {:?} has {} dictionaries for {} dimensions",
                dir,
                dictionaries.len(),
                meta.dimensions.len()
            )));
        }

        let data = PlatformMmap::open_readonly(dir.join(DATA_FILE_NAME))?;
        validate_layout(dir, &meta, data.len())?;
        if let Err(e) = data.advise_random() {
            warn!("madvise failed for {:?}: {}", dir, e);
        }

        let size_bytes = chunk_size_on_disk(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            dictionaries,
            data,
            size_bytes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &ChunkMeta {
        &self.meta
    }

    pub fn num_rows(&self) -> usize {
        self.meta.num_rows
    }

    pub fn dimension_count(&self) -> usize {
        self.meta.dimensions.len()
    }

    pub fn metric_count(&self) -> usize {
        self.meta.metrics.len()
    }

    pub fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor::from_meta(&self.dir, &self.meta, self.size_bytes)
    }

    fn slice(&self, offset: u64, width: usize) -> Result<&[u8]> {
        let start = offset as usize;
        self.data
            .as_slice()
            .get(start..start + width)
            .ok_or(SinkbufError::InvalidOffset {
                offset,
                max: self.data.len() as u64,
            })
    }

    pub fn timestamp_at(&self, position: usize) -> Result<i64> {
        let offset = self.meta.time_offset + (position * TIME_WIDTH) as u64;
        Ok(self.slice(offset, TIME_WIDTH)?.get_i64_le())
    }

    /// Decodes the row at `position`.
    pub fn read_row(&self, position: usize) -> Result<ScanRow> {
        if position >= self.meta.num_rows {
            return Err(SinkbufError::InvalidOffset {
                offset: position as u64,
                max: self.meta.num_rows as u64,
            });
        }

        let timestamp = self.timestamp_at(position)?;

        let mut dimensions = Vec::with_capacity(self.meta.dimensions.len());
        for (column, dictionary) in self.meta.dimensions.iter().zip(&self.dictionaries) {
            let offset = column.offset + (position * CODE_WIDTH) as u64;
            let code = self.slice(offset, CODE_WIDTH)?.get_u32_le();
            let value = if code == NULL_CODE {
                None
            } else {
                let value = dictionary.get(code as usize).ok_or_else(|| {
                    SinkbufError::DataCorruption(format!(
                        "code {} out of range for dimension '{}' in {:?}",
                        code, column.name, self.dir
                    ))
                })?;
                Some(value.clone())
            };
            dimensions.push((column.name.clone(), value));
        }

        let mut metrics = Vec::with_capacity(self.meta.metrics.len());
        for column in &self.meta.metrics {
            let offset = column.offset + (position * METRIC_WIDTH) as u64;
            let bits = self.slice(offset, METRIC_WIDTH)?.get_u64_le();
            metrics.push((column.name.clone(), MetricValue::from_bits(column.kind, bits)));
        }

        Ok(ScanRow {
            timestamp,
            dimensions,
            metrics,
        })
    }
}

fn validate_layout(dir: &Path, meta: &ChunkMeta, data_len: usize) -> Result<()> {
    if meta.data_size != data_len as u64 {
        return Err(SinkbufError::DataCorruption(format!(
            "chunk {:?} data file is {} bytes, expected {}",
            dir, data_len, meta.data_size
        )));
    }

    let rows = meta.num_rows as u64;
    let columns = std::iter::once((meta.time_offset, TIME_WIDTH))
        .chain(meta.dimensions.iter().map(|d| (d.offset, CODE_WIDTH)))
        .chain(meta.metrics.iter().map(|m| (m.offset, METRIC_WIDTH)));
    for (offset, width) in columns {
        let end = offset.saturating_add(rows.saturating_mul(width as u64));
        if end > meta.data_size {
            return Err(SinkbufError::InvalidOffset {
                offset: end,
                max: meta.data_size,
            });
        }
    }
    Ok(())
}
