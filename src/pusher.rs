//! Hand-off of merged segments to deep storage.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::chunk::{ChunkDescriptor, DATA_FILE_NAME, DICTIONARY_FILE_NAME, META_FILE_NAME, sync_dir};
use crate::identity::PartitionIdentity;
use crate::{Result, SinkbufError};

/// Written next to a merged chunk once it has been pushed.
pub const DESCRIPTOR_FILE_NAME: &str = "descriptor.json";

/// A finished segment and where it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSegment {
    pub identity: PartitionIdentity,
    pub load_path: PathBuf,
    pub size_bytes: u64,
    pub num_rows: usize,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
}

impl DataSegment {
    /// Describes a merged chunk that has not been pushed yet.
    pub fn from_chunk(identity: PartitionIdentity, chunk: &ChunkDescriptor) -> Self {
        Self {
            identity,
            load_path: chunk.dir.clone(),
            size_bytes: chunk.size_bytes,
            num_rows: chunk.num_rows,
            dimensions: chunk.dimensions.clone(),
            metrics: chunk.metrics.clone(),
        }
    }
}

/// Deep storage.
pub trait SegmentPusher: Send + Sync {
    /// Uploads the chunk in `merged_dir` and returns the segment with its
    /// final location. With `use_unique_path` every push lands in a fresh
    /// location.
    fn push(&self, merged_dir: &Path, segment: DataSegment, use_unique_path: bool) -> Result<DataSegment>;
}

/// Deep storage on a local (or mounted) filesystem:
/// `<root>/<data source>/<start>_<end>/<version>/<shard>[/<uuid>]`.
#[derive(Debug, Clone)]
pub struct LocalSegmentPusher {
    root: PathBuf,
}

impl LocalSegmentPusher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn storage_dir(&self, identity: &PartitionIdentity, use_unique_path: bool) -> PathBuf {
        let interval = identity.interval().to_string().replace('/', "_");
        let mut dir = self
            .root
            .join(identity.data_source())
            .join(interval)
            .join(identity.version())
            .join(identity.shard().to_string());
        if use_unique_path {
            dir = dir.join(Uuid::new_v4().to_string());
        }
        dir
    }
}

impl SegmentPusher for LocalSegmentPusher {
    fn push(&self, merged_dir: &Path, segment: DataSegment, use_unique_path: bool) -> Result<DataSegment> {
        let target = self.storage_dir(&segment.identity, use_unique_path);
        fs::create_dir_all(&target).map_err(|e| SinkbufError::io_at(&target, e))?;

        let mut size_bytes = 0;
        for name in [DATA_FILE_NAME, DICTIONARY_FILE_NAME, META_FILE_NAME] {
            let from = merged_dir.join(name);
            let to = target.join(name);
            size_bytes += fs::copy(&from, &to).map_err(|e| SinkbufError::Push {
                identity: segment.identity.to_string(),
                details: format!("copying {:?} to {:?}: {}", from, to, e),
            })?;
            File::open(&to)
                .and_then(|f| f.sync_all())
                .map_err(|e| SinkbufError::io_at(&to, e))?;
        }
        sync_dir(&target)?;

        info!("Pushed {} to {:?}", segment.identity, target);
        Ok(DataSegment {
            load_path: target,
            size_bytes,
            ..segment
        })
    }
}

/// The segment recorded by an earlier push of `merged_dir`, if any.
pub fn read_descriptor(merged_dir: &Path) -> Result<Option<DataSegment>> {
    let path = merged_dir.join(DESCRIPTOR_FILE_NAME);
    match File::open(&path) {
        Ok(file) => Ok(Some(serde_json::from_reader(BufReader::new(file))?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SinkbufError::io_at(&path, e)),
    }
}

pub fn write_descriptor(merged_dir: &Path, segment: &DataSegment) -> Result<()> {
    let path = merged_dir.join(DESCRIPTOR_FILE_NAME);
    let file = File::create(&path).map_err(|e| SinkbufError::io_at(&path, e))?;
    let mut writer = BufWriter::new(&file);
    serde_json::to_writer_pretty(&mut writer, segment)?;
    writer.flush().map_err(|e| SinkbufError::io_at(&path, e))?;
    drop(writer);
    file.sync_all().map_err(|e| SinkbufError::io_at(&path, e))?;
    Ok(())
}
