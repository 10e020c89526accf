//! Commit record and on-disk recovery.
//!
//! The commit record lists, for every sink directory, how many of its
//! fire-segments are durable, together with the caller's metadata from the
//! persist that wrote it. It is replaced atomically (temp file, fsync,
//! rename, directory fsync) and only after every chunk it references is
//! durable, so after a crash the record and the chunks always agree.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::chunk::{is_complete, sync_dir};
use crate::identity::PartitionIdentity;
use crate::sink::read_identity;
use crate::{Result, SinkbufError};

pub const COMMIT_FILE_NAME: &str = "commit.json";
const COMMIT_TEMP_FILE_NAME: &str = "commit.json.tmp";

/// Contents of the commit record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Committed {
    /// Durable fire-segment count per sink directory name.
    hydrants: BTreeMap<String, u32>,
    metadata: Value,
}

impl Committed {
    pub fn new(hydrants: BTreeMap<String, u32>, metadata: Value) -> Self {
        Self { hydrants, metadata }
    }

    pub fn hydrants(&self) -> &BTreeMap<String, u32> {
        &self.hydrants
    }

    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn count_for(&self, sink_dir_name: &str) -> Option<u32> {
        self.hydrants.get(sink_dir_name).copied()
    }
}

/// Reads and writes `<base>/commit.json`.
pub struct Ledger {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.base_dir.join(COMMIT_FILE_NAME)
    }

    /// The current record, or `None` if nothing was ever committed.
    pub fn read(&self) -> Result<Option<Committed>> {
        let path = self.path();
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SinkbufError::io_at(&path, e)),
        };
        let committed = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            SinkbufError::DataCorruption(format!("unreadable commit record {:?}: {}", path, e))
        })?;
        Ok(Some(committed))
    }

    /// Metadata of the last successful commit.
    pub fn recover_last_token(&self) -> Result<Option<Value>> {
        Ok(self
            .read()?
            .map(|committed| committed.metadata)
            .filter(|metadata| !metadata.is_null()))
    }

    /// Atomically replaces the record.
    pub fn commit(&self, committed: &Committed) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_locked(committed)
    }

    /// Builds the record under the write lock, so it cannot interleave
    /// with [`Ledger::remove_sink`], then replaces it atomically.
    pub fn commit_with<F>(&self, build: F) -> Result<Committed>
    where
        F: FnOnce() -> Committed,
    {
        let _guard = self.write_lock.lock();
        let committed = build();
        self.write_locked(&committed)?;
        Ok(committed)
    }

    fn write_locked(&self, committed: &Committed) -> Result<()> {
        fs::create_dir_all(&self.base_dir).map_err(|e| SinkbufError::io_at(&self.base_dir, e))?;

        let temp_path = self.base_dir.join(COMMIT_TEMP_FILE_NAME);
        {
            let file = File::create(&temp_path).map_err(|e| SinkbufError::io_at(&temp_path, e))?;
            let mut writer = BufWriter::new(&file);
            serde_json::to_writer_pretty(&mut writer, committed)?;
            writer.flush().map_err(|e| SinkbufError::io_at(&temp_path, e))?;
            drop(writer);
            file.sync_all().map_err(|e| SinkbufError::io_at(&temp_path, e))?;
        }

        let path = self.path();
        fs::rename(&temp_path, &path).map_err(|e| SinkbufError::io_at(&path, e))?;
        sync_dir(&self.base_dir)?;
        debug!(
            "Committed {} sinks with metadata {}",
            committed.hydrants.len(),
            committed.metadata
        );
        Ok(())
    }

    /// Drops a sink from the record, keeping everything else.
    pub fn remove_sink(&self, sink_dir_name: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let Some(mut committed) = self.read()? else {
            return Ok(());
        };
        if committed.hydrants.remove(sink_dir_name).is_some() {
            self.write_locked(&committed)?;
        }
        Ok(())
    }

    /// Deletes the record.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock();
        let path = self.path();
        match fs::remove_file(&path) {
            Ok(()) => sync_dir(&self.base_dir),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkbufError::io_at(&path, e)),
        }
    }
}

/// A sink found on disk whose fire-segments are covered by the record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredSink {
    pub identity: PartitionIdentity,
    pub dir: PathBuf,
    /// Committed chunk directories, ascending by sequence.
    pub chunks: Vec<(u32, PathBuf)>,
}

fn parse_sequence(name: &OsStr) -> Option<u32> {
    let name = name.to_str()?;
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u32>().ok()
}

fn remove_dir(path: &Path) -> Result<()> {
    fs::remove_dir_all(path).map_err(|e| SinkbufError::io_at(path, e))
}

/// Enumerates sink directories under `base_dir` against `committed`.
///
/// Sinks absent from the record and fire-segment directories beyond the
/// committed count are deleted. A committed fire-segment that is missing or
/// incomplete is reported as corruption.
pub fn recover_sinks(base_dir: &Path, committed: Option<&Committed>) -> Result<Vec<RecoveredSink>> {
    let entries = match fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SinkbufError::io_at(base_dir, e)),
    };

    let mut recovered = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SinkbufError::io_at(base_dir, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        let Some(count) = committed.and_then(|c| c.count_for(&name)) else {
            warn!("Removing uncommitted sink directory {:?}", path);
            remove_dir(&path)?;
            continue;
        };

        let identity = read_identity(&path)?;
        if identity.dir_name() != name {
            return Err(SinkbufError::DataCorruption(format!(
                "sink directory {:?} holds identity {}",
                path, identity
            )));
        }

        let mut chunks = Vec::new();
        for chunk_entry in fs::read_dir(&path).map_err(|e| SinkbufError::io_at(&path, e))? {
            let chunk_entry = chunk_entry.map_err(|e| SinkbufError::io_at(&path, e))?;
            let Some(sequence) = parse_sequence(&chunk_entry.file_name()) else {
                continue;
            };
            let chunk_path = chunk_entry.path();
            if sequence >= count {
                warn!("Removing uncommitted fire-segment {:?}", chunk_path);
                remove_dir(&chunk_path)?;
                continue;
            }
            chunks.push((sequence, chunk_path));
        }
        chunks.sort_by_key(|(sequence, _)| *sequence);

        for expected in 0..count {
            let present = chunks
                .get(expected as usize)
                .is_some_and(|(sequence, dir)| *sequence == expected && is_complete(dir));
            if !present {
                return Err(SinkbufError::DataCorruption(format!(
                    "committed fire-segment {} of {} is missing or incomplete",
                    expected, identity
                )));
            }
        }

        info!("Recovered {} with {} fire-segments", identity, chunks.len());
        recovered.push(RecoveredSink {
            identity,
            dir: path,
            chunks,
        });
    }

    recovered.sort_by(|a, b| a.identity.cmp(&b.identity));
    Ok(recovered)
}
