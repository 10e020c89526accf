//! Sinks: the ordered fire-segments of one partition identity.
//!
//! The last fire-segment of a sink is the only one that may be writable.
//! Swapping freezes it and hands it to a persist; the next add opens a fresh
//! one with the following sequence number.

use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::chunk::{ChunkDescriptor, sync_dir, write_chunk};
use crate::fire::{FireSegment, unscoped};
use crate::identity::PartitionIdentity;
use crate::index::{IngestOutcome, PartitionIndex};
use crate::meters::RowIngestionMeters;
use crate::schema::{DataSchema, ParseError};
use crate::{InputRow, Result, SinkbufError};

/// File in a sink directory recording which identity it belongs to.
pub const IDENTITY_FILE_NAME: &str = "identity.json";
/// Sub-directory receiving the merged chunk at push time.
pub const MERGED_DIR_NAME: &str = "merged";

/// Per-sink capacity and parsing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub strict: bool,
    pub max_rows_in_memory: usize,
    pub max_bytes_in_memory: Option<usize>,
}

/// What happened to a row offered to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Merged,
    /// Dropped because a value could not be parsed.
    Rejected,
    /// Dropped because its timestamp lies outside the sink's interval.
    ThrownAway,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkAdd {
    pub outcome: AddOutcome,
    /// Rows the add created in memory (0 or 1).
    pub rows_added: usize,
    pub bytes_delta: usize,
    /// Rows across all fire-segments of the sink.
    pub rows_in_sink: usize,
    pub can_append: bool,
    pub parse_error: Option<ParseError>,
}

pub struct Sink {
    identity: PartitionIdentity,
    schema: Arc<DataSchema>,
    dir: PathBuf,
    config: SinkConfig,
    segments: RwLock<Vec<Arc<FireSegment>>>,
    next_sequence: AtomicU32,
    writable: AtomicBool,
    /// Persists and pushes queued or running for this sink.
    persists_in_flight: AtomicUsize,
    dropped: AtomicBool,
    meters: RowIngestionMeters,
}

impl Sink {
    /// Creates an empty sink under `base_dir` and records its identity.
    pub fn create(
        identity: PartitionIdentity,
        schema: Arc<DataSchema>,
        base_dir: &Path,
        config: SinkConfig,
    ) -> Result<Self> {
        let dir = base_dir.join(identity.dir_name());
        fs::create_dir_all(&dir).map_err(|e| SinkbufError::io_at(&dir, e))?;
        write_identity(&dir, &identity)?;
        info!("Created sink for {} at {:?}", identity, dir);

        Ok(Self::with_segments(identity, schema, dir, config, Vec::new()))
    }

    /// Rebuilds a sink from fire-segments recovered from disk, which must be
    /// in ascending sequence order.
    pub fn restore(
        identity: PartitionIdentity,
        schema: Arc<DataSchema>,
        dir: PathBuf,
        config: SinkConfig,
        segments: Vec<FireSegment>,
    ) -> Self {
        let segments = segments.into_iter().map(Arc::new).collect();
        Self::with_segments(identity, schema, dir, config, segments)
    }

    fn with_segments(
        identity: PartitionIdentity,
        schema: Arc<DataSchema>,
        dir: PathBuf,
        config: SinkConfig,
        segments: Vec<Arc<FireSegment>>,
    ) -> Self {
        let next_sequence = segments.last().map_or(0, |fs| fs.sequence() + 1);
        Self {
            identity,
            schema,
            dir,
            config,
            segments: RwLock::new(segments),
            next_sequence: AtomicU32::new(next_sequence),
            writable: AtomicBool::new(true),
            persists_in_flight: AtomicUsize::new(0),
            dropped: AtomicBool::new(false),
            meters: RowIngestionMeters::new(),
        }
    }

    pub fn identity(&self) -> &PartitionIdentity {
        &self.identity
    }

    pub fn schema(&self) -> &Arc<DataSchema> {
        &self.schema
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meters(&self) -> &RowIngestionMeters {
        &self.meters
    }

    /// Directory of the fire-segment with `sequence`.
    pub fn segment_dir(&self, sequence: u32) -> PathBuf {
        self.dir.join(sequence.to_string())
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.dir.join(MERGED_DIR_NAME)
    }

    pub fn add(&self, row: &InputRow) -> Result<SinkAdd> {
        if !self.is_writable() {
            return Err(SinkbufError::SinkNotWritable {
                identity: self.identity.to_string(),
            });
        }

        if !self.identity.interval().contains(row.timestamp()) {
            self.meters.increment_thrown_away();
            return Ok(SinkAdd {
                outcome: AddOutcome::ThrownAway,
                rows_added: 0,
                bytes_delta: 0,
                rows_in_sink: self.num_rows(),
                can_append: self.can_append_row(),
                parse_error: None,
            });
        }

        let report = self.current_or_open().write(row)?;
        let outcome = match report.outcome {
            IngestOutcome::Added => AddOutcome::Added,
            IngestOutcome::Merged => AddOutcome::Merged,
            IngestOutcome::Rejected => AddOutcome::Rejected,
        };
        match (outcome, &report.parse_error) {
            (AddOutcome::Rejected, _) => self.meters.increment_unparseable(),
            (_, Some(_)) => self.meters.increment_processed_with_error(),
            (_, None) => self.meters.increment_processed(),
        }

        Ok(SinkAdd {
            outcome,
            rows_added: usize::from(outcome == AddOutcome::Added),
            bytes_delta: report.bytes_delta,
            rows_in_sink: self.num_rows(),
            can_append: self.can_append_row(),
            parse_error: report.parse_error,
        })
    }

    fn current(&self) -> Option<Arc<FireSegment>> {
        self.segments
            .read()
            .last()
            .filter(|fs| fs.is_writable())
            .cloned()
    }

    fn current_or_open(&self) -> Arc<FireSegment> {
        if let Some(current) = self.current() {
            return current;
        }

        let mut segments = self.segments.write();
        if let Some(last) = segments.last()
            && last.is_writable()
        {
            return Arc::clone(last);
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let index = PartitionIndex::new(Arc::clone(&self.schema), self.config.strict);
        let fs = Arc::new(FireSegment::new(sequence, index));
        segments.push(Arc::clone(&fs));
        debug!("Opened fire-segment {} for {}", sequence, self.identity);
        fs
    }

    /// True while the current fire-segment has room for another row.
    pub fn can_append_row(&self) -> bool {
        let Some(current) = self.current() else {
            return true;
        };
        if current.rows() >= self.config.max_rows_in_memory {
            return false;
        }
        match self.config.max_bytes_in_memory {
            Some(max) => current.bytes_in_memory() < max,
            None => true,
        }
    }

    /// Estimated bytes of the current fire-segment.
    pub fn bytes_in_memory(&self) -> usize {
        self.current().map_or(0, |fs| fs.bytes_in_memory())
    }

    /// Rows of the current fire-segment.
    pub fn rows_in_memory(&self) -> usize {
        self.current().map_or(0, |fs| fs.rows())
    }

    /// Mapped overhead the current fire-segment will keep once persisted.
    pub fn current_mapped_overhead(&self) -> usize {
        self.current().map_or(0, |fs| fs.mapped_overhead())
    }

    /// Mapped overhead of every frozen or persisted fire-segment.
    pub fn mapped_bytes(&self) -> usize {
        self.segments
            .read()
            .iter()
            .filter(|fs| !fs.is_writable())
            .map(|fs| fs.mapped_overhead())
            .sum()
    }

    /// Rows across all fire-segments.
    pub fn num_rows(&self) -> usize {
        self.segments.read().iter().map(|fs| fs.rows()).sum()
    }

    pub fn swappable(&self) -> bool {
        self.current().is_some_and(|fs| !fs.is_empty())
    }

    /// Freezes the current fire-segment, if it holds rows, and returns it.
    pub fn swap(&self) -> Option<Arc<FireSegment>> {
        let segments = self.segments.write();
        let last = segments.last()?;
        if !last.is_writable() || last.is_empty() {
            return None;
        }
        last.freeze();
        Some(Arc::clone(last))
    }

    /// Snapshot of the fire-segments in sequence order.
    pub fn fire_segments(&self) -> Vec<Arc<FireSegment>> {
        self.segments.read().clone()
    }

    /// Number of fire-segments already written to disk.
    pub fn persisted_count(&self) -> usize {
        self.segments
            .read()
            .iter()
            .filter(|fs| fs.is_persisted())
            .count()
    }

    /// Combines every fire-segment, in sequence order, into one chunk at
    /// `dir`. Rows are rolled up again when the schema enables rollup.
    pub fn merge(&self, dir: &Path) -> Result<ChunkDescriptor> {
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(|e| SinkbufError::io_at(dir, e))?;
        }

        let merged = PartitionIndex::new(Arc::clone(&self.schema), self.config.strict);
        for fs in self.fire_segments() {
            for row in fs.cursor(unscoped(), None) {
                merged.ingest_aggregated(&row?);
            }
        }
        let descriptor = write_chunk(&merged, dir)?;
        info!(
            "Merged {} fire-segments of {} into {} rows",
            self.segments.read().len(),
            self.identity,
            descriptor.num_rows
        );
        Ok(descriptor)
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// Stops accepting rows; used once a push has started.
    pub fn finish_writing(&self) {
        self.writable.store(false, Ordering::Release);
    }

    // SeqCst: a push raises the count before checking the flag and a drop
    // sets the flag before checking the count, so one of them sees the other.

    pub(crate) fn persist_started(&self) {
        self.persists_in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn persist_finished(&self) {
        let _ = self
            .persists_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }

    pub fn has_persist_in_flight(&self) -> bool {
        self.persists_in_flight.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn set_dropped(&self, dropped: bool) {
        self.dropped.store(dropped, Ordering::SeqCst);
    }

    /// Set once a drop has claimed the sink; it no longer appears in
    /// commit records.
    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

fn write_identity(dir: &Path, identity: &PartitionIdentity) -> Result<()> {
    let path = dir.join(IDENTITY_FILE_NAME);
    let file = File::create(&path).map_err(|e| SinkbufError::io_at(&path, e))?;
    let mut writer = BufWriter::new(&file);
    serde_json::to_writer_pretty(&mut writer, identity)?;
    writer.flush().map_err(|e| SinkbufError::io_at(&path, e))?;
    drop(writer);
    file.sync_all().map_err(|e| SinkbufError::io_at(&path, e))?;
    sync_dir(dir)
}

/// Reads the identity recorded in a sink directory.
pub fn read_identity(dir: &Path) -> Result<PartitionIdentity> {
    let path = dir.join(IDENTITY_FILE_NAME);
    let file = File::open(&path).map_err(|e| SinkbufError::io_at(&path, e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AggregatorSpec, DimensionSchema};
    use crate::time::Interval;
    use tempfile::TempDir;

    fn identity() -> PartitionIdentity {
        PartitionIdentity::new("events", "2000/2001".parse().unwrap(), "v1", 0)
    }

    fn schema(rollup: bool) -> Arc<DataSchema> {
        Arc::new(
            DataSchema::new("events")
                .with_dimensions(vec![DimensionSchema::string("dim")])
                .with_aggregators(vec![
                    AggregatorSpec::count("count"),
                    AggregatorSpec::long_sum("met", "met"),
                ])
                .with_rollup(rollup),
        )
    }

    fn config(max_rows: usize) -> SinkConfig {
        SinkConfig {
            strict: false,
            max_rows_in_memory: max_rows,
            max_bytes_in_memory: None,
        }
    }

    fn row(ts: &str, dim: &str, met: i64) -> InputRow {
        let ts = crate::time::parse_instant(ts).unwrap();
        InputRow::new(ts).with_field("dim", dim).with_field("met", met)
    }

    #[test]
    fn test_add_reports_capacity() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Sink::create(identity(), schema(true), temp_dir.path(), config(2)).unwrap();
        assert!(temp_dir.path().join(identity().dir_name()).join(IDENTITY_FILE_NAME).is_file());

        let first = sink.add(&row("2000", "foo", 1)).unwrap();
        assert_eq!(first.outcome, AddOutcome::Added);
        assert_eq!(first.rows_in_sink, 1);
        assert!(first.can_append);

        let second = sink.add(&row("2000", "bar", 2)).unwrap();
        assert_eq!(second.rows_in_sink, 2);
        assert!(!second.can_append);
        assert_eq!(sink.rows_in_memory(), 2);
    }

    #[test]
    fn test_rows_outside_interval_are_thrown_away() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Sink::create(identity(), schema(true), temp_dir.path(), config(10)).unwrap();

        let result = sink.add(&row("2001-06-01", "foo", 1)).unwrap();
        assert_eq!(result.outcome, AddOutcome::ThrownAway);
        assert_eq!(sink.num_rows(), 0);
        assert_eq!(sink.meters().snapshot().thrown_away, 1);
    }

    #[test]
    fn test_swap_opens_next_sequence() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Sink::create(identity(), schema(true), temp_dir.path(), config(10)).unwrap();
        assert!(!sink.swappable());
        assert!(sink.swap().is_none());

        sink.add(&row("2000", "foo", 1)).unwrap();
        assert!(sink.swappable());
        let swapped = sink.swap().unwrap();
        assert_eq!(swapped.sequence(), 0);
        assert!(!swapped.is_writable());
        assert_eq!(sink.rows_in_memory(), 0);
        assert_eq!(sink.bytes_in_memory(), 0);

        sink.add(&row("2000", "bar", 1)).unwrap();
        let segments = sink.fire_segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].sequence(), 1);
        assert_eq!(sink.num_rows(), 2);
        assert_eq!(sink.rows_in_memory(), 1);
    }

    #[test]
    fn test_merge_rolls_up_across_fire_segments() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Sink::create(identity(), schema(true), temp_dir.path(), config(10)).unwrap();

        sink.add(&row("2000", "foo", 1)).unwrap();
        let first = sink.swap().unwrap();
        first.seal(&sink.segment_dir(first.sequence())).unwrap();
        sink.add(&row("2000", "foo", 2)).unwrap();
        sink.add(&row("2000", "bar", 4)).unwrap();

        let descriptor = sink.merge(&sink.merged_dir()).unwrap();
        assert_eq!(descriptor.num_rows, 2);
        assert_eq!(sink.persisted_count(), 1);
    }

    #[test]
    fn test_finish_writing_rejects_rows() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Sink::create(identity(), schema(false), temp_dir.path(), config(10)).unwrap();
        sink.finish_writing();
        assert!(matches!(
            sink.add(&row("2000", "foo", 1)),
            Err(SinkbufError::SinkNotWritable { .. })
        ));
    }

    #[test]
    fn test_identity_file_round_trips() {
        let temp_dir = TempDir::new().unwrap();
        let sink = Sink::create(identity(), schema(false), temp_dir.path(), config(10)).unwrap();
        assert_eq!(read_identity(sink.dir()).unwrap(), identity());
        assert_eq!(sink.identity().interval(), Interval::new(946_684_800_000, 978_307_200_000).unwrap());
    }
}
