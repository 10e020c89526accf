//! Fire-segments: the unit of persistence inside a sink.
//!
//! A fire-segment starts as an in-memory [`PartitionIndex`] and, once
//! sealed, is backed by a memory-mapped [`PersistedChunk`] holding the same
//! rows. The switch is one-way. Readers that opened a cursor before the
//! switch keep their reference to the frozen index and are unaffected.

use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::chunk::{ChunkDescriptor, PersistedChunk, write_chunk};
use crate::filter::CompiledFilter;
use crate::governor::mapped_overhead;
use crate::index::{IngestReport, PartitionIndex};
use crate::query::ScanRow;
use crate::time::Interval;
use crate::{InputRow, Result, SinkbufError};

#[derive(Clone)]
enum Backing {
    InMemory(Arc<PartitionIndex>),
    Persisted(Arc<PersistedChunk>),
}

/// Outcome of [`FireSegment::seal`].
#[derive(Debug, Clone, PartialEq)]
pub struct SealResult {
    pub descriptor: ChunkDescriptor,
    /// Index bytes released by this call. Zero when already sealed.
    pub freed_bytes: usize,
}

pub struct FireSegment {
    sequence: u32,
    backing: RwLock<Backing>,
    writable: AtomicBool,
    sealed: Mutex<Option<ChunkDescriptor>>,
}

impl FireSegment {
    /// A new, writable fire-segment around an empty index.
    pub fn new(sequence: u32, index: PartitionIndex) -> Self {
        Self {
            sequence,
            backing: RwLock::new(Backing::InMemory(Arc::new(index))),
            writable: AtomicBool::new(true),
            sealed: Mutex::new(None),
        }
    }

    /// A fire-segment reopened from a chunk on disk.
    pub fn restore(sequence: u32, chunk: PersistedChunk) -> Self {
        let descriptor = chunk.descriptor();
        Self {
            sequence,
            backing: RwLock::new(Backing::Persisted(Arc::new(chunk))),
            writable: AtomicBool::new(false),
            sealed: Mutex::new(Some(descriptor)),
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        matches!(*self.backing.read(), Backing::Persisted(_))
    }

    pub fn write(&self, row: &InputRow) -> Result<IngestReport> {
        if !self.is_writable() {
            return Err(SinkbufError::ImmutableFireSegment {
                sequence: self.sequence,
            });
        }
        match &*self.backing.read() {
            Backing::InMemory(index) => Ok(index.ingest(row)),
            Backing::Persisted(_) => Err(SinkbufError::ImmutableFireSegment {
                sequence: self.sequence,
            }),
        }
    }

    /// Stops accepting writes. Idempotent.
    pub fn freeze(&self) {
        self.writable.store(false, Ordering::Release);
    }

    /// Writes the index to `dir` and swaps in a mapped view of it.
    ///
    /// A second call returns the first call's descriptor and writes nothing.
    pub fn seal(&self, dir: &Path) -> Result<SealResult> {
        let mut sealed = self.sealed.lock();
        if let Some(descriptor) = sealed.as_ref() {
            return Ok(SealResult {
                descriptor: descriptor.clone(),
                freed_bytes: 0,
            });
        }

        self.freeze();
        let index = match &*self.backing.read() {
            Backing::InMemory(index) => Arc::clone(index),
            Backing::Persisted(chunk) => {
                let descriptor = chunk.descriptor();
                *sealed = Some(descriptor.clone());
                return Ok(SealResult {
                    descriptor,
                    freed_bytes: 0,
                });
            }
        };

        let descriptor = write_chunk(&index, dir)?;
        let chunk = PersistedChunk::open(dir)?;
        let freed_bytes = index.estimate_bytes();
        *self.backing.write() = Backing::Persisted(Arc::new(chunk));
        *sealed = Some(descriptor.clone());

        debug!(
            "Sealed fire-segment {} ({} rows) into {:?}",
            self.sequence, descriptor.num_rows, descriptor.dir
        );
        Ok(SealResult {
            descriptor,
            freed_bytes,
        })
    }

    pub fn rows(&self) -> usize {
        match &*self.backing.read() {
            Backing::InMemory(index) => index.row_count(),
            Backing::Persisted(chunk) => chunk.num_rows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Index estimate while in memory, the mapped overhead once persisted.
    pub fn bytes_in_memory(&self) -> usize {
        match &*self.backing.read() {
            Backing::InMemory(index) => index.estimate_bytes(),
            Backing::Persisted(_) => self.mapped_overhead(),
        }
    }

    pub fn dimension_count(&self) -> usize {
        match &*self.backing.read() {
            Backing::InMemory(index) => index.dimension_count(),
            Backing::Persisted(chunk) => chunk.dimension_count(),
        }
    }

    pub fn metric_count(&self) -> usize {
        match &*self.backing.read() {
            Backing::InMemory(index) => index.schema().aggregators().len(),
            Backing::Persisted(chunk) => chunk.metric_count(),
        }
    }

    /// What this fire-segment holds in memory once mapped back from disk.
    pub fn mapped_overhead(&self) -> usize {
        mapped_overhead(self.dimension_count(), self.metric_count())
    }

    /// Opens a cursor over the rows visible now, restricted to rows whose
    /// timestamp falls in one of `scopes` and that pass `filter`.
    pub fn cursor(&self, scopes: Arc<[Interval]>, filter: Option<Arc<CompiledFilter>>) -> FireCursor {
        let backing = self.backing.read().clone();
        match backing {
            Backing::InMemory(index) => {
                let count = index.row_count();
                let bitmap = filter.as_ref().and_then(|f| f.bitmap(&index, count));
                let (positions, filter) = match bitmap {
                    Some(mut bitmap) => {
                        bitmap.remove_range(count as u32..);
                        (Positions::Bitmap(bitmap.into_iter()), None)
                    }
                    None => (Positions::Range(0..count), filter),
                };
                FireCursor {
                    source: CursorSource::Index(index),
                    positions,
                    scopes,
                    filter,
                    failed: false,
                }
            }
            Backing::Persisted(chunk) => {
                let count = chunk.num_rows();
                FireCursor {
                    source: CursorSource::Chunk(chunk),
                    positions: Positions::Range(0..count),
                    scopes,
                    filter,
                    failed: false,
                }
            }
        }
    }
}

enum CursorSource {
    Index(Arc<PartitionIndex>),
    Chunk(Arc<PersistedChunk>),
}

enum Positions {
    Range(Range<usize>),
    Bitmap(roaring::bitmap::IntoIter),
    Listed(std::vec::IntoIter<usize>),
}

impl Iterator for Positions {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        match self {
            Positions::Range(range) => range.next(),
            Positions::Bitmap(iter) => iter.next().map(|p| p as usize),
            Positions::Listed(iter) => iter.next(),
        }
    }
}

/// Rows of one fire-segment, in storage order.
pub struct FireCursor {
    source: CursorSource,
    positions: Positions,
    scopes: Arc<[Interval]>,
    filter: Option<Arc<CompiledFilter>>,
    failed: bool,
}

impl FireCursor {
    fn in_scope(&self, timestamp: i64) -> bool {
        self.scopes.iter().any(|scope| scope.contains(timestamp))
    }

    fn passes(&self, row: &ScanRow) -> bool {
        self.filter.as_ref().is_none_or(|f| f.matches(row))
    }

    /// Reorders the remaining positions by timestamp, ties in storage order.
    ///
    /// Only `(timestamp, position)` pairs of in-scope rows are held; rows
    /// are still decoded one at a time, from the mapped chunk once
    /// persisted.
    pub fn order_by_time(&mut self, descending: bool) -> Result<()> {
        let positions = std::mem::replace(&mut self.positions, Positions::Range(0..0));
        let mut keyed = Vec::new();
        for position in positions {
            let timestamp = match &self.source {
                CursorSource::Index(index) => match index.timestamp_at(position) {
                    Some(timestamp) => timestamp,
                    None => continue,
                },
                CursorSource::Chunk(chunk) => match chunk.timestamp_at(position) {
                    Ok(timestamp) => timestamp,
                    Err(e) => {
                        self.failed = true;
                        return Err(e);
                    }
                },
            };
            if self.in_scope(timestamp) {
                keyed.push((timestamp, position));
            }
        }

        if descending {
            keyed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        } else {
            keyed.sort_unstable();
        }
        let ordered: Vec<usize> = keyed.into_iter().map(|(_, position)| position).collect();
        self.positions = Positions::Listed(ordered.into_iter());
        Ok(())
    }
}

impl Iterator for FireCursor {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        while let Some(position) = self.positions.next() {
            let row = match &self.source {
                CursorSource::Index(index) => match index.read_back(position) {
                    Some(row) if self.in_scope(row.timestamp) => row,
                    _ => continue,
                },
                CursorSource::Chunk(chunk) => {
                    let decoded = chunk.timestamp_at(position).and_then(|timestamp| {
                        if self.in_scope(timestamp) {
                            chunk.read_row(position).map(Some)
                        } else {
                            Ok(None)
                        }
                    });
                    match decoded {
                        Ok(Some(row)) => row,
                        Ok(None) => continue,
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
            };
            if self.passes(&row) {
                return Some(Ok(row));
            }
        }
        None
    }
}

/// All-time scope, for reads that should not be restricted.
pub(crate) fn unscoped() -> Arc<[Interval]> {
    Arc::from([Interval::ETERNITY])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::DimFilter;
    use crate::schema::{AggregatorSpec, DataSchema, DimensionSchema};
    use std::fs;
    use tempfile::TempDir;

    fn schema(bitmaps: bool) -> Arc<DataSchema> {
        Arc::new(
            DataSchema::new("events")
                .with_dimensions(vec![DimensionSchema::string("dim")])
                .with_aggregators(vec![
                    AggregatorSpec::count("count"),
                    AggregatorSpec::long_sum("met", "met"),
                ])
                .with_in_memory_bitmaps(bitmaps),
        )
    }

    fn row(ts: i64, dim: &str, met: i64) -> InputRow {
        InputRow::new(ts).with_field("dim", dim).with_field("met", met)
    }

    fn filled(bitmaps: bool) -> FireSegment {
        let fs = FireSegment::new(0, PartitionIndex::new(schema(bitmaps), false));
        fs.write(&row(1000, "foo", 1)).unwrap();
        fs.write(&row(2000, "bar", 2)).unwrap();
        fs.write(&row(3000, "foo", 4)).unwrap();
        fs
    }

    fn collect(cursor: FireCursor) -> Vec<ScanRow> {
        cursor.collect::<Result<Vec<_>>>().unwrap()
    }

    #[test]
    fn test_write_after_freeze_fails() {
        let fs = filled(false);
        fs.freeze();
        assert!(matches!(
            fs.write(&row(4000, "baz", 1)),
            Err(SinkbufError::ImmutableFireSegment { sequence: 0 })
        ));
    }

    #[test]
    fn test_seal_is_idempotent_and_byte_identical() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("0");
        let fs = filled(false);
        let bytes_before = fs.bytes_in_memory();

        let first = fs.seal(&dir).unwrap();
        assert_eq!(first.freed_bytes, bytes_before);
        assert!(fs.is_persisted());
        assert!(!fs.is_writable());
        let data_before = fs::read(dir.join("data")).unwrap();

        let second = fs.seal(&dir).unwrap();
        assert_eq!(second.descriptor, first.descriptor);
        assert_eq!(second.freed_bytes, 0);
        assert_eq!(fs::read(dir.join("data")).unwrap(), data_before);

        assert!(matches!(
            fs.write(&row(4000, "baz", 1)),
            Err(SinkbufError::ImmutableFireSegment { .. })
        ));
    }

    #[test]
    fn test_bytes_drop_to_mapped_overhead() {
        let temp_dir = TempDir::new().unwrap();
        let fs = filled(false);
        assert!(fs.bytes_in_memory() > 0);
        fs.seal(&temp_dir.path().join("0")).unwrap();
        assert_eq!(fs.bytes_in_memory(), mapped_overhead(1, 2));
        assert_eq!(fs.rows(), 3);
    }

    #[test]
    fn test_cursor_same_before_and_after_seal() {
        let temp_dir = TempDir::new().unwrap();
        let fs = filled(false);
        let scopes: Arc<[Interval]> = Arc::from([Interval::new(1500, 3500).unwrap()]);

        let before = collect(fs.cursor(Arc::clone(&scopes), None));
        fs.seal(&temp_dir.path().join("0")).unwrap();
        let after = collect(fs.cursor(scopes, None));

        assert_eq!(before.len(), 2);
        assert_eq!(before, after);
    }

    #[test]
    fn test_cursor_is_point_in_time() {
        let fs = filled(false);
        let mut cursor = fs.cursor(unscoped(), None);
        assert!(cursor.next().is_some());
        fs.write(&row(5000, "late", 1)).unwrap();
        assert_eq!(cursor.count(), 2);
        assert_eq!(collect(fs.cursor(unscoped(), None)).len(), 4);
    }

    #[test]
    fn test_cursor_filters_with_and_without_bitmaps() {
        let filter = DimFilter::selector("dim", "foo");
        for bitmaps in [false, true] {
            let fs = filled(bitmaps);
            let compiled = Arc::new(filter.compile(&schema(bitmaps)));
            let rows = collect(fs.cursor(unscoped(), Some(compiled)));
            let timestamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
            assert_eq!(timestamps, vec![1000, 3000], "bitmaps={}", bitmaps);
        }
    }

    #[test]
    fn test_restore_is_immutable() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("3");
        let original = filled(false);
        let sealed = original.seal(&dir).unwrap();

        let restored = FireSegment::restore(3, PersistedChunk::open(&dir).unwrap());
        assert_eq!(restored.sequence(), 3);
        assert!(!restored.is_writable());
        assert_eq!(restored.seal(&dir).unwrap().descriptor, sealed.descriptor);
        assert_eq!(collect(restored.cursor(unscoped(), None)).len(), 3);
    }

    #[test]
    fn test_order_by_time_in_memory_and_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let fs = FireSegment::new(0, PartitionIndex::new(schema(true), false));
        for (ts, dim) in [(3000, "c"), (1000, "a"), (4000, "d"), (2000, "b"), (1000, "e")] {
            fs.write(&row(ts, dim, 1)).unwrap();
        }
        let scopes: Arc<[Interval]> = Arc::from([Interval::new(1000, 3500).unwrap()]);
        let dims = |cursor: FireCursor| -> Vec<String> {
            collect(cursor)
                .iter()
                .map(|r| r.dimension("dim").unwrap().to_string())
                .collect()
        };

        let mut ascending = fs.cursor(Arc::clone(&scopes), None);
        ascending.order_by_time(false).unwrap();
        assert_eq!(dims(ascending), vec!["a", "e", "b", "c"]);

        fs.seal(&temp_dir.path().join("0")).unwrap();
        let mut descending = fs.cursor(Arc::clone(&scopes), None);
        descending.order_by_time(true).unwrap();
        assert_eq!(dims(descending), vec!["c", "b", "a", "e"]);

        let compiled = Arc::new(DimFilter::selector("dim", "e").compile(&schema(true)));
        let mut filtered = fs.cursor(scopes, Some(compiled));
        filtered.order_by_time(false).unwrap();
        assert_eq!(dims(filtered), vec!["e"]);
    }
}
