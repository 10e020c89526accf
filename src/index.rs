//! In-memory partition index.
//!
//! A `PartitionIndex` holds the rows of one fire-segment while it is still
//! mutable. Dimension values are dictionary encoded per column and, when the
//! schema enables rollup, rows with the same truncated timestamp and
//! dimension values are merged into a single row by folding their
//! aggregators.
//!
//! There is a single writer. Readers may run concurrently with it; the row
//! count is published only after the row is fully written, so a reader that
//! bounds itself by `row_count()` never observes a partial row.

use parking_lot::{RwLock, RwLockReadGuard};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::query::ScanRow;
use crate::schema::{DataSchema, DimensionKind, MetricValue, ParseError, parse_long};
use crate::InputRow;

/// Bookkeeping cost of one stored row (map entry plus key holder).
pub const ROW_OVERHEAD_BYTES: usize = 72;
/// Cost of one dimension code in a row key.
pub const DIMENSION_KEY_BYTES: usize = 4;
/// Cost of one aggregator accumulator.
pub const AGGREGATOR_BYTES: usize = 28;
/// Fixed cost of a dictionary entry; the value's length is added on top.
pub const DICTIONARY_ENTRY_OVERHEAD_BYTES: usize = 28;
/// Charged when a row is merged into an existing one by rollup.
pub const ROLLUP_MERGE_BYTES: usize = 4;

/// Dimension code that stands for a null value.
pub const NULL_CODE: u32 = u32::MAX;

/// What happened to an offered row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new row was appended.
    Added,
    /// The row was folded into an existing one.
    Merged,
    /// The row could not be encoded and was dropped.
    Rejected,
}

/// Result of [`PartitionIndex::ingest`].
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub outcome: IngestOutcome,
    /// First parse problem met while ingesting. For rejected rows this is the
    /// rejection reason; otherwise the row was kept with the value omitted.
    pub parse_error: Option<ParseError>,
    /// Change in the index's estimated size.
    pub bytes_delta: usize,
}

/// Dictionary of the distinct values of one dimension, codes assigned in
/// insertion order.
#[derive(Debug, Default)]
pub(crate) struct Dictionary {
    values: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl Dictionary {
    fn get_or_insert(&mut self, value: &str) -> (u32, bool) {
        if let Some(code) = self.lookup.get(value) {
            return (*code, false);
        }
        let code = self.values.len() as u32;
        self.values.push(value.to_string());
        self.lookup.insert(value.to_string(), code);
        (code, true)
    }

    pub(crate) fn code(&self, value: &str) -> Option<u32> {
        self.lookup.get(value).copied()
    }

    pub(crate) fn value(&self, code: u32) -> Option<&str> {
        self.values.get(code as usize).map(String::as_str)
    }

    pub(crate) fn values(&self) -> &[String] {
        &self.values
    }
}

pub(crate) struct DimensionColumn {
    pub(crate) name: String,
    pub(crate) kind: DimensionKind,
    pub(crate) dictionary: Dictionary,
    /// Row positions per dictionary code, kept only when bitmaps are enabled.
    bitmaps: Vec<RoaringBitmap>,
    null_bitmap: RoaringBitmap,
}

pub(crate) struct StoredRow {
    pub(crate) timestamp: i64,
    /// One code per dimension known when the row was written. Dimensions
    /// discovered later are implicitly null for this row.
    pub(crate) dims: Vec<u32>,
    pub(crate) metrics: Vec<MetricValue>,
}

impl StoredRow {
    pub(crate) fn code(&self, dimension: usize) -> u32 {
        self.dims.get(dimension).copied().unwrap_or(NULL_CODE)
    }
}

#[derive(Default)]
pub(crate) struct IndexState {
    pub(crate) dimensions: Vec<DimensionColumn>,
    dimension_lookup: HashMap<String, usize>,
    pub(crate) rows: Vec<StoredRow>,
    rollup_keys: HashMap<(i64, Vec<u32>), usize>,
    min_timestamp: Option<i64>,
    max_timestamp: Option<i64>,
}

impl IndexState {
    fn add_dimension(&mut self, name: &str, kind: DimensionKind) -> usize {
        let position = self.dimensions.len();
        let mut null_bitmap = RoaringBitmap::new();
        null_bitmap.insert_range(0..self.rows.len() as u32);
        self.dimensions.push(DimensionColumn {
            name: name.to_string(),
            kind,
            dictionary: Dictionary::default(),
            bitmaps: Vec::new(),
            null_bitmap,
        });
        self.dimension_lookup.insert(name.to_string(), position);
        position
    }
}

/// A row resolved against the schema and ready to be written.
struct PreparedRow {
    timestamp: i64,
    dims: Vec<(String, Option<String>)>,
    metrics: Vec<MetricValue>,
}

/// Mutable, append-only columnar index of one fire-segment.
pub struct PartitionIndex {
    schema: Arc<DataSchema>,
    strict: bool,
    state: RwLock<IndexState>,
    num_rows: AtomicUsize,
    estimated_bytes: AtomicUsize,
}

impl PartitionIndex {
    /// Creates an empty index. With `strict` set, rows whose dimension values
    /// cannot be encoded are rejected instead of stored with a null.
    pub fn new(schema: Arc<DataSchema>, strict: bool) -> Self {
        let mut state = IndexState::default();
        for dimension in schema.dimensions() {
            state.add_dimension(&dimension.name, dimension.kind);
        }

        Self {
            schema,
            strict,
            state: RwLock::new(state),
            num_rows: AtomicUsize::new(0),
            estimated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn schema(&self) -> &Arc<DataSchema> {
        &self.schema
    }

    /// Number of rows visible to readers.
    pub fn row_count(&self) -> usize {
        self.num_rows.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Running estimate of the heap held by this index.
    pub fn estimate_bytes(&self) -> usize {
        self.estimated_bytes.load(Ordering::Acquire)
    }

    pub fn dimension_count(&self) -> usize {
        self.state.read().dimensions.len()
    }

    pub fn dimension_names(&self) -> Vec<String> {
        self.state
            .read()
            .dimensions
            .iter()
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn min_timestamp(&self) -> Option<i64> {
        self.state.read().min_timestamp
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.state.read().max_timestamp
    }

    /// Indexes one raw input row.
    pub fn ingest(&self, row: &InputRow) -> IngestReport {
        let mut state = self.state.write();

        let (prepared, parse_error) = match self.prepare(&state, row) {
            Ok(prepared) => prepared,
            Err(reason) => {
                return IngestReport {
                    outcome: IngestOutcome::Rejected,
                    parse_error: Some(reason),
                    bytes_delta: 0,
                };
            }
        };

        let (outcome, bytes_delta) = self.apply(&mut state, prepared);
        self.publish(&state, bytes_delta);

        IngestReport {
            outcome,
            parse_error,
            bytes_delta,
        }
    }

    /// Re-indexes a row that was already aggregated, combining its metric
    /// values with any row it rolls up into.
    pub fn ingest_aggregated(&self, row: &ScanRow) -> IngestOutcome {
        let mut state = self.state.write();

        let metrics = self
            .schema
            .aggregators()
            .iter()
            .map(|agg| row.metric(agg.name()).unwrap_or_else(|| agg.initial()))
            .collect();
        let prepared = PreparedRow {
            timestamp: self.schema.query_granularity().truncate(row.timestamp),
            dims: row.dimensions.clone(),
            metrics,
        };

        let (outcome, bytes_delta) = self.apply(&mut state, prepared);
        self.publish(&state, bytes_delta);
        outcome
    }

    fn prepare(
        &self,
        state: &IndexState,
        row: &InputRow,
    ) -> std::result::Result<(PreparedRow, Option<ParseError>), ParseError> {
        let mut parse_error = None;
        let mut dims = Vec::with_capacity(state.dimensions.len());

        for column in &state.dimensions {
            let value = match (column.kind, row.field(&column.name)) {
                (_, None) => None,
                (DimensionKind::String, Some(value)) => value.to_dimension_string(),
                (DimensionKind::Long, Some(value)) => match parse_long(&column.name, value) {
                    Ok(parsed) => parsed.map(|v| v.to_string()),
                    Err(e) if self.strict => return Err(e),
                    Err(e) => {
                        parse_error.get_or_insert(e);
                        None
                    }
                },
            };
            dims.push((column.name.clone(), value));
        }

        if self.schema.is_schemaless() {
            let inputs = self.schema.aggregator_inputs();
            for (name, value) in row.fields() {
                if inputs.contains(name) || state.dimension_lookup.contains_key(name) {
                    continue;
                }
                if let Some(value) = value.to_dimension_string() {
                    dims.push((name.to_string(), Some(value)));
                }
            }
        }

        let mut metrics = Vec::with_capacity(self.schema.aggregators().len());
        for agg in self.schema.aggregators() {
            let mut acc = agg.initial();
            if let Err(e) = agg.aggregate(&mut acc, row) {
                parse_error.get_or_insert(e);
            }
            metrics.push(acc);
        }

        let prepared = PreparedRow {
            timestamp: self.schema.query_granularity().truncate(row.timestamp()),
            dims,
            metrics,
        };
        Ok((prepared, parse_error))
    }

    fn apply(&self, state: &mut IndexState, prepared: PreparedRow) -> (IngestOutcome, usize) {
        for (name, _) in &prepared.dims {
            if !state.dimension_lookup.contains_key(name) {
                state.add_dimension(name, DimensionKind::String);
            }
        }

        let mut bytes = 0;
        let mut codes = vec![NULL_CODE; state.dimensions.len()];
        for (name, value) in &prepared.dims {
            let Some(&position) = state.dimension_lookup.get(name) else {
                continue;
            };
            if let Some(value) = value {
                let (code, inserted) = state.dimensions[position]
                    .dictionary
                    .get_or_insert(value);
                if inserted {
                    bytes += DICTIONARY_ENTRY_OVERHEAD_BYTES + value.len();
                }
                codes[position] = code;
            }
        }

        let mut key_len = codes.len();
        while key_len > 0 && codes[key_len - 1] == NULL_CODE {
            key_len -= 1;
        }
        let key = (prepared.timestamp, codes[..key_len].to_vec());

        if self.schema.rollup()
            && let Some(&position) = state.rollup_keys.get(&key)
        {
            let row = &mut state.rows[position];
            for ((agg, acc), value) in self
                .schema
                .aggregators()
                .iter()
                .zip(row.metrics.iter_mut())
                .zip(prepared.metrics)
            {
                agg.combine(acc, value);
            }
            return (IngestOutcome::Merged, bytes + ROLLUP_MERGE_BYTES);
        }

        let position = state.rows.len();
        if self.schema.in_memory_bitmaps() {
            for (dimension, code) in state.dimensions.iter_mut().zip(&codes) {
                if *code == NULL_CODE {
                    dimension.null_bitmap.insert(position as u32);
                } else {
                    let code = *code as usize;
                    if dimension.bitmaps.len() <= code {
                        dimension.bitmaps.resize_with(code + 1, RoaringBitmap::new);
                    }
                    dimension.bitmaps[code].insert(position as u32);
                }
            }
        }

        bytes += ROW_OVERHEAD_BYTES
            + codes.len() * DIMENSION_KEY_BYTES
            + prepared.metrics.len() * AGGREGATOR_BYTES;

        state.min_timestamp = Some(
            state
                .min_timestamp
                .map_or(prepared.timestamp, |t| t.min(prepared.timestamp)),
        );
        state.max_timestamp = Some(
            state
                .max_timestamp
                .map_or(prepared.timestamp, |t| t.max(prepared.timestamp)),
        );
        if self.schema.rollup() {
            state.rollup_keys.insert(key, position);
        }
        state.rows.push(StoredRow {
            timestamp: prepared.timestamp,
            dims: codes,
            metrics: prepared.metrics,
        });

        (IngestOutcome::Added, bytes)
    }

    fn publish(&self, state: &IndexState, bytes_delta: usize) {
        self.estimated_bytes.fetch_add(bytes_delta, Ordering::AcqRel);
        self.num_rows.store(state.rows.len(), Ordering::Release);
    }

    /// Timestamp of the row at `position`, or `None` past the published
    /// count. Rollup never changes a row's timestamp.
    pub fn timestamp_at(&self, position: usize) -> Option<i64> {
        if position >= self.row_count() {
            return None;
        }
        self.state.read().rows.get(position).map(|row| row.timestamp)
    }

    /// Decodes the row at `position`, or `None` past the published count.
    pub fn read_back(&self, position: usize) -> Option<ScanRow> {
        if position >= self.row_count() {
            return None;
        }
        let state = self.state.read();
        let row = state.rows.get(position)?;
        Some(self.decode(&state, row))
    }

    fn decode(&self, state: &IndexState, row: &StoredRow) -> ScanRow {
        let dimensions = state
            .dimensions
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let value = column.dictionary.value(row.code(i)).map(str::to_string);
                (column.name.clone(), value)
            })
            .collect();
        let metrics = self
            .schema
            .aggregators()
            .iter()
            .zip(&row.metrics)
            .map(|(agg, value)| (agg.name().to_string(), *value))
            .collect();

        ScanRow {
            timestamp: row.timestamp,
            dimensions,
            metrics,
        }
    }

    /// Row positions holding `value` (or null) in `dimension`. `None` when
    /// in-memory bitmaps are disabled.
    pub fn bitmap_for(&self, dimension: &str, value: Option<&str>) -> Option<RoaringBitmap> {
        if !self.schema.in_memory_bitmaps() {
            return None;
        }
        let state = self.state.read();
        let Some(&position) = state.dimension_lookup.get(dimension) else {
            return Some(match value {
                Some(_) => RoaringBitmap::new(),
                None => full_bitmap(state.rows.len()),
            });
        };

        let column = &state.dimensions[position];
        let bitmap = match value {
            None => column.null_bitmap.clone(),
            Some(value) => column
                .dictionary
                .code(value)
                .and_then(|code| column.bitmaps.get(code as usize).cloned())
                .unwrap_or_default(),
        };
        Some(bitmap)
    }

    /// Locks the index for a consistent bulk read of its first `row_count()`
    /// rows.
    pub(crate) fn snapshot(&self) -> IndexSnapshot<'_> {
        let guard = self.state.read();
        let count = guard.rows.len();
        IndexSnapshot {
            index: self,
            guard,
            count,
        }
    }
}

pub(crate) fn full_bitmap(len: usize) -> RoaringBitmap {
    let mut bitmap = RoaringBitmap::new();
    bitmap.insert_range(0..len as u32);
    bitmap
}

/// Read-locked view over an index, used when converting it to columns.
pub(crate) struct IndexSnapshot<'a> {
    index: &'a PartitionIndex,
    guard: RwLockReadGuard<'a, IndexState>,
    count: usize,
}

impl IndexSnapshot<'_> {
    pub(crate) fn row_count(&self) -> usize {
        self.count
    }

    pub(crate) fn dimensions(&self) -> &[DimensionColumn] {
        &self.guard.dimensions
    }

    pub(crate) fn rows(&self) -> &[StoredRow] {
        &self.guard.rows[..self.count]
    }

    pub(crate) fn schema(&self) -> &DataSchema {
        &self.index.schema
    }

    pub(crate) fn min_timestamp(&self) -> Option<i64> {
        self.guard.min_timestamp
    }

    pub(crate) fn max_timestamp(&self) -> Option<i64> {
        self.guard.max_timestamp
    }
}
