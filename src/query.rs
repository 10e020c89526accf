//! Query merge layer.
//!
//! Queries are resolved to a set of sinks, each restricted to one or more
//! time scopes. A sink contributes its fire-segments in sequence order,
//! whether they are still in memory or already persisted, and the per-sink
//! streams are combined lazily according to the requested ordering.
//!
//! Cursors are point-in-time: the list of fire-segments and the row count of
//! every in-memory index are captured when the query is opened, and rows
//! appended afterwards are not observed. Rollup merges into rows that were
//! already visible may still show up in their metric values.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::Arc;

use crate::concurrency::{Job, WorkerPool};
use crate::filter::{CompiledFilter, DimFilter};
use crate::fire::FireCursor;
use crate::identity::SegmentDescriptor;
use crate::schema::{AggregatorSpec, DataSchema, MetricValue, TIME_COLUMN};
use crate::sink::Sink;
use crate::time::{Granularity, Interval};
use crate::{Result, SinkbufError};

/// A decoded row as returned by scans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRow {
    pub timestamp: i64,
    pub dimensions: Vec<(String, Option<String>)>,
    pub metrics: Vec<(String, MetricValue)>,
}

impl ScanRow {
    /// Value of a dimension; `None` for nulls and unknown dimensions.
    pub fn dimension(&self, name: &str) -> Option<&str> {
        self.dimensions
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn metric(&self, name: &str) -> Option<MetricValue> {
        self.metrics.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Column names in output order: time, dimensions, metrics.
    pub fn columns(&self) -> Vec<String> {
        std::iter::once(TIME_COLUMN.to_string())
            .chain(self.dimensions.iter().map(|(n, _)| n.clone()))
            .chain(self.metrics.iter().map(|(n, _)| n.clone()))
            .collect()
    }
}

/// Order in which rows of different sinks are returned.
///
/// Time orderings sort each fire-segment's row positions by timestamp and
/// merge the fire-segments lazily. That costs one timestamp and one position
/// per in-scope row while the scan is open; rows are decoded only as they
/// are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrdering {
    /// Sinks in identity order, each in fire-segment order.
    #[default]
    Natural,
    TimeAscending,
    TimeDescending,
}

/// What to read and how to combine it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    /// Time scope. Empty means all time. Ignored when `segments` is set.
    pub intervals: Vec<Interval>,
    /// Partition scope; each descriptor must address a known sink.
    pub segments: Vec<SegmentDescriptor>,
    pub filter: Option<DimFilter>,
    /// Bucketing used by time-series queries.
    pub granularity: Granularity,
    pub ordering: ResultOrdering,
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_intervals(intervals: Vec<Interval>) -> Self {
        Self {
            intervals,
            ..Self::default()
        }
    }

    pub fn for_segments(segments: Vec<SegmentDescriptor>) -> Self {
        Self {
            segments,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: DimFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_ordering(mut self, ordering: ResultOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A sink restricted to the time scopes a query asked for.
pub(crate) struct ScopedSink {
    pub(crate) sink: Arc<Sink>,
    pub(crate) scopes: Vec<Interval>,
}

/// Maps a query onto sinks. `sinks` must be in identity order.
pub(crate) fn resolve(spec: &QuerySpec, sinks: &[Arc<Sink>]) -> Result<Vec<ScopedSink>> {
    let mut scoped: Vec<ScopedSink> = Vec::new();

    if !spec.segments.is_empty() {
        let mut scopes: Vec<Vec<Interval>> = vec![Vec::new(); sinks.len()];
        for descriptor in &spec.segments {
            let position = sinks
                .iter()
                .position(|sink| descriptor.addresses(sink.identity()))
                .ok_or_else(|| SinkbufError::UnknownPartition {
                    identity: format!(
                        "{}_{}_{}",
                        descriptor.interval, descriptor.version, descriptor.shard
                    ),
                })?;
            if let Some(scope) = descriptor
                .interval
                .intersect(&sinks[position].identity().interval())
            {
                scopes[position].push(scope);
            }
        }
        for (sink, scopes) in sinks.iter().zip(scopes) {
            if !scopes.is_empty() {
                scoped.push(ScopedSink {
                    sink: Arc::clone(sink),
                    scopes,
                });
            }
        }
        return Ok(scoped);
    }

    let intervals = if spec.intervals.is_empty() {
        vec![Interval::ETERNITY]
    } else {
        spec.intervals.clone()
    };
    for sink in sinks {
        let sink_interval = sink.identity().interval();
        let scopes: Vec<Interval> = intervals
            .iter()
            .filter_map(|i| i.intersect(&sink_interval))
            .collect();
        if !scopes.is_empty() {
            scoped.push(ScopedSink {
                sink: Arc::clone(sink),
                scopes,
            });
        }
    }
    Ok(scoped)
}

/// Rows of one sink: its fire-segments one after the other.
pub(crate) struct SinkStream {
    cursors: VecDeque<FireCursor>,
}

impl SinkStream {
    pub(crate) fn open(scoped: &ScopedSink, filter: Option<&Arc<CompiledFilter>>) -> Self {
        let scopes: Arc<[Interval]> = scoped.scopes.clone().into();
        let cursors = scoped
            .sink
            .fire_segments()
            .iter()
            .map(|fs| fs.cursor(Arc::clone(&scopes), filter.cloned()))
            .collect();
        Self { cursors }
    }
}

impl Iterator for SinkStream {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(cursor) = self.cursors.front_mut() {
            if let Some(item) = cursor.next() {
                return Some(item);
            }
            self.cursors.pop_front();
        }
        None
    }
}

/// One fire-segment's cursor, put in time order on first use.
struct OrderedCursor {
    cursor: FireCursor,
    descending: bool,
    ordered: bool,
}

impl OrderedCursor {
    fn next_row(&mut self) -> Option<Result<ScanRow>> {
        if !self.ordered {
            self.ordered = true;
            if let Err(e) = self.cursor.order_by_time(self.descending) {
                return Some(Err(e));
            }
        }
        self.cursor.next()
    }
}

struct HeapEntry {
    row: ScanRow,
    stream: usize,
    descending: bool,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry; ties go to the earlier stream.
        let by_time = if self.descending {
            self.row.timestamp.cmp(&other.row.timestamp)
        } else {
            other.row.timestamp.cmp(&self.row.timestamp)
        };
        by_time.then_with(|| other.stream.cmp(&self.stream))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

enum SequenceState {
    Concat(VecDeque<SinkStream>),
    Merge {
        streams: Vec<OrderedCursor>,
        heap: BinaryHeap<HeapEntry>,
        primed: bool,
    },
}

/// Lazy sequence of scan results.
pub struct RowSequence {
    state: SequenceState,
    remaining: Option<usize>,
    failed: bool,
}

impl RowSequence {
    pub(crate) fn new(streams: Vec<SinkStream>, ordering: ResultOrdering, limit: Option<usize>) -> Self {
        let state = match ordering {
            ResultOrdering::Natural => SequenceState::Concat(streams.into()),
            ResultOrdering::TimeAscending | ResultOrdering::TimeDescending => {
                let descending = ordering == ResultOrdering::TimeDescending;
                // Sinks in identity order, fire-segments in sequence order:
                // equal timestamps keep that order.
                SequenceState::Merge {
                    streams: streams
                        .into_iter()
                        .flat_map(|stream| stream.cursors)
                        .map(|cursor| OrderedCursor {
                            cursor,
                            descending,
                            ordered: false,
                        })
                        .collect(),
                    heap: BinaryHeap::new(),
                    primed: false,
                }
            }
        };
        Self {
            state,
            remaining: limit,
            failed: false,
        }
    }

    fn next_unlimited(&mut self) -> Option<Result<ScanRow>> {
        match &mut self.state {
            SequenceState::Concat(streams) => {
                while let Some(stream) = streams.front_mut() {
                    if let Some(item) = stream.next() {
                        return Some(item);
                    }
                    streams.pop_front();
                }
                None
            }
            SequenceState::Merge {
                streams,
                heap,
                primed,
            } => {
                if !*primed {
                    *primed = true;
                    for (position, stream) in streams.iter_mut().enumerate() {
                        match stream.next_row() {
                            Some(Ok(row)) => heap.push(HeapEntry {
                                row,
                                stream: position,
                                descending: stream.descending,
                            }),
                            Some(Err(e)) => return Some(Err(e)),
                            None => {}
                        }
                    }
                }

                let entry = heap.pop()?;
                let stream = &mut streams[entry.stream];
                match stream.next_row() {
                    Some(Ok(row)) => heap.push(HeapEntry {
                        row,
                        stream: entry.stream,
                        descending: stream.descending,
                    }),
                    Some(Err(e)) => return Some(Err(e)),
                    None => {}
                }
                Some(Ok(entry.row))
            }
        }
    }
}

impl Iterator for RowSequence {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == Some(0) {
            return None;
        }
        let item = self.next_unlimited()?;
        match &item {
            Ok(_) => {
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
            }
            Err(_) => self.failed = true,
        }
        Some(item)
    }
}

/// One bucket of a time-series query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesResult {
    pub timestamp: i64,
    pub values: BTreeMap<String, MetricValue>,
}

impl TimeseriesResult {
    pub fn value(&self, name: &str) -> Option<MetricValue> {
        self.values.get(name).copied()
    }
}

type Partial = BTreeMap<i64, Vec<MetricValue>>;

/// Folds the rows of one sink into per-bucket accumulators.
fn fold_stream(
    stream: SinkStream,
    aggregators: &[AggregatorSpec],
    granularity: Granularity,
) -> Result<Partial> {
    let mut partial = Partial::new();
    for row in stream {
        let row = row?;
        let bucket = partial
            .entry(granularity.truncate(row.timestamp))
            .or_insert_with(|| aggregators.iter().map(|a| a.initial()).collect());
        for (agg, acc) in aggregators.iter().zip(bucket.iter_mut()) {
            if let Some(value) = row.metric(agg.name()) {
                agg.combine(acc, value);
            }
        }
    }
    Ok(partial)
}

/// Runs a time-series query, folding each sink on the query pool and
/// combining the partial results by bucket. Empty buckets are omitted.
pub(crate) fn run_timeseries(
    pool: &WorkerPool<Job>,
    schema: &Arc<DataSchema>,
    spec: &QuerySpec,
    scoped: Vec<ScopedSink>,
) -> Result<Vec<TimeseriesResult>> {
    let filter = spec.filter.as_ref().map(|f| Arc::new(f.compile(schema)));
    let (sender, receiver) = crossbeam_channel::unbounded::<Result<Partial>>();

    let tasks = scoped.len();
    for scoped_sink in scoped {
        let stream = SinkStream::open(&scoped_sink, filter.as_ref());
        let schema = Arc::clone(schema);
        let granularity = spec.granularity;
        let sender = sender.clone();
        pool.submit(Box::new(move || {
            let partial = fold_stream(stream, schema.aggregators(), granularity);
            let _ = sender.send(partial);
        }))?;
    }
    drop(sender);

    let aggregators = schema.aggregators();
    let mut combined = Partial::new();
    for _ in 0..tasks {
        let partial = receiver.recv().map_err(|_| SinkbufError::TaskAborted {
            task: "timeseries fold".to_string(),
        })??;
        for (bucket, values) in partial {
            match combined.get_mut(&bucket) {
                Some(existing) => {
                    for ((agg, acc), value) in aggregators.iter().zip(existing.iter_mut()).zip(values)
                    {
                        agg.combine(acc, value);
                    }
                }
                None => {
                    combined.insert(bucket, values);
                }
            }
        }
    }

    let mut results: Vec<TimeseriesResult> = combined
        .into_iter()
        .map(|(timestamp, values)| TimeseriesResult {
            timestamp,
            values: aggregators
                .iter()
                .map(|a| a.name().to_string())
                .zip(values)
                .collect(),
        })
        .collect();
    if spec.ordering == ResultOrdering::TimeDescending {
        results.reverse();
    }
    if let Some(limit) = spec.limit {
        results.truncate(limit);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_row(timestamp: i64) -> ScanRow {
        ScanRow {
            timestamp,
            dimensions: vec![("dim".to_string(), Some("x".to_string()))],
            metrics: vec![("count".to_string(), MetricValue::Long(1))],
        }
    }

    #[test]
    fn test_scan_row_accessors() {
        let row = scan_row(5);
        assert_eq!(row.dimension("dim"), Some("x"));
        assert_eq!(row.dimension("other"), None);
        assert_eq!(row.metric("count"), Some(MetricValue::Long(1)));
        assert_eq!(row.columns(), vec!["__time", "dim", "count"]);
    }

    #[test]
    fn test_heap_orders_ascending_with_stream_tiebreak() {
        let mut heap = BinaryHeap::new();
        for (ts, stream) in [(5, 1), (3, 0), (5, 0), (1, 2)] {
            heap.push(HeapEntry {
                row: scan_row(ts),
                stream,
                descending: false,
            });
        }
        let order: Vec<(i64, usize)> = std::iter::from_fn(|| heap.pop())
            .map(|e| (e.row.timestamp, e.stream))
            .collect();
        assert_eq!(order, vec![(1, 2), (3, 0), (5, 0), (5, 1)]);
    }

    #[test]
    fn test_heap_orders_descending() {
        let mut heap = BinaryHeap::new();
        for (ts, stream) in [(1, 0), (9, 1), (4, 2)] {
            heap.push(HeapEntry {
                row: scan_row(ts),
                stream,
                descending: true,
            });
        }
        let order: Vec<i64> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.row.timestamp)
            .collect();
        assert_eq!(order, vec![9, 4, 1]);
    }

    #[test]
    fn test_query_spec_builders() {
        let interval: Interval = "2000/2001".parse().unwrap();
        let spec = QuerySpec::for_intervals(vec![interval])
            .with_granularity(Granularity::Day)
            .with_ordering(ResultOrdering::TimeDescending)
            .with_limit(3);
        assert_eq!(spec.intervals, vec![interval]);
        assert_eq!(spec.granularity, Granularity::Day);
        assert_eq!(spec.limit, Some(3));
        assert!(spec.segments.is_empty());
    }
}
