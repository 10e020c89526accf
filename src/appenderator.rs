//! The ingestion API.
//!
//! An [`Appenderator`] routes rows to per-identity sinks, persists them when
//! memory limits are reached, answers queries over everything it holds and
//! hands merged segments to deep storage.
//!
//! Persists are requested by an add and carried out at the start of the next
//! add (or by `persist_all`/`push`), before that add's row is indexed. The
//! swap of the current fire-segments and the memory accounting happen on the
//! caller's thread; sealing, commit and push I/O run on a single persist
//! thread in submission order.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::chunk::{PersistedChunk, sync_dir};
use crate::committer::{Committer, CommitterSupplier};
use crate::concurrency::{Handle, Job, WorkerPool, handle};
use crate::fire::FireSegment;
use crate::governor::{Governor, PersistLimits, SwapEstimate};
use crate::identity::PartitionIdentity;
use crate::ledger::{Committed, Ledger, recover_sinks};
use crate::meters::{MeterSnapshot, RowIngestionMeters};
use crate::pusher::{DataSegment, SegmentPusher, read_descriptor, write_descriptor};
use crate::query::{QuerySpec, RowSequence, SinkStream, TimeseriesResult, resolve, run_timeseries};
use crate::schema::DataSchema;
use crate::sink::{AddOutcome, Sink, SinkAdd, SinkConfig};
use crate::{InputRow, Result, SinkbufError};

/// Result of [`Appenderator::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddResult {
    /// Rows held for the identity, in memory and on disk.
    pub num_rows_in_segment: usize,
    /// A persist will run before the next row is indexed.
    pub persist_scheduled: bool,
    /// Limits were reached but incremental persists were disallowed; the
    /// caller should persist.
    pub persist_required: bool,
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentsAndCommitMetadata {
    pub segments: Vec<DataSegment>,
    pub commit_metadata: Option<Value>,
}

/// Buffers rows for one data source and manages their segments.
pub trait Appenderator: Send + Sync {
    fn data_source(&self) -> &str;

    /// Recovers persisted state and returns the last committed metadata.
    /// Must be called before rows are added.
    fn start_job(&self) -> Result<Option<Value>>;

    /// Adds a row to the partition `identity`.
    fn add(
        &self,
        identity: &PartitionIdentity,
        row: &InputRow,
        committer_supplier: &dyn CommitterSupplier,
        allow_incremental_persist: bool,
    ) -> Result<AddResult>;

    /// Persists everything in memory. The handle yields the committed metadata.
    fn persist_all(&self, committer: Option<Committer>) -> Result<Handle<Option<Value>>>;

    /// Persists, merges and pushes the given partitions. They accept no more
    /// rows afterwards.
    fn push(
        &self,
        identities: &[PartitionIdentity],
        committer: Option<Committer>,
        use_unique_path: bool,
    ) -> Result<Handle<SegmentsAndCommitMetadata>>;

    /// [`Appenderator::push`], waiting at most the configured push timeout.
    fn push_and_wait(
        &self,
        identities: &[PartitionIdentity],
        committer: Option<Committer>,
        use_unique_path: bool,
    ) -> Result<SegmentsAndCommitMetadata>;

    /// Forgets a partition and deletes its data. Fails while a persist or
    /// push of the partition is in flight. The identity can be reused as
    /// soon as this returns; the handle resolves once the old data is gone.
    fn drop_sink(&self, identity: &PartitionIdentity) -> Result<Handle<()>>;

    /// Drops every partition and the commit record.
    fn clear(&self) -> Result<()>;

    /// Stops the worker threads once queued background work has run, then
    /// releases memory. Data on disk is kept; rows not yet persisted are lost.
    fn close(&self) -> Result<()>;

    /// Identities of all open partitions, in identity order.
    fn segments(&self) -> Vec<PartitionIdentity>;

    fn row_count(&self, identity: &PartitionIdentity) -> Result<usize>;

    fn total_row_count(&self) -> usize;

    /// Rows held in memory across all partitions.
    fn rows_in_memory(&self) -> usize;

    /// Estimated bytes held in memory, including fixed overheads.
    fn bytes_currently_in_memory(&self) -> usize;

    /// Estimated bytes of the partition's current fire-segment.
    fn bytes_in_memory(&self, identity: &PartitionIdentity) -> Result<usize>;

    fn persist_count(&self) -> u64;

    fn meters(&self) -> MeterSnapshot;

    /// Row meters of one identity's sink.
    fn meters_for(&self, identity: &PartitionIdentity) -> Result<MeterSnapshot>;

    fn scan(&self, spec: &QuerySpec) -> Result<RowSequence>;

    fn timeseries(&self, spec: &QuerySpec) -> Result<Vec<TimeseriesResult>>;
}

/// Builder for an [`Appenderator`].
pub struct AppenderatorBuilder {
    base_dir: Option<PathBuf>,
    schema: Option<DataSchema>,
    pusher: Option<Arc<dyn SegmentPusher>>,
    max_rows_in_memory: usize,
    max_bytes_in_memory: Option<usize>,
    skip_overhead_check: bool,
    intermediate_persist_period: Duration,
    max_pending_persists: usize,
    strict: bool,
    max_parse_exceptions: u64,
    query_threads: usize,
    push_timeout: Option<Duration>,
}

impl Default for AppenderatorBuilder {
    fn default() -> Self {
        Self {
            base_dir: None,
            schema: None,
            pusher: None,
            max_rows_in_memory: 1_000_000,
            max_bytes_in_memory: None,
            skip_overhead_check: false,
            intermediate_persist_period: Duration::from_secs(600), // 10 minutes
            max_pending_persists: 1,
            strict: false,
            max_parse_exceptions: u64::MAX,
            query_threads: crate::cgroup::default_query_threads(),
            push_timeout: None,
        }
    }
}

impl AppenderatorBuilder {
    /// Creates a new AppenderatorBuilder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory holding sinks and the commit record.
    pub fn with_base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_schema(mut self, schema: DataSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Sets the deep storage receiving pushed segments.
    pub fn with_pusher(mut self, pusher: Arc<dyn SegmentPusher>) -> Self {
        self.pusher = Some(pusher);
        self
    }

    /// Sets the row bound, per partition and across partitions.
    pub fn with_max_rows_in_memory(mut self, rows: usize) -> Self {
        self.max_rows_in_memory = rows;
        self
    }

    /// Sets the byte bound. `None` leaves memory unbounded.
    pub fn with_max_bytes_in_memory(mut self, bytes: Option<usize>) -> Self {
        self.max_bytes_in_memory = bytes;
        self
    }

    /// Disables counting and enforcement of fixed memory overheads.
    pub fn with_skip_overhead_check(mut self, skip: bool) -> Self {
        self.skip_overhead_check = skip;
        self
    }

    pub fn with_intermediate_persist_period(mut self, period: Duration) -> Self {
        self.intermediate_persist_period = period;
        self
    }

    /// Sets how many persists may queue before submission blocks.
    pub fn with_max_pending_persists(mut self, pending: usize) -> Self {
        self.max_pending_persists = pending;
        self
    }

    /// Rejects rows with unparseable dimension values instead of nulling them.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_max_parse_exceptions(mut self, max: u64) -> Self {
        self.max_parse_exceptions = max;
        self
    }

    pub fn with_query_threads(mut self, threads: usize) -> Self {
        self.query_threads = threads;
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = Some(timeout);
        self
    }

    /// Builds the Appenderator instance.
    pub fn build(self) -> Result<Arc<dyn Appenderator>> {
        Ok(self.build_impl()?)
    }

    pub(crate) fn build_impl(self) -> Result<Arc<AppenderatorImpl>> {
        let base_dir = self
            .base_dir
            .ok_or_else(|| SinkbufError::InvalidConfiguration("base directory is required".into()))?;
        let schema = self
            .schema
            .ok_or_else(|| SinkbufError::InvalidConfiguration("schema is required".into()))?;
        schema.validate()?;
        let pusher = self
            .pusher
            .ok_or_else(|| SinkbufError::InvalidConfiguration("segment pusher is required".into()))?;

        if self.max_rows_in_memory == 0 {
            return Err(SinkbufError::InvalidConfiguration(
                "max rows in memory must be positive".into(),
            ));
        }
        if self.max_bytes_in_memory == Some(0) {
            return Err(SinkbufError::InvalidConfiguration(
                "max bytes in memory must be positive".into(),
            ));
        }
        if self.max_pending_persists == 0 {
            return Err(SinkbufError::InvalidConfiguration(
                "max pending persists must be positive".into(),
            ));
        }
        if self.query_threads == 0 {
            return Err(SinkbufError::InvalidConfiguration(
                "query threads must be positive".into(),
            ));
        }

        let limits = PersistLimits {
            max_rows_in_memory: self.max_rows_in_memory,
            max_bytes_in_memory: self.max_bytes_in_memory,
            skip_overhead_check: self.skip_overhead_check,
            intermediate_persist_period: self.intermediate_persist_period,
        };
        let sink_config = SinkConfig {
            strict: self.strict,
            max_rows_in_memory: self.max_rows_in_memory,
            max_bytes_in_memory: self.max_bytes_in_memory,
        };

        info!(
            "Building appenderator for '{}' at {:?} ({} query threads)",
            schema.data_source(),
            base_dir,
            self.query_threads
        );

        Ok(Arc::new(AppenderatorImpl {
            schema: Arc::new(schema),
            ledger: Arc::new(Ledger::new(&base_dir)),
            base_dir,
            pusher,
            sink_config,
            governor: Arc::new(Governor::new(limits)),
            sinks: Arc::new(DashMap::new()),
            sink_creation_lock: Mutex::new(()),
            persist_lock: Mutex::new(()),
            persist_pool: WorkerPool::for_jobs("sinkbuf-persist", 1, self.max_pending_persists),
            query_pool: WorkerPool::for_jobs(
                "sinkbuf-query",
                self.query_threads,
                self.query_threads * 2,
            ),
            persist_error: Arc::new(Mutex::new(None)),
            meters: RowIngestionMeters::new(),
            max_parse_exceptions: self.max_parse_exceptions,
            push_timeout: self.push_timeout,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

type SinkMap = DashMap<PartitionIdentity, Arc<Sink>>;

/// Separates a dropped sink's directory name from its random suffix.
const TOMBSTONE_MARKER: &str = ".dropped-";

pub(crate) struct AppenderatorImpl {
    schema: Arc<DataSchema>,
    base_dir: PathBuf,
    pusher: Arc<dyn SegmentPusher>,
    sink_config: SinkConfig,
    governor: Arc<Governor>,
    ledger: Arc<Ledger>,
    sinks: Arc<SinkMap>,
    sink_creation_lock: Mutex<()>,
    persist_lock: Mutex<()>,
    persist_pool: WorkerPool<Job>,
    query_pool: WorkerPool<Job>,
    persist_error: Arc<Mutex<Option<String>>>,
    meters: RowIngestionMeters,
    max_parse_exceptions: u64,
    push_timeout: Option<Duration>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl AppenderatorImpl {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkbufError::Closed);
        }
        Ok(())
    }

    fn ensure_started(&self, operation: &'static str) -> Result<()> {
        self.ensure_open()?;
        if !self.started.load(Ordering::Acquire) {
            return Err(SinkbufError::NotStarted { operation });
        }
        Ok(())
    }

    fn sink(&self, identity: &PartitionIdentity) -> Result<Arc<Sink>> {
        self.sinks
            .get(identity)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SinkbufError::UnknownPartition {
                identity: identity.to_string(),
            })
    }

    fn sorted_sinks(&self) -> Vec<Arc<Sink>> {
        let mut sinks: Vec<Arc<Sink>> = self
            .sinks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sinks.sort_by(|a, b| a.identity().cmp(b.identity()));
        sinks
    }

    fn get_or_create_sink(&self, identity: &PartitionIdentity) -> Result<Arc<Sink>> {
        if let Some(sink) = self.sinks.get(identity) {
            return Ok(Arc::clone(sink.value()));
        }

        let _guard = self.sink_creation_lock.lock();
        if let Some(sink) = self.sinks.get(identity) {
            return Ok(Arc::clone(sink.value()));
        }

        let sink = Arc::new(Sink::create(
            identity.clone(),
            Arc::clone(&self.schema),
            &self.base_dir,
            self.sink_config,
        )?);
        self.governor.sink_opened();
        self.sinks.insert(identity.clone(), Arc::clone(&sink));
        Ok(sink)
    }

    fn record_meters(&self, added: &SinkAdd) -> Result<()> {
        match (added.outcome, &added.parse_error) {
            (AddOutcome::ThrownAway, _) => self.meters.increment_thrown_away(),
            (AddOutcome::Rejected, _) => self.meters.increment_unparseable(),
            (_, Some(_)) => self.meters.increment_processed_with_error(),
            (_, None) => self.meters.increment_processed(),
        }
        if let Some(e) = &added.parse_error {
            debug!("Row ingested with parse error: {}", e);
        }

        let count = self.meters.parse_exceptions();
        if count > self.max_parse_exceptions {
            return Err(SinkbufError::TooManyParseExceptions {
                count,
                max: self.max_parse_exceptions,
            });
        }
        Ok(())
    }

    /// What swapping out every current fire-segment would free.
    fn swap_estimate(&self) -> SwapEstimate {
        let mut estimate = SwapEstimate::default();
        for entry in self.sinks.iter() {
            let sink = entry.value();
            if sink.swappable() {
                estimate.add(sink.bytes_in_memory(), sink.current_mapped_overhead());
            }
        }
        estimate
    }

    /// Swaps every sink's current fire-segment and queues the batch for
    /// sealing and commit.
    fn persist_internal(&self, committer: Option<Committer>) -> Result<Handle<Option<Value>>> {
        let _guard = self.persist_lock.lock();

        let mut batch = Vec::new();
        let mut rows = 0;
        let mut estimate = SwapEstimate::default();
        for sink in self.sorted_sinks() {
            if let Some(fs) = sink.swap() {
                rows += fs.rows();
                estimate.add(fs.bytes_in_memory(), fs.mapped_overhead());
                sink.persist_started();
                batch.push((sink, fs));
            }
        }
        self.governor.record_swap(rows, estimate);
        self.governor.persist_started();
        info!(
            "Persisting {} fire-segments ({} rows, {} bytes)",
            batch.len(),
            rows,
            estimate.bytes_in_memory
        );

        let swapped: Vec<Arc<Sink>> = batch.iter().map(|(sink, _)| Arc::clone(sink)).collect();
        let job = PersistJob {
            batch,
            committer,
            ledger: Arc::clone(&self.ledger),
            sinks: Arc::clone(&self.sinks),
            governor: Arc::clone(&self.governor),
            persist_error: Arc::clone(&self.persist_error),
        };
        let (completer, handle) = handle("persist");
        let submitted = self.persist_pool.submit(Box::new(move || {
            completer.complete(job.run());
        }));
        if let Err(e) = submitted {
            // The job was dropped unrun; nothing else will release its counters.
            self.governor.persist_finished();
            for sink in swapped {
                sink.persist_finished();
            }
            return Err(e);
        }
        Ok(handle)
    }

    /// Combines an explicit committer with one captured by an earlier add.
    fn with_pending(&self, committer: Option<Committer>) -> Option<Committer> {
        match (committer, self.governor.take_pending()) {
            (Some(committer), Some(pending)) => Some(committer.absorb(pending)),
            (committer, pending) => committer.or(pending),
        }
    }

    fn release_sink(&self, sink: &Sink) {
        self.governor
            .sink_released(sink.rows_in_memory(), sink.bytes_in_memory(), sink.mapped_bytes());
    }

    /// Renames a sink's directory to a tombstone that no commit record
    /// names. Recovery deletes tombstones left behind by a crash.
    fn bury(&self, sink: &Sink) -> Result<Option<PathBuf>> {
        let tombstone = self.base_dir.join(format!(
            "{}{}{}",
            sink.identity().dir_name(),
            TOMBSTONE_MARKER,
            Uuid::new_v4().simple()
        ));
        match fs::rename(sink.dir(), &tombstone) {
            Ok(()) => {
                sync_dir(&self.base_dir)?;
                debug!("Moved {:?} to {:?}", sink.dir(), tombstone);
                Ok(Some(tombstone))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SinkbufError::io_at(sink.dir(), e)),
        }
    }

    fn restore_sinks(&self, committed: Option<&Committed>) -> Result<()> {
        for recovered in recover_sinks(&self.base_dir, committed)? {
            let mut segments = Vec::with_capacity(recovered.chunks.len());
            for (sequence, dir) in &recovered.chunks {
                segments.push(FireSegment::restore(*sequence, PersistedChunk::open(dir)?));
            }

            self.governor.sink_opened();
            for fs in &segments {
                self.governor.segment_restored(fs.mapped_overhead());
            }
            let sink = Sink::restore(
                recovered.identity.clone(),
                Arc::clone(&self.schema),
                recovered.dir,
                self.sink_config,
                segments,
            );
            self.sinks.insert(recovered.identity, Arc::new(sink));
        }
        Ok(())
    }
}

/// Seals one persist batch and records it in the commit record.
struct PersistJob {
    batch: Vec<(Arc<Sink>, Arc<FireSegment>)>,
    committer: Option<Committer>,
    ledger: Arc<Ledger>,
    sinks: Arc<SinkMap>,
    governor: Arc<Governor>,
    persist_error: Arc<Mutex<Option<String>>>,
}

impl PersistJob {
    #[instrument(skip(self), fields(fire_segments = self.batch.len()))]
    fn run(self) -> Result<Option<Value>> {
        let result = self.seal_and_commit();
        for (sink, _) in &self.batch {
            sink.persist_finished();
        }
        self.governor.persist_finished();

        match result {
            Ok(metadata) => {
                if let Some(committer) = self.committer {
                    committer.notify();
                }
                Ok(metadata)
            }
            Err(e) => {
                error!("Persist failed: {}", e);
                *self.persist_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn seal_and_commit(&self) -> Result<Option<Value>> {
        for (sink, fs) in &self.batch {
            let result = fs.seal(&sink.segment_dir(fs.sequence()))?;
            debug!(
                "Persisted fire-segment {} of {} ({} bytes freed)",
                fs.sequence(),
                sink.identity(),
                result.freed_bytes
            );
        }

        let metadata = match &self.committer {
            Some(committer) => committer.metadata().clone(),
            None => self
                .ledger
                .read()?
                .map(|committed| committed.metadata().clone())
                .unwrap_or(Value::Null),
        };
        self.ledger.commit_with(|| {
            let hydrants: BTreeMap<String, u32> = self
                .sinks
                .iter()
                .filter(|entry| !entry.value().is_dropped())
                .filter_map(|entry| {
                    let count = entry.value().persisted_count();
                    (count > 0).then(|| (entry.key().dir_name(), count as u32))
                })
                .collect();
            Committed::new(hydrants, metadata.clone())
        })?;

        Ok(Some(metadata).filter(|m| !m.is_null()))
    }
}

impl Appenderator for AppenderatorImpl {
    fn data_source(&self) -> &str {
        self.schema.data_source()
    }

    fn start_job(&self) -> Result<Option<Value>> {
        self.ensure_open()?;
        fs::create_dir_all(&self.base_dir).map_err(|e| SinkbufError::io_at(&self.base_dir, e))?;

        self.governor.reset();
        self.sinks.clear();
        *self.persist_error.lock() = None;

        let committed = self.ledger.read()?;
        self.restore_sinks(committed.as_ref())?;
        self.started.store(true, Ordering::Release);

        let token = committed
            .map(|c| c.metadata().clone())
            .filter(|metadata| !metadata.is_null());
        info!(
            "Started job for '{}' with {} recovered sinks, last commit {:?}",
            self.data_source(),
            self.sinks.len(),
            token
        );
        Ok(token)
    }

    fn add(
        &self,
        identity: &PartitionIdentity,
        row: &InputRow,
        committer_supplier: &dyn CommitterSupplier,
        allow_incremental_persist: bool,
    ) -> Result<AddResult> {
        self.ensure_started("add")?;
        if identity.data_source() != self.data_source() {
            return Err(SinkbufError::DataSourceMismatch {
                expected: self.data_source().to_string(),
                actual: identity.data_source().to_string(),
            });
        }
        if let Some(message) = self.persist_error.lock().clone() {
            return Err(SinkbufError::PersistFailed(message));
        }

        if let Some(pending) = self.governor.take_pending() {
            self.persist_internal(Some(pending))?;
        }

        let sink = self.get_or_create_sink(identity)?;
        let added = sink.add(row)?;
        // The row is indexed even when the parse-exception limit is hit.
        self.governor.record_add(added.rows_added, added.bytes_delta);
        self.record_meters(&added)?;

        let mut result = AddResult {
            num_rows_in_segment: added.rows_in_sink,
            persist_scheduled: false,
            persist_required: false,
        };
        if let Some(reason) = self.governor.persist_reason(added.can_append) {
            if allow_incremental_persist {
                self.governor.check_overhead(self.swap_estimate())?;
                self.governor.set_pending(committer_supplier.get());
                result.persist_scheduled = true;
                debug!("Persist scheduled after add to {}: {:?}", identity, reason);
            } else {
                result.persist_required = true;
            }
        }
        Ok(result)
    }

    fn persist_all(&self, committer: Option<Committer>) -> Result<Handle<Option<Value>>> {
        self.ensure_started("persist_all")?;
        let committer = self.with_pending(committer);
        self.persist_internal(committer)
    }

    fn push(
        &self,
        identities: &[PartitionIdentity],
        committer: Option<Committer>,
        use_unique_path: bool,
    ) -> Result<Handle<SegmentsAndCommitMetadata>> {
        self.ensure_started("push")?;
        let sinks = identities
            .iter()
            .map(|identity| self.sink(identity))
            .collect::<Result<Vec<_>>>()?;
        claim_for_push(&sinks)?;
        for sink in &sinks {
            sink.finish_writing();
        }

        let persisted = match self.persist_all(committer) {
            Ok(persisted) => persisted,
            Err(e) => {
                release_push(&sinks);
                return Err(e);
            }
        };
        let pusher = Arc::clone(&self.pusher);
        let (completer, pushed) = handle("push");
        let pushing = sinks.clone();
        let submitted = self.persist_pool.submit(Box::new(move || {
            let result = push_sinks(persisted, &pushing, pusher.as_ref(), use_unique_path);
            release_push(&pushing);
            completer.complete(result);
        }));
        if let Err(e) = submitted {
            release_push(&sinks);
            return Err(e);
        }
        Ok(pushed)
    }

    fn push_and_wait(
        &self,
        identities: &[PartitionIdentity],
        committer: Option<Committer>,
        use_unique_path: bool,
    ) -> Result<SegmentsAndCommitMetadata> {
        let pushed = self.push(identities, committer, use_unique_path)?;
        match self.push_timeout {
            Some(timeout) => pushed.wait_timeout(timeout),
            None => pushed.wait(),
        }
    }

    fn drop_sink(&self, identity: &PartitionIdentity) -> Result<Handle<()>> {
        self.ensure_open()?;
        let _guard = self.persist_lock.lock();
        let sink = self.sink(identity)?;

        sink.set_dropped(true);
        if sink.has_persist_in_flight() {
            sink.set_dropped(false);
            return Err(SinkbufError::PersistInFlight {
                identity: identity.to_string(),
            });
        }
        let tombstone = match self.bury(&sink) {
            Ok(tombstone) => tombstone,
            Err(e) => {
                sink.set_dropped(false);
                return Err(e);
            }
        };

        // The identity stays mapped until its directory and commit entry are
        // gone, so a new sink for it starts from nothing.
        sink.finish_writing();
        self.ledger.remove_sink(&identity.dir_name())?;
        self.sinks.remove(identity);
        self.release_sink(&sink);
        info!("Dropping sink {}", identity);

        let (completer, dropped) = handle("drop");
        self.persist_pool.submit(Box::new(move || {
            let result = match tombstone {
                Some(dir) => fs::remove_dir_all(&dir).map_err(|e| SinkbufError::io_at(&dir, e)),
                None => Ok(()),
            };
            completer.complete(result);
        }))?;
        Ok(dropped)
    }

    fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        drop(self.governor.take_pending());
        self.persist_pool.wait_idle();

        for sink in self.sorted_sinks() {
            self.sinks.remove(sink.identity());
            self.release_sink(&sink);
            if let Err(e) = fs::remove_dir_all(sink.dir())
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(SinkbufError::io_at(sink.dir(), e));
            }
        }
        self.ledger.clear()?;
        info!("Cleared all sinks of '{}'", self.data_source());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.governor.take_pending().is_some() {
            warn!("Closing with a scheduled persist; unpersisted rows are discarded");
        }
        self.persist_pool.shutdown();
        self.query_pool.shutdown();
        self.sinks.clear();
        self.governor.reset();
        info!("Closed appenderator for '{}'", self.data_source());
        Ok(())
    }

    fn segments(&self) -> Vec<PartitionIdentity> {
        self.sorted_sinks()
            .iter()
            .map(|sink| sink.identity().clone())
            .collect()
    }

    fn row_count(&self, identity: &PartitionIdentity) -> Result<usize> {
        Ok(self.sink(identity)?.num_rows())
    }

    fn total_row_count(&self) -> usize {
        self.sinks.iter().map(|entry| entry.value().num_rows()).sum()
    }

    fn rows_in_memory(&self) -> usize {
        self.governor.state().rows()
    }

    fn bytes_currently_in_memory(&self) -> usize {
        self.governor.state().bytes()
    }

    fn bytes_in_memory(&self, identity: &PartitionIdentity) -> Result<usize> {
        Ok(self.sink(identity)?.bytes_in_memory())
    }

    fn persist_count(&self) -> u64 {
        self.governor.state().persists()
    }

    fn meters(&self) -> MeterSnapshot {
        self.meters.snapshot()
    }

    fn meters_for(&self, identity: &PartitionIdentity) -> Result<MeterSnapshot> {
        Ok(self.sink(identity)?.meters().snapshot())
    }

    fn scan(&self, spec: &QuerySpec) -> Result<RowSequence> {
        self.ensure_open()?;
        let scoped = resolve(spec, &self.sorted_sinks())?;
        let filter = spec.filter.as_ref().map(|f| Arc::new(f.compile(&self.schema)));
        let streams = scoped
            .iter()
            .map(|s| SinkStream::open(s, filter.as_ref()))
            .collect();
        Ok(RowSequence::new(streams, spec.ordering, spec.limit))
    }

    fn timeseries(&self, spec: &QuerySpec) -> Result<Vec<TimeseriesResult>> {
        self.ensure_open()?;
        let scoped = resolve(spec, &self.sorted_sinks())?;
        run_timeseries(&self.query_pool, &self.schema, spec, scoped)
    }
}

/// Marks `sinks` busy for the duration of a push, failing if one of them is
/// being dropped.
fn claim_for_push(sinks: &[Arc<Sink>]) -> Result<()> {
    for (claimed, sink) in sinks.iter().enumerate() {
        sink.persist_started();
        if sink.is_dropped() {
            release_push(&sinks[..=claimed]);
            return Err(SinkbufError::UnknownPartition {
                identity: sink.identity().to_string(),
            });
        }
    }
    Ok(())
}

fn release_push(sinks: &[Arc<Sink>]) {
    for sink in sinks {
        sink.persist_finished();
    }
}

/// Merges and pushes `sinks` once the preceding persist has completed.
fn push_sinks(
    persisted: Handle<Option<Value>>,
    sinks: &[Arc<Sink>],
    pusher: &dyn SegmentPusher,
    use_unique_path: bool,
) -> Result<SegmentsAndCommitMetadata> {
    let commit_metadata = persisted.wait()?;

    let mut segments = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let merged_dir = sink.merged_dir();
        if !use_unique_path && let Some(segment) = read_descriptor(&merged_dir)? {
            debug!("{} already pushed to {:?}", sink.identity(), segment.load_path);
            segments.push(segment);
            continue;
        }

        let chunk = sink.merge(&merged_dir)?;
        let segment = pusher
            .push(
                &merged_dir,
                DataSegment::from_chunk(sink.identity().clone(), &chunk),
                use_unique_path,
            )
            .map_err(|e| match e {
                e @ SinkbufError::Push { .. } => e,
                other => SinkbufError::Push {
                    identity: sink.identity().to_string(),
                    details: other.to_string(),
                },
            })?;
        write_descriptor(&merged_dir, &segment)?;
        segments.push(segment);
    }

    info!("Pushed {} segments", segments.len());
    Ok(SegmentsAndCommitMetadata {
        segments,
        commit_metadata,
    })
}
