//! Aggregate memory accounting and persist triggering.
//!
//! The governor owns the process-wide row and byte counters shared by every
//! sink. It does not perform persists itself; it tells the appenderator when
//! one is required and whether running it would bring memory back under the
//! configured cap.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::committer::Committer;
use crate::{Result, SinkbufError};

/// Bookkeeping held for every open sink.
pub const OVERHEAD_PER_SINK: usize = 5000;
/// Fixed cost of a memory-mapped fire-segment.
pub const OVERHEAD_PER_FIRE_SEGMENT: usize = 1000;
pub const OVERHEAD_PER_TIME_COLUMN: usize = 1000;
pub const OVERHEAD_PER_DIMENSION_COLUMN: usize = 1000;
pub const OVERHEAD_PER_METRIC_COLUMN: usize = 700;

/// Memory still held by a fire-segment after it has been persisted and
/// mapped back.
pub fn mapped_overhead(dimensions: usize, metrics: usize) -> usize {
    OVERHEAD_PER_FIRE_SEGMENT
        + OVERHEAD_PER_TIME_COLUMN
        + dimensions * OVERHEAD_PER_DIMENSION_COLUMN
        + metrics * OVERHEAD_PER_METRIC_COLUMN
}

/// Thresholds that decide when in-memory data must be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistLimits {
    /// `usize::MAX` disables the row bound.
    pub max_rows_in_memory: usize,
    /// `None` disables the byte bound.
    pub max_bytes_in_memory: Option<usize>,
    /// When set, fixed overheads are neither counted nor enforced.
    pub skip_overhead_check: bool,
    pub intermediate_persist_period: Duration,
}

impl Default for PersistLimits {
    fn default() -> Self {
        Self {
            max_rows_in_memory: 1_000_000,
            max_bytes_in_memory: None,
            skip_overhead_check: false,
            intermediate_persist_period: Duration::from_secs(600),
        }
    }
}

/// Process-wide counters. Never negative: subtraction saturates at zero.
#[derive(Debug, Default)]
pub struct MemoryState {
    rows: AtomicUsize,
    bytes: AtomicUsize,
    persists: AtomicU64,
}

impl MemoryState {
    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::Acquire)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn persists(&self) -> u64 {
        self.persists.load(Ordering::Acquire)
    }

    fn add_rows(&self, rows: usize) {
        self.rows.fetch_add(rows, Ordering::AcqRel);
    }

    fn sub_rows(&self, rows: usize) {
        saturating_sub(&self.rows, rows);
    }

    fn add_bytes(&self, bytes: usize) {
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    fn sub_bytes(&self, bytes: usize) {
        saturating_sub(&self.bytes, bytes);
    }

    fn reset(&self) {
        self.rows.store(0, Ordering::Release);
        self.bytes.store(0, Ordering::Release);
        self.persists.store(0, Ordering::Release);
    }
}

fn saturating_sub(counter: &AtomicUsize, amount: usize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(amount))
    });
}

/// Whether a persist batch is currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistPhase {
    Idle,
    PersistInFlight,
}

/// Why a persist was requested after an add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistReason {
    SinkFull,
    MaxRows,
    MaxBytes,
    PeriodElapsed,
}

/// What a persist of the current fire-segments would free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapEstimate {
    /// Estimated bytes of the fire-segments that would be swapped out.
    pub bytes_in_memory: usize,
    /// Mapped overhead they would keep once persisted.
    pub mapped_overhead: usize,
}

impl SwapEstimate {
    pub fn add(&mut self, bytes_in_memory: usize, mapped_overhead: usize) {
        self.bytes_in_memory += bytes_in_memory;
        self.mapped_overhead += mapped_overhead;
    }
}

pub struct Governor {
    limits: PersistLimits,
    state: MemoryState,
    in_flight: AtomicUsize,
    last_persist: Mutex<Instant>,
    pending: Mutex<Option<Committer>>,
}

impl Governor {
    pub fn new(limits: PersistLimits) -> Self {
        Self {
            limits,
            state: MemoryState::default(),
            in_flight: AtomicUsize::new(0),
            last_persist: Mutex::new(Instant::now()),
            pending: Mutex::new(None),
        }
    }

    pub fn limits(&self) -> &PersistLimits {
        &self.limits
    }

    pub fn state(&self) -> &MemoryState {
        &self.state
    }

    pub fn phase(&self) -> PersistPhase {
        if self.in_flight.load(Ordering::Acquire) > 0 {
            PersistPhase::PersistInFlight
        } else {
            PersistPhase::Idle
        }
    }

    /// Clears all counters and any pending persist.
    pub fn reset(&self) {
        self.state.reset();
        *self.pending.lock() = None;
        *self.last_persist.lock() = Instant::now();
    }

    pub fn sink_opened(&self) {
        if !self.limits.skip_overhead_check {
            self.state.add_bytes(OVERHEAD_PER_SINK);
        }
    }

    /// Forgets a sink and everything it still held in memory.
    pub fn sink_released(&self, rows_in_memory: usize, bytes_in_memory: usize, mapped_bytes: usize) {
        self.state.sub_rows(rows_in_memory);
        self.state.sub_bytes(bytes_in_memory);
        if !self.limits.skip_overhead_check {
            self.state.sub_bytes(OVERHEAD_PER_SINK + mapped_bytes);
        }
    }

    /// Registers a fire-segment restored from disk.
    pub fn segment_restored(&self, mapped_overhead: usize) {
        if !self.limits.skip_overhead_check {
            self.state.add_bytes(mapped_overhead);
        }
    }

    /// Accounts for rows and bytes added by one ingest.
    pub fn record_add(&self, rows_added: usize, bytes_delta: usize) {
        self.state.add_rows(rows_added);
        self.state.add_bytes(bytes_delta);
    }

    /// Decides whether the add that just happened requires a persist.
    pub fn persist_reason(&self, sink_can_append: bool) -> Option<PersistReason> {
        if !sink_can_append {
            return Some(PersistReason::SinkFull);
        }
        if self.state.rows() >= self.limits.max_rows_in_memory {
            return Some(PersistReason::MaxRows);
        }
        if let Some(max) = self.limits.max_bytes_in_memory
            && self.state.bytes() >= max
        {
            return Some(PersistReason::MaxBytes);
        }
        if self.last_persist.lock().elapsed() >= self.limits.intermediate_persist_period {
            return Some(PersistReason::PeriodElapsed);
        }
        None
    }

    /// Fails when persisting `estimate` would still leave memory above the cap.
    pub fn check_overhead(&self, estimate: SwapEstimate) -> Result<()> {
        if self.limits.skip_overhead_check {
            return Ok(());
        }
        let Some(max) = self.limits.max_bytes_in_memory else {
            return Ok(());
        };

        let remaining = self
            .state
            .bytes()
            .saturating_sub(estimate.bytes_in_memory)
            .saturating_add(estimate.mapped_overhead);
        if remaining > max {
            warn!(
                "Persist would leave {} bytes in memory, above the {} byte limit",
                remaining, max
            );
            return Err(SinkbufError::PersistCannotFreeMemory { remaining, max });
        }
        Ok(())
    }

    /// Applies the accounting of a swap: swapped rows and bytes leave memory
    /// and the mapped overhead of the new persisted fire-segments arrives.
    pub fn record_swap(&self, rows: usize, estimate: SwapEstimate) {
        self.state.sub_rows(rows);
        self.state.sub_bytes(estimate.bytes_in_memory);
        if !self.limits.skip_overhead_check {
            self.state.add_bytes(estimate.mapped_overhead);
        }
        *self.last_persist.lock() = Instant::now();
        debug!(
            "Swapped {} rows / {} bytes out of memory; {} rows / {} bytes remain",
            rows,
            estimate.bytes_in_memory,
            self.state.rows(),
            self.state.bytes()
        );
    }

    pub fn persist_started(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.state.persists.fetch_add(1, Ordering::AcqRel);
    }

    pub fn persist_finished(&self) {
        saturating_sub(&self.in_flight, 1);
    }

    /// Remembers that a persist must run before the next row is indexed.
    /// A later request supersedes the metadata of an earlier one; both
    /// durability callbacks still run.
    pub fn set_pending(&self, committer: Committer) {
        let mut pending = self.pending.lock();
        *pending = Some(match pending.take() {
            Some(earlier) => committer.absorb(earlier),
            None => committer,
        });
    }

    pub fn take_pending(&self) -> Option<Committer> {
        self.pending.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}
