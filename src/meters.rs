//! Row ingestion counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the fate of every offered row. Shared between the sink a
/// row lands in and the task-wide totals.
#[derive(Debug, Default)]
pub struct RowIngestionMeters {
    processed: AtomicU64,
    processed_with_error: AtomicU64,
    unparseable: AtomicU64,
    thrown_away: AtomicU64,
}

/// Point-in-time copy of [`RowIngestionMeters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterSnapshot {
    pub processed: u64,
    pub processed_with_error: u64,
    pub unparseable: u64,
    pub thrown_away: u64,
}

impl RowIngestionMeters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_processed_with_error(&self) {
        self.processed_with_error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_unparseable(&self) {
        self.unparseable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_thrown_away(&self) {
        self.thrown_away.fetch_add(1, Ordering::Relaxed);
    }

    /// Rows that were rejected or only partially parsed.
    pub fn parse_exceptions(&self) -> u64 {
        self.processed_with_error.load(Ordering::Relaxed) + self.unparseable.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            processed_with_error: self.processed_with_error.load(Ordering::Relaxed),
            unparseable: self.unparseable.load(Ordering::Relaxed),
            thrown_away: self.thrown_away.load(Ordering::Relaxed),
        }
    }
}
