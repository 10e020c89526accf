//! Error types for sinkbuf.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sinkbuf operations.
pub type Result<T> = std::result::Result<T, SinkbufError>;

/// Broad classification of an error, used by callers to decide whether the
/// ingestion task can continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A single row could not be ingested; counted, never fatal on its own.
    RowLevel,
    /// Memory could not be reclaimed; the task must fail.
    Resource,
    /// The caller used the API in a way the current state does not allow.
    StateViolation,
    /// Local disk or deep storage failure.
    Io,
}

/// Main error type for sinkbuf operations.
#[derive(Error, Debug)]
pub enum SinkbufError {
    #[error("Invalid interval: start {start} > end {end}")]
    InvalidInterval { start: i64, end: i64 },

    #[error("Cannot parse interval '{input}': {details}")]
    IntervalParse { input: String, details: String },

    #[error("Data source mismatch: appenderator serves '{expected}', got '{actual}'")]
    DataSourceMismatch { expected: String, actual: String },

    #[error("Unknown partition {identity}")]
    UnknownPartition { identity: String },

    #[error("Cannot drop partition {identity} while a persist is in flight")]
    PersistInFlight { identity: String },

    #[error("Partition {identity} no longer accepts rows")]
    SinkNotWritable { identity: String },

    #[error("Fire-segment {sequence} is immutable")]
    ImmutableFireSegment { sequence: u32 },

    #[error("start_job must be called before {operation}")]
    NotStarted { operation: &'static str },

    #[error("Appenderator already closed")]
    Closed,

    #[error(
        "Persist cannot free enough memory: {remaining} bytes would remain against a budget of {max} bytes"
    )]
    PersistCannotFreeMemory { remaining: usize, max: usize },

    #[error("Too many parse exceptions: {count} exceeds the limit of {max}")]
    TooManyParseExceptions { count: u64, max: u64 },

    #[error("Previous persist failed: {0}")]
    PersistFailed(String),

    #[error("Push of {identity} failed: {details}")]
    Push { identity: String, details: String },

    #[error("Task '{task}' was aborted before completing")]
    TaskAborted { task: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },

    #[error("Channel timeout after {timeout_ms}ms")]
    ChannelTimeout { timeout_ms: u64 },

    #[error("Memory map error at {path:?}: {details}")]
    MemoryMap { path: PathBuf, details: String },

    #[error("Invalid offset {offset} exceeds maximum {max}")]
    InvalidOffset { offset: u64, max: u64 },
}

impl SinkbufError {
    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SinkbufError::TooManyParseExceptions { .. } => ErrorClass::RowLevel,
            SinkbufError::PersistCannotFreeMemory { .. } => ErrorClass::Resource,
            SinkbufError::InvalidInterval { .. }
            | SinkbufError::IntervalParse { .. }
            | SinkbufError::DataSourceMismatch { .. }
            | SinkbufError::UnknownPartition { .. }
            | SinkbufError::PersistInFlight { .. }
            | SinkbufError::SinkNotWritable { .. }
            | SinkbufError::ImmutableFireSegment { .. }
            | SinkbufError::NotStarted { .. }
            | SinkbufError::Closed
            | SinkbufError::InvalidConfiguration(_) => ErrorClass::StateViolation,
            _ => ErrorClass::Io,
        }
    }

    /// Returns true when the ingestion task cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SinkbufError::PersistCannotFreeMemory { .. }
                | SinkbufError::TooManyParseExceptions { .. }
                | SinkbufError::PersistFailed(_)
        )
    }

    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SinkbufError::IoWithPath {
            path: path.into(),
            source,
        }
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for SinkbufError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        SinkbufError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvError> for SinkbufError {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        SinkbufError::ChannelReceive {
            channel: format!("{:?}", err),
        }
    }
}
