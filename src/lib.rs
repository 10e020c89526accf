//! sinkbuf - a streaming write buffer and incremental segment manager
//!
//! sinkbuf accepts continuously arriving rows, indexes them in memory per
//! logical partition, persists that memory to immutable on-disk chunks when
//! thresholds are crossed, answers queries over the union of in-memory and
//! persisted state, and merges everything into a sealed segment for handoff
//! to deep storage.

pub mod appenderator;
pub mod cgroup;
pub mod chunk;
pub mod committer;
pub mod concurrency;
pub mod error;
pub mod filter;
pub mod fire;
pub mod governor;
pub mod identity;
pub mod index;
pub mod ledger;
pub mod meters;
pub mod mmap;
pub mod pusher;
pub mod query;
pub mod schema;
pub mod sink;
pub mod time;

pub use appenderator::{AddResult, Appenderator, AppenderatorBuilder, SegmentsAndCommitMetadata};
pub use committer::{Committer, CommitterSupplier};
pub use concurrency::Handle;
pub use error::{ErrorClass, Result, SinkbufError};
pub use filter::{BoundOrdering, DimFilter};
pub use identity::{PartitionIdentity, SegmentDescriptor};
pub use meters::{MeterSnapshot, RowIngestionMeters};
pub use pusher::{DataSegment, LocalSegmentPusher, SegmentPusher};
pub use query::{QuerySpec, ResultOrdering, RowSequence, ScanRow, TimeseriesResult};
pub use schema::{AggregatorSpec, DataSchema, DimensionKind, DimensionSchema, MetricValue};
pub use time::{Granularity, Interval};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A raw field value carried by an input row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Long(i64),
    Double(f64),
    String(String),
}

impl FieldValue {
    /// String form used when the value is stored as a dimension.
    pub fn to_dimension_string(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Long(v) => Some(v.to_string()),
            FieldValue::Double(v) => Some(v.to_string()),
            FieldValue::String(s) => Some(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Long(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(FieldValue::Null, Into::into)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Long(v) => write!(f, "{}", v),
            FieldValue::Double(v) => write!(f, "{}", v),
            FieldValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// A row as delivered by the ingestion source: a timestamp in epoch
/// milliseconds plus named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRow {
    timestamp: i64,
    fields: BTreeMap<String, FieldValue>,
}

impl InputRow {
    /// Creates a row with no fields.
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field, replacing any previous value of the same name.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Sets a field.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Gets the timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Gets a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Iterates fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}
