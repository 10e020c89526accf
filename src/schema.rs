//! Data schema: dimensions, aggregators and rollup settings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::time::Granularity;
use crate::{FieldValue, InputRow, Result, SinkbufError};

/// Reserved name of the timestamp column in query output.
pub const TIME_COLUMN: &str = "__time";

/// Value type of a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    String,
    Long,
}

/// A declared dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionSchema {
    pub name: String,
    pub kind: DimensionKind,
}

impl DimensionSchema {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::String,
        }
    }

    pub fn long(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DimensionKind::Long,
        }
    }
}

/// Value type of a metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Long,
    Double,
}

/// An accumulated metric value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Long(i64),
    Double(f64),
}

impl MetricValue {
    pub fn as_long(&self) -> i64 {
        match *self {
            MetricValue::Long(v) => v,
            MetricValue::Double(v) => v as i64,
        }
    }

    pub fn as_double(&self) -> f64 {
        match *self {
            MetricValue::Long(v) => v as f64,
            MetricValue::Double(v) => v,
        }
    }

    /// Raw 8-byte representation used by the on-disk metric columns.
    pub(crate) fn to_bits(self) -> u64 {
        match self {
            MetricValue::Long(v) => v as u64,
            MetricValue::Double(v) => v.to_bits(),
        }
    }

    pub(crate) fn from_bits(kind: MetricKind, bits: u64) -> Self {
        match kind {
            MetricKind::Long => MetricValue::Long(bits as i64),
            MetricKind::Double => MetricValue::Double(f64::from_bits(bits)),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Long(v) => write!(f, "{}", v),
            MetricValue::Double(v) => write!(f, "{}", v),
        }
    }
}

/// A field value that could not be interpreted as the declared type.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub field: String,
    pub reason: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field '{}': {}", self.field, self.reason)
    }
}

/// Aggregator declared on a schema. Each produces one metric column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorSpec {
    Count { name: String },
    LongSum { name: String, field: String },
    DoubleSum { name: String, field: String },
    LongMin { name: String, field: String },
    LongMax { name: String, field: String },
}

impl AggregatorSpec {
    pub fn count(name: impl Into<String>) -> Self {
        AggregatorSpec::Count { name: name.into() }
    }

    pub fn long_sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::LongSum {
            name: name.into(),
            field: field.into(),
        }
    }

    pub fn double_sum(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::DoubleSum {
            name: name.into(),
            field: field.into(),
        }
    }

    pub fn long_min(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::LongMin {
            name: name.into(),
            field: field.into(),
        }
    }

    pub fn long_max(name: impl Into<String>, field: impl Into<String>) -> Self {
        AggregatorSpec::LongMax {
            name: name.into(),
            field: field.into(),
        }
    }

    /// Output column name.
    pub fn name(&self) -> &str {
        match self {
            AggregatorSpec::Count { name }
            | AggregatorSpec::LongSum { name, .. }
            | AggregatorSpec::DoubleSum { name, .. }
            | AggregatorSpec::LongMin { name, .. }
            | AggregatorSpec::LongMax { name, .. } => name,
        }
    }

    /// Input field read from each row, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            AggregatorSpec::Count { .. } => None,
            AggregatorSpec::LongSum { field, .. }
            | AggregatorSpec::DoubleSum { field, .. }
            | AggregatorSpec::LongMin { field, .. }
            | AggregatorSpec::LongMax { field, .. } => Some(field),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            AggregatorSpec::DoubleSum { .. } => MetricKind::Double,
            _ => MetricKind::Long,
        }
    }

    /// Accumulator value before any row is folded in.
    pub fn initial(&self) -> MetricValue {
        match self {
            AggregatorSpec::Count { .. } | AggregatorSpec::LongSum { .. } => MetricValue::Long(0),
            AggregatorSpec::DoubleSum { .. } => MetricValue::Double(0.0),
            AggregatorSpec::LongMin { .. } => MetricValue::Long(i64::MAX),
            AggregatorSpec::LongMax { .. } => MetricValue::Long(i64::MIN),
        }
    }

    /// Folds one raw input row into the accumulator. On a parse failure the
    /// accumulator is left untouched.
    pub fn aggregate(
        &self,
        acc: &mut MetricValue,
        row: &InputRow,
    ) -> std::result::Result<(), ParseError> {
        let input = match self {
            AggregatorSpec::Count { .. } => {
                *acc = MetricValue::Long(acc.as_long().saturating_add(1));
                return Ok(());
            }
            _ => self.field().and_then(|field| row.field(field)),
        };

        let Some(value) = input else {
            return Ok(());
        };

        let field = self.field().unwrap_or_default();
        match self.kind() {
            MetricKind::Long => {
                if let Some(v) = parse_long(field, value)? {
                    self.combine(acc, MetricValue::Long(v));
                }
            }
            MetricKind::Double => {
                if let Some(v) = parse_double(field, value)? {
                    self.combine(acc, MetricValue::Double(v));
                }
            }
        }
        Ok(())
    }

    /// Merges an already aggregated value into the accumulator.
    pub fn combine(&self, acc: &mut MetricValue, other: MetricValue) {
        *acc = match self {
            AggregatorSpec::Count { .. } | AggregatorSpec::LongSum { .. } => {
                MetricValue::Long(acc.as_long().wrapping_add(other.as_long()))
            }
            AggregatorSpec::DoubleSum { .. } => {
                MetricValue::Double(acc.as_double() + other.as_double())
            }
            AggregatorSpec::LongMin { .. } => {
                MetricValue::Long(acc.as_long().min(other.as_long()))
            }
            AggregatorSpec::LongMax { .. } => {
                MetricValue::Long(acc.as_long().max(other.as_long()))
            }
        };
    }
}

/// Interprets a field value as a long. `Ok(None)` means null.
pub fn parse_long(field: &str, value: &FieldValue) -> std::result::Result<Option<i64>, ParseError> {
    let error = |reason: String| ParseError {
        field: field.to_string(),
        reason,
    };
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Long(v) => Ok(Some(*v)),
        FieldValue::Double(v) if v.is_finite() => Ok(Some(*v as i64)),
        FieldValue::Double(v) => Err(error(format!("non-finite value {v}"))),
        FieldValue::String(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<i64>() {
                return Ok(Some(v));
            }
            match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(Some(v as i64)),
                _ => Err(error(format!("cannot parse '{s}' as long"))),
            }
        }
    }
}

/// Interprets a field value as a double. `Ok(None)` means null.
pub fn parse_double(
    field: &str,
    value: &FieldValue,
) -> std::result::Result<Option<f64>, ParseError> {
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Long(v) => Ok(Some(*v as f64)),
        FieldValue::Double(v) => Ok(Some(*v)),
        FieldValue::String(s) => s.trim().parse::<f64>().map(Some).map_err(|_| ParseError {
            field: field.to_string(),
            reason: format!("cannot parse '{s}' as double"),
        }),
    }
}

/// Schema of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSchema {
    data_source: String,
    dimensions: Vec<DimensionSchema>,
    aggregators: Vec<AggregatorSpec>,
    query_granularity: Granularity,
    rollup: bool,
    in_memory_bitmaps: bool,
}

impl DataSchema {
    /// Creates a schemaless, rollup-enabled schema with no aggregators.
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
            dimensions: Vec::new(),
            aggregators: Vec::new(),
            query_granularity: Granularity::None,
            rollup: true,
            in_memory_bitmaps: false,
        }
    }

    /// Declares the dimensions. An empty list enables discovery: every field
    /// that is not an aggregator input becomes a string dimension.
    pub fn with_dimensions(mut self, dimensions: Vec<DimensionSchema>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_aggregators(mut self, aggregators: Vec<AggregatorSpec>) -> Self {
        self.aggregators = aggregators;
        self
    }

    /// Granularity timestamps are truncated to before rollup.
    pub fn with_query_granularity(mut self, granularity: Granularity) -> Self {
        self.query_granularity = granularity;
        self
    }

    pub fn with_rollup(mut self, rollup: bool) -> Self {
        self.rollup = rollup;
        self
    }

    /// Keeps a bitmap of row positions per dimension value in memory.
    pub fn with_in_memory_bitmaps(mut self, enabled: bool) -> Self {
        self.in_memory_bitmaps = enabled;
        self
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    pub fn dimensions(&self) -> &[DimensionSchema] {
        &self.dimensions
    }

    pub fn aggregators(&self) -> &[AggregatorSpec] {
        &self.aggregators
    }

    pub fn query_granularity(&self) -> Granularity {
        self.query_granularity
    }

    pub fn rollup(&self) -> bool {
        self.rollup
    }

    pub fn in_memory_bitmaps(&self) -> bool {
        self.in_memory_bitmaps
    }

    pub fn is_schemaless(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Fields consumed by aggregators; excluded from dimension discovery.
    pub fn aggregator_inputs(&self) -> HashSet<&str> {
        self.aggregators.iter().filter_map(|a| a.field()).collect()
    }

    /// Checks names are non-empty and unique across dimensions and metrics.
    pub fn validate(&self) -> Result<()> {
        if self.data_source.is_empty() {
            return Err(SinkbufError::InvalidConfiguration(
                "data source name is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let names = self
            .dimensions
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.aggregators.iter().map(|a| a.name()));
        for name in names {
            if name.is_empty() || name == TIME_COLUMN {
                return Err(SinkbufError::InvalidConfiguration(format!(
                    "invalid column name '{name}'"
                )));
            }
            if !seen.insert(name) {
                return Err(SinkbufError::InvalidConfiguration(format!(
                    "duplicate column name '{name}'"
                )));
            }
        }
        Ok(())
    }
}
