//! Dimension filters for scans and time-series queries.
//!
//! A [`DimFilter`] is the declarative form supplied with a query. It is
//! compiled once per query against the schema into a [`CompiledFilter`],
//! which holds every predicate fully built: selector values are parsed into
//! their numeric forms up front instead of on first use.

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::index::{PartitionIndex, full_bitmap};
use crate::query::ScanRow;
use crate::schema::{DataSchema, DimensionKind};

/// Comparison used by bound filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundOrdering {
    #[default]
    Lexicographic,
    Numeric,
}

/// Declarative row filter over dimension values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DimFilter {
    /// Dimension equals the value; a `None` value selects nulls.
    Selector {
        dimension: String,
        value: Option<String>,
    },
    /// Dimension equals any of the values.
    In {
        dimension: String,
        values: Vec<Option<String>>,
    },
    /// Dimension lies within the bounds. Nulls never match.
    Bound {
        dimension: String,
        lower: Option<String>,
        upper: Option<String>,
        lower_strict: bool,
        upper_strict: bool,
        ordering: BoundOrdering,
    },
    And {
        fields: Vec<DimFilter>,
    },
    Or {
        fields: Vec<DimFilter>,
    },
    Not {
        field: Box<DimFilter>,
    },
    /// Matches nothing.
    False,
}

impl DimFilter {
    pub fn selector(dimension: impl Into<String>, value: impl Into<String>) -> Self {
        DimFilter::Selector {
            dimension: dimension.into(),
            value: Some(value.into()),
        }
    }

    pub fn is_null(dimension: impl Into<String>) -> Self {
        DimFilter::Selector {
            dimension: dimension.into(),
            value: None,
        }
    }

    pub fn in_values<I, S>(dimension: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DimFilter::In {
            dimension: dimension.into(),
            values: values.into_iter().map(|v| Some(v.into())).collect(),
        }
    }

    /// Inclusive range; either side may be open.
    pub fn range(
        dimension: impl Into<String>,
        lower: Option<&str>,
        upper: Option<&str>,
        ordering: BoundOrdering,
    ) -> Self {
        DimFilter::Bound {
            dimension: dimension.into(),
            lower: lower.map(str::to_string),
            upper: upper.map(str::to_string),
            lower_strict: false,
            upper_strict: false,
            ordering,
        }
    }

    pub fn and(fields: Vec<DimFilter>) -> Self {
        DimFilter::And { fields }
    }

    pub fn or(fields: Vec<DimFilter>) -> Self {
        DimFilter::Or { fields }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(field: DimFilter) -> Self {
        DimFilter::Not {
            field: Box::new(field),
        }
    }

    /// Builds the executable form of this filter.
    pub fn compile(&self, schema: &DataSchema) -> CompiledFilter {
        let kind_of = |dimension: &str| {
            schema
                .dimensions()
                .iter()
                .find(|d| d.name == dimension)
                .map_or(DimensionKind::String, |d| d.kind)
        };

        match self {
            DimFilter::Selector { dimension, value } => CompiledFilter::Selector {
                dimension: dimension.clone(),
                predicate: SelectorPredicate::new(value.clone(), kind_of(dimension)),
            },
            DimFilter::In { dimension, values } => {
                let kind = kind_of(dimension);
                CompiledFilter::In {
                    dimension: dimension.clone(),
                    predicates: values
                        .iter()
                        .map(|v| SelectorPredicate::new(v.clone(), kind))
                        .collect(),
                }
            }
            DimFilter::Bound {
                dimension,
                lower,
                upper,
                lower_strict,
                upper_strict,
                ordering,
            } => {
                let ordering = match kind_of(dimension) {
                    DimensionKind::Long => BoundOrdering::Numeric,
                    DimensionKind::String => *ordering,
                };
                CompiledFilter::Bound {
                    dimension: dimension.clone(),
                    lower: lower.as_ref().map(|v| BoundEnd::new(v, *lower_strict, ordering)),
                    upper: upper.as_ref().map(|v| BoundEnd::new(v, *upper_strict, ordering)),
                    ordering,
                }
            }
            DimFilter::And { fields } => {
                CompiledFilter::And(fields.iter().map(|f| f.compile(schema)).collect())
            }
            DimFilter::Or { fields } => {
                CompiledFilter::Or(fields.iter().map(|f| f.compile(schema)).collect())
            }
            DimFilter::Not { field } => CompiledFilter::Not(Box::new(field.compile(schema))),
            DimFilter::False => CompiledFilter::False,
        }
    }
}

/// Equality predicate with its string, long and double forms built at
/// construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorPredicate {
    kind: DimensionKind,
    value: Option<String>,
    as_long: Option<i64>,
    as_double: Option<f64>,
}

impl SelectorPredicate {
    pub fn new(value: Option<String>, kind: DimensionKind) -> Self {
        let as_long = value.as_deref().and_then(|v| v.trim().parse::<i64>().ok());
        let as_double = value.as_deref().and_then(|v| v.trim().parse::<f64>().ok());
        Self {
            kind,
            value,
            as_long,
            as_double,
        }
    }

    pub fn matches(&self, candidate: Option<&str>) -> bool {
        match (candidate, &self.value) {
            (None, None) => true,
            (None, Some(_)) | (Some(_), None) => false,
            (Some(candidate), Some(value)) => match self.kind {
                DimensionKind::String => candidate == value,
                DimensionKind::Long => {
                    self.as_long.is_some() && candidate.parse::<i64>().ok() == self.as_long
                }
            },
        }
    }

    pub fn matches_long(&self, candidate: i64) -> bool {
        self.as_long == Some(candidate)
    }

    pub fn matches_double(&self, candidate: f64) -> bool {
        self.as_double == Some(candidate)
    }

    /// Dictionary value to look up in a bitmap index. `None` when no stored
    /// value can ever match.
    fn lookup_value(&self) -> Option<Option<String>> {
        match (&self.value, self.kind) {
            (None, _) => Some(None),
            (Some(value), DimensionKind::String) => Some(Some(value.clone())),
            (Some(_), DimensionKind::Long) => self.as_long.map(|v| Some(v.to_string())),
        }
    }
}

/// One side of a bound filter.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundEnd {
    value: String,
    numeric: Option<f64>,
    strict: bool,
}

impl BoundEnd {
    fn new(value: &str, strict: bool, ordering: BoundOrdering) -> Self {
        let numeric = match ordering {
            BoundOrdering::Numeric => value.trim().parse::<f64>().ok(),
            BoundOrdering::Lexicographic => None,
        };
        Self {
            value: value.to_string(),
            numeric,
            strict,
        }
    }
}

/// Executable filter.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledFilter {
    Selector {
        dimension: String,
        predicate: SelectorPredicate,
    },
    In {
        dimension: String,
        predicates: Vec<SelectorPredicate>,
    },
    Bound {
        dimension: String,
        lower: Option<BoundEnd>,
        upper: Option<BoundEnd>,
        ordering: BoundOrdering,
    },
    And(Vec<CompiledFilter>),
    Or(Vec<CompiledFilter>),
    Not(Box<CompiledFilter>),
    False,
}

impl CompiledFilter {
    /// Evaluates the filter on a decoded row.
    pub fn matches(&self, row: &ScanRow) -> bool {
        match self {
            CompiledFilter::Selector {
                dimension,
                predicate,
            } => predicate.matches(row.dimension(dimension)),
            CompiledFilter::In {
                dimension,
                predicates,
            } => {
                let value = row.dimension(dimension);
                predicates.iter().any(|p| p.matches(value))
            }
            CompiledFilter::Bound {
                dimension,
                lower,
                upper,
                ordering,
            } => match row.dimension(dimension) {
                None => false,
                Some(value) => within_bounds(value, lower.as_ref(), upper.as_ref(), *ordering),
            },
            CompiledFilter::And(fields) => fields.iter().all(|f| f.matches(row)),
            CompiledFilter::Or(fields) => fields.iter().any(|f| f.matches(row)),
            CompiledFilter::Not(field) => !field.matches(row),
            CompiledFilter::False => false,
        }
    }

    /// Resolves the filter to row positions using the index's in-memory
    /// bitmaps. `None` when bitmaps are disabled or the filter needs value
    /// comparisons the bitmaps cannot answer.
    pub(crate) fn bitmap(&self, index: &PartitionIndex, row_count: usize) -> Option<RoaringBitmap> {
        match self {
            CompiledFilter::Selector {
                dimension,
                predicate,
            } => match predicate.lookup_value() {
                Some(value) => index.bitmap_for(dimension, value.as_deref()),
                None => index.bitmap_for(dimension, None).map(|_| RoaringBitmap::new()),
            },
            CompiledFilter::In {
                dimension,
                predicates,
            } => {
                let mut union = RoaringBitmap::new();
                for predicate in predicates {
                    if let Some(value) = predicate.lookup_value() {
                        union |= index.bitmap_for(dimension, value.as_deref())?;
                    }
                }
                Some(union)
            }
            CompiledFilter::Bound { .. } => None,
            CompiledFilter::And(fields) => {
                let mut result = full_bitmap(row_count);
                for field in fields {
                    result &= field.bitmap(index, row_count)?;
                }
                Some(result)
            }
            CompiledFilter::Or(fields) => {
                let mut result = RoaringBitmap::new();
                for field in fields {
                    result |= field.bitmap(index, row_count)?;
                }
                Some(result)
            }
            CompiledFilter::Not(field) => {
                let inner = field.bitmap(index, row_count)?;
                Some(full_bitmap(row_count) - inner)
            }
            CompiledFilter::False => Some(RoaringBitmap::new()),
        }
    }
}

fn within_bounds(
    value: &str,
    lower: Option<&BoundEnd>,
    upper: Option<&BoundEnd>,
    ordering: BoundOrdering,
) -> bool {
    let numeric = match ordering {
        BoundOrdering::Numeric => match value.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => return false,
        },
        BoundOrdering::Lexicographic => None,
    };

    let compare = |end: &BoundEnd| -> Option<Ordering> {
        match numeric {
            Some(v) => v.partial_cmp(&end.numeric?),
            None => Some(value.cmp(end.value.as_str())),
        }
    };

    if let Some(lower) = lower {
        match compare(lower) {
            Some(Ordering::Greater) => {}
            Some(Ordering::Equal) if !lower.strict => {}
            _ => return false,
        }
    }
    if let Some(upper) = upper {
        match compare(upper) {
            Some(Ordering::Less) => {}
            Some(Ordering::Equal) if !upper.strict => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AggregatorSpec, DimensionSchema};
    use crate::InputRow;
    use std::sync::Arc;

    fn schema() -> DataSchema {
        DataSchema::new("foo")
            .with_dimensions(vec![
                DimensionSchema::string("dim"),
                DimensionSchema::long("num"),
            ])
            .with_aggregators(vec![AggregatorSpec::count("count")])
    }

    fn row(dim: Option<&str>, num: Option<&str>) -> ScanRow {
        ScanRow {
            timestamp: 0,
            dimensions: vec![
                ("dim".to_string(), dim.map(str::to_string)),
                ("num".to_string(), num.map(str::to_string)),
            ],
            metrics: Vec::new(),
        }
    }

    #[test]
    fn test_selector_matches_strings_and_nulls() {
        let schema = schema();
        let foo = DimFilter::selector("dim", "foo").compile(&schema);
        assert!(foo.matches(&row(Some("foo"), None)));
        assert!(!foo.matches(&row(Some("bar"), None)));
        assert!(!foo.matches(&row(None, None)));

        let null = DimFilter::is_null("dim").compile(&schema);
        assert!(null.matches(&row(None, None)));
        assert!(!null.matches(&row(Some("foo"), None)));

        let missing = DimFilter::is_null("unknown").compile(&schema);
        assert!(missing.matches(&row(Some("foo"), None)));
    }

    #[test]
    fn test_long_selector_compares_numerically() {
        let schema = schema();
        let filter = DimFilter::selector("num", "007").compile(&schema);
        assert!(filter.matches(&row(None, Some("7"))));
        assert!(!filter.matches(&row(None, Some("8"))));

        let garbage = DimFilter::selector("num", "abc").compile(&schema);
        assert!(!garbage.matches(&row(None, Some("7"))));

        let predicate = SelectorPredicate::new(Some("2.5".to_string()), DimensionKind::String);
        assert!(predicate.matches_double(2.5));
        assert!(!predicate.matches_long(2));
    }

    #[test]
    fn test_bounds() {
        let schema = schema();
        let lexicographic =
            DimFilter::range("dim", Some("bar"), Some("foo"), BoundOrdering::Lexicographic)
                .compile(&schema);
        assert!(lexicographic.matches(&row(Some("bar"), None)));
        assert!(lexicographic.matches(&row(Some("cat"), None)));
        assert!(!lexicographic.matches(&row(Some("zoo"), None)));
        assert!(!lexicographic.matches(&row(None, None)));

        let strict = DimFilter::Bound {
            dimension: "dim".to_string(),
            lower: Some("bar".to_string()),
            upper: None,
            lower_strict: true,
            upper_strict: false,
            ordering: BoundOrdering::Lexicographic,
        }
        .compile(&schema);
        assert!(!strict.matches(&row(Some("bar"), None)));
        assert!(strict.matches(&row(Some("baz"), None)));

        let numeric =
            DimFilter::range("num", Some("2"), Some("10"), BoundOrdering::Lexicographic)
                .compile(&schema);
        assert!(numeric.matches(&row(None, Some("9"))));
        assert!(!numeric.matches(&row(None, Some("11"))));
    }

    #[test]
    fn test_boolean_combinators() {
        let schema = schema();
        let filter = DimFilter::and(vec![
            DimFilter::not(DimFilter::selector("dim", "foo")),
            DimFilter::or(vec![
                DimFilter::selector("num", "1"),
                DimFilter::in_values("dim", ["bar", "baz"]),
            ]),
        ])
        .compile(&schema);

        assert!(filter.matches(&row(Some("bar"), None)));
        assert!(filter.matches(&row(None, Some("1"))));
        assert!(!filter.matches(&row(Some("foo"), Some("1"))));
        assert!(!filter.matches(&row(Some("qux"), None)));
        assert!(!DimFilter::False.compile(&schema).matches(&row(None, None)));
    }

    #[test]
    fn test_bitmap_resolution_agrees_with_row_matching() {
        let schema = Arc::new(schema().with_rollup(false).with_in_memory_bitmaps(true));
        let index = PartitionIndex::new(Arc::clone(&schema), false);
        for (dim, num) in [("foo", 1i64), ("bar", 2), ("foo", 3), ("baz", 1)] {
            index.ingest(&InputRow::new(0).with_field("dim", dim).with_field("num", num));
        }
        index.ingest(&InputRow::new(0));

        let filters = vec![
            DimFilter::selector("dim", "foo"),
            DimFilter::selector("num", "01"),
            DimFilter::is_null("dim"),
            DimFilter::not(DimFilter::selector("dim", "foo")),
            DimFilter::and(vec![
                DimFilter::selector("dim", "foo"),
                DimFilter::selector("num", "3"),
            ]),
            DimFilter::in_values("dim", ["bar", "baz", "nope"]),
            DimFilter::False,
        ];

        let count = index.row_count();
        for filter in filters {
            let compiled = filter.compile(&schema);
            let bitmap = compiled.bitmap(&index, count).unwrap();
            let expected: Vec<u32> = (0..count)
                .filter(|&p| compiled.matches(&index.read_back(p).unwrap()))
                .map(|p| p as u32)
                .collect();
            assert_eq!(bitmap.iter().collect::<Vec<_>>(), expected, "{filter:?}");
        }

        let bound = DimFilter::range("dim", Some("a"), None, BoundOrdering::Lexicographic);
        assert!(bound.compile(&schema).bitmap(&index, count).is_none());
    }
}
