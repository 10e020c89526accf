use sinkbuf::committer::NilCommitterSupplier;
use sinkbuf::{
    AggregatorSpec, Appenderator, AppenderatorBuilder, BoundOrdering, DataSchema, DimFilter,
    DimensionSchema, Granularity, InputRow, Interval, LocalSegmentPusher, MetricValue,
    PartitionIdentity, QuerySpec, ResultOrdering, ScanRow, SegmentDescriptor, SinkbufError,
};
use std::sync::Arc;
use tempfile::TempDir;

const HOUR: i64 = 3_600_000;
const Y2000: i64 = 946_684_800_000;

fn schema(bitmaps: bool) -> DataSchema {
    DataSchema::new("foo")
        .with_dimensions(vec![
            DimensionSchema::string("dim"),
            DimensionSchema::long("size"),
        ])
        .with_aggregators(vec![
            AggregatorSpec::count("count"),
            AggregatorSpec::long_sum("met", "met"),
        ])
        .with_rollup(false)
        .with_in_memory_bitmaps(bitmaps)
}

fn open(temp_dir: &TempDir, bitmaps: bool) -> Arc<dyn Appenderator> {
    let appenderator = AppenderatorBuilder::new()
        .with_base_dir(temp_dir.path().join("persist"))
        .with_pusher(Arc::new(LocalSegmentPusher::new(temp_dir.path().join("deep"))))
        .with_schema(schema(bitmaps))
        .with_query_threads(3)
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    appenderator
}

fn day(n: i64) -> PartitionIdentity {
    let start = Y2000 + n * 24 * HOUR;
    PartitionIdentity::new("foo", Interval::new(start, start + 24 * HOUR).unwrap(), "A", 0)
}

fn add(appenderator: &Arc<dyn Appenderator>, id: &PartitionIdentity, offset: i64, dim: &str, size: i64) {
    let row = InputRow::new(id.interval().start() + offset)
        .with_field("dim", dim)
        .with_field("size", size)
        .with_field("met", size);
    appenderator.add(id, &row, &NilCommitterSupplier, true).unwrap();
}

fn scan(appenderator: &Arc<dyn Appenderator>, spec: &QuerySpec) -> Vec<ScanRow> {
    appenderator
        .scan(spec)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap()
}

fn dims(rows: &[ScanRow]) -> Vec<String> {
    rows.iter()
        .map(|r| r.dimension("dim").unwrap_or("null").to_string())
        .collect()
}

/// Two days, the first partly persisted.
fn populate(appenderator: &Arc<dyn Appenderator>) {
    add(appenderator, &day(0), 2 * HOUR, "b", 20);
    add(appenderator, &day(0), HOUR, "a", 10);
    appenderator.persist_all(None).unwrap().wait().unwrap();
    add(appenderator, &day(0), 3 * HOUR, "c", 5);
    add(appenderator, &day(1), 0, "d", 7);
    add(appenderator, &day(1), 5 * HOUR, "a", 3);
}

#[test]
fn test_natural_order_spans_persisted_and_in_memory() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    populate(&appenderator);

    let rows = scan(&appenderator, &QuerySpec::new());
    assert_eq!(dims(&rows), vec!["b", "a", "c", "d", "a"]);
    assert_eq!(rows[0].columns(), vec!["__time", "dim", "size", "count", "met"]);
}

#[test]
fn test_time_orderings_and_limit() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    populate(&appenderator);

    let ascending = scan(
        &appenderator,
        &QuerySpec::new().with_ordering(ResultOrdering::TimeAscending),
    );
    let times: Vec<i64> = ascending.iter().map(|r| r.timestamp).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
    assert_eq!(dims(&ascending), vec!["a", "b", "c", "d", "a"]);

    let descending = scan(
        &appenderator,
        &QuerySpec::new()
            .with_ordering(ResultOrdering::TimeDescending)
            .with_limit(2),
    );
    assert_eq!(dims(&descending), vec!["a", "d"]);
}

#[test]
fn test_interval_scope_restricts_rows() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    populate(&appenderator);

    let first_hours = Interval::new(Y2000, Y2000 + 2 * HOUR + 1).unwrap();
    let rows = scan(&appenderator, &QuerySpec::for_intervals(vec![first_hours]));
    assert_eq!(dims(&rows), vec!["b", "a"]);

    let second_day = scan(&appenderator, &QuerySpec::for_intervals(vec![day(1).interval()]));
    assert_eq!(dims(&second_day), vec!["d", "a"]);
}

#[test]
fn test_segment_descriptors_scope_query() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    populate(&appenderator);

    let rows = scan(&appenderator, &QuerySpec::for_segments(vec![day(1).descriptor()]));
    assert_eq!(dims(&rows), vec!["d", "a"]);

    let unknown = SegmentDescriptor::new(day(1).interval(), "B", 0);
    assert!(matches!(
        appenderator.scan(&QuerySpec::for_segments(vec![unknown])),
        Err(SinkbufError::UnknownPartition { .. })
    ));
}

fn check_filters(bitmaps: bool) {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, bitmaps);
    populate(&appenderator);
    let no_dim = InputRow::new(day(1).interval().start() + 6 * HOUR)
        .with_field("size", 1)
        .with_field("met", 1);
    appenderator
        .add(&day(1), &no_dim, &NilCommitterSupplier, true)
        .unwrap();

    let selected = |filter: DimFilter| dims(&scan(&appenderator, &QuerySpec::new().with_filter(filter)));

    assert_eq!(selected(DimFilter::selector("dim", "a")), vec!["a", "a"]);
    assert_eq!(selected(DimFilter::in_values("dim", ["b", "d"])), vec!["b", "d"]);
    assert_eq!(
        selected(DimFilter::range("dim", Some("b"), Some("c"), BoundOrdering::Lexicographic)),
        vec!["b", "c"]
    );
    assert_eq!(
        selected(DimFilter::range("size", Some("7"), None, BoundOrdering::Numeric)),
        vec!["b", "a", "d"]
    );
    assert_eq!(
        selected(DimFilter::and(vec![
            DimFilter::selector("dim", "a"),
            DimFilter::selector("size", "3"),
        ])),
        vec!["a"]
    );
    assert_eq!(
        selected(DimFilter::or(vec![
            DimFilter::selector("dim", "c"),
            DimFilter::selector("dim", "d"),
        ])),
        vec!["c", "d"]
    );
    assert_eq!(
        selected(DimFilter::not(DimFilter::in_values("dim", ["a", "b", "c"]))),
        vec!["d", "null"]
    );
    assert_eq!(selected(DimFilter::is_null("dim")), vec!["null"]);
    assert!(selected(DimFilter::False).is_empty());
    assert!(selected(DimFilter::selector("missing", "x")).is_empty());
}

#[test]
fn test_filters_without_bitmaps() {
    check_filters(false);
}

#[test]
fn test_filters_with_bitmaps() {
    check_filters(true);
}

#[test]
fn test_timeseries_buckets_and_omits_empty_ones() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    populate(&appenderator);

    let by_day = appenderator
        .timeseries(&QuerySpec::new().with_granularity(Granularity::Day))
        .unwrap();
    assert_eq!(by_day.len(), 2);
    assert_eq!(by_day[0].timestamp, day(0).interval().start());
    assert_eq!(by_day[0].value("count"), Some(MetricValue::Long(3)));
    assert_eq!(by_day[0].value("met"), Some(MetricValue::Long(35)));
    assert_eq!(by_day[1].value("met"), Some(MetricValue::Long(10)));

    // Hours 4 and 6 through 23 of the first day hold no rows.
    let by_hour = appenderator
        .timeseries(
            &QuerySpec::for_intervals(vec![day(0).interval()]).with_granularity(Granularity::Hour),
        )
        .unwrap();
    let hours: Vec<i64> = by_hour.iter().map(|r| (r.timestamp - Y2000) / HOUR).collect();
    assert_eq!(hours, vec![1, 2, 3]);

    let filtered = appenderator
        .timeseries(&QuerySpec::new().with_filter(DimFilter::selector("dim", "a")))
        .unwrap();
    let total: i64 = filtered
        .iter()
        .map(|r| r.value("met").unwrap().as_long())
        .sum();
    assert_eq!(total, 13);
}

#[test]
fn test_cursor_is_point_in_time() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    add(&appenderator, &day(0), 0, "a", 1);
    add(&appenderator, &day(0), 1, "b", 1);

    let mut rows = appenderator.scan(&QuerySpec::new()).unwrap();
    let first = rows.next().unwrap().unwrap();
    assert_eq!(first.dimension("dim"), Some("a"));

    add(&appenderator, &day(0), 2, "c", 1);
    add(&appenderator, &day(1), 0, "d", 1);

    let rest: Vec<ScanRow> = rows.collect::<Result<_, _>>().unwrap();
    assert_eq!(dims(&rest), vec!["b"]);
    assert_eq!(scan(&appenderator, &QuerySpec::new()).len(), 4);
}

#[test]
fn test_cursor_survives_persist() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = open(&temp_dir, false);
    for (i, dim) in ["a", "b", "c"].iter().enumerate() {
        add(&appenderator, &day(0), i as i64, dim, 1);
    }

    let rows = appenderator.scan(&QuerySpec::new()).unwrap();
    appenderator.persist_all(None).unwrap().wait().unwrap();
    let all: Vec<ScanRow> = rows.collect::<Result<_, _>>().unwrap();
    assert_eq!(dims(&all), vec!["a", "b", "c"]);
}
