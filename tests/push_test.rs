use serde_json::json;
use sinkbuf::chunk::META_FILE_NAME;
use sinkbuf::committer::NilCommitterSupplier;
use sinkbuf::pusher::DESCRIPTOR_FILE_NAME;
use sinkbuf::{
    AggregatorSpec, Appenderator, AppenderatorBuilder, Committer, DataSchema, DataSegment,
    DimensionSchema, InputRow, LocalSegmentPusher, MetricValue, PartitionIdentity, QuerySpec,
    SegmentPusher, SinkbufError,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const Y2000: i64 = 946_684_800_000;

fn schema() -> DataSchema {
    DataSchema::new("foo")
        .with_dimensions(vec![DimensionSchema::string("dim")])
        .with_aggregators(vec![
            AggregatorSpec::count("count"),
            AggregatorSpec::long_sum("met", "met"),
        ])
}

fn builder(temp_dir: &TempDir, pusher: Arc<dyn SegmentPusher>) -> AppenderatorBuilder {
    AppenderatorBuilder::new()
        .with_base_dir(temp_dir.path().join("persist"))
        .with_pusher(pusher)
        .with_schema(schema())
        .with_query_threads(2)
}

fn local(temp_dir: &TempDir) -> Arc<dyn SegmentPusher> {
    Arc::new(LocalSegmentPusher::new(temp_dir.path().join("deep")))
}

fn identity(shard: u32) -> PartitionIdentity {
    PartitionIdentity::new("foo", "2000/2001".parse().unwrap(), "A", shard)
}

fn row(dim: &str, met: i64) -> InputRow {
    InputRow::new(Y2000).with_field("dim", dim).with_field("met", met)
}

/// Counts pushes and fails the first `failures` of them.
struct FlakyPusher {
    inner: LocalSegmentPusher,
    failures: usize,
    calls: AtomicUsize,
}

impl SegmentPusher for FlakyPusher {
    fn push(
        &self,
        merged_dir: &Path,
        segment: DataSegment,
        use_unique_path: bool,
    ) -> sinkbuf::Result<DataSegment> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SinkbufError::Push {
                identity: segment.identity.to_string(),
                details: "deep storage unavailable".to_string(),
            });
        }
        self.inner.push(merged_dir, segment, use_unique_path)
    }
}

#[test]
fn test_push_merges_all_fire_segments() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = builder(&temp_dir, local(&temp_dir))
        .with_max_rows_in_memory(2)
        .build()
        .unwrap();
    appenderator.start_job().unwrap();

    for (dim, met) in [("a", 1), ("b", 2), ("c", 3), ("a", 4), ("d", 5)] {
        appenderator.add(&identity(0), &row(dim, met), &NilCommitterSupplier, true).unwrap();
    }
    appenderator.add(&identity(1), &row("z", 9), &NilCommitterSupplier, true).unwrap();
    assert!(appenderator.persist_count() >= 2);

    let pushed = appenderator
        .push_and_wait(&[identity(0), identity(1)], Some(Committer::new(json!(42))), false)
        .unwrap();
    assert_eq!(pushed.commit_metadata, Some(json!(42)));
    assert_eq!(pushed.segments.len(), 2);

    let first = &pushed.segments[0];
    assert_eq!(first.identity, identity(0));
    // "a" rolled up across fire-segments.
    assert_eq!(first.num_rows, 4);
    assert_eq!(first.dimensions, vec!["dim"]);
    assert_eq!(first.metrics, vec!["count", "met"]);
    assert!(first.load_path.starts_with(temp_dir.path().join("deep")));
    assert!(first.load_path.join(META_FILE_NAME).is_file());
    assert!(first.size_bytes > 0);
    assert_eq!(pushed.segments[1].num_rows, 1);
}

#[test]
fn test_pushed_sink_rejects_rows_but_still_answers_queries() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = builder(&temp_dir, local(&temp_dir)).build().unwrap();
    appenderator.start_job().unwrap();
    appenderator.add(&identity(0), &row("a", 1), &NilCommitterSupplier, true).unwrap();

    appenderator.push_and_wait(&[identity(0)], None, false).unwrap();
    assert!(matches!(
        appenderator.add(&identity(0), &row("b", 1), &NilCommitterSupplier, true),
        Err(SinkbufError::SinkNotWritable { .. })
    ));

    let totals = appenderator.timeseries(&QuerySpec::new()).unwrap();
    assert_eq!(totals[0].value("met"), Some(MetricValue::Long(1)));
    assert_eq!(appenderator.segments(), vec![identity(0)]);
}

#[test]
fn test_repush_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let pusher = Arc::new(FlakyPusher {
        inner: LocalSegmentPusher::new(temp_dir.path().join("deep")),
        failures: 0,
        calls: AtomicUsize::new(0),
    });
    let appenderator = builder(&temp_dir, Arc::clone(&pusher) as Arc<dyn SegmentPusher>)
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    appenderator.add(&identity(0), &row("a", 1), &NilCommitterSupplier, true).unwrap();

    let first = appenderator.push_and_wait(&[identity(0)], None, false).unwrap();
    let second = appenderator.push_and_wait(&[identity(0)], None, false).unwrap();
    assert_eq!(first.segments, second.segments);
    assert_eq!(pusher.calls.load(Ordering::SeqCst), 1);

    let merged = temp_dir
        .path()
        .join("persist")
        .join(identity(0).dir_name())
        .join("merged");
    assert!(merged.join(DESCRIPTOR_FILE_NAME).is_file());
}

#[test]
fn test_unique_paths_push_again() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = builder(&temp_dir, local(&temp_dir)).build().unwrap();
    appenderator.start_job().unwrap();
    appenderator.add(&identity(0), &row("a", 1), &NilCommitterSupplier, true).unwrap();

    let first = appenderator.push_and_wait(&[identity(0)], None, true).unwrap();
    let second = appenderator.push_and_wait(&[identity(0)], None, true).unwrap();
    assert_ne!(first.segments[0].load_path, second.segments[0].load_path);
}

#[test]
fn test_failed_push_leaves_local_state_intact() {
    let temp_dir = TempDir::new().unwrap();
    let pusher: Arc<dyn SegmentPusher> = Arc::new(FlakyPusher {
        inner: LocalSegmentPusher::new(temp_dir.path().join("deep")),
        failures: 1,
        calls: AtomicUsize::new(0),
    });
    let appenderator = builder(&temp_dir, pusher).build().unwrap();
    appenderator.start_job().unwrap();
    appenderator.add(&identity(0), &row("a", 1), &NilCommitterSupplier, true).unwrap();
    appenderator.add(&identity(0), &row("b", 2), &NilCommitterSupplier, true).unwrap();

    let err = appenderator
        .push_and_wait(&[identity(0)], None, false)
        .unwrap_err();
    assert!(matches!(err, SinkbufError::Push { .. }));
    assert_eq!(err.class(), sinkbuf::ErrorClass::Io);
    assert_eq!(appenderator.row_count(&identity(0)).unwrap(), 2);

    let retried = appenderator.push_and_wait(&[identity(0)], None, false).unwrap();
    assert_eq!(retried.segments[0].num_rows, 2);
}

#[test]
fn test_push_unknown_partition() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = builder(&temp_dir, local(&temp_dir)).build().unwrap();
    appenderator.start_job().unwrap();
    assert!(matches!(
        appenderator.push(&[identity(3)], None, false),
        Err(SinkbufError::UnknownPartition { .. })
    ));
}

#[test]
fn test_push_with_timeout_completes() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = builder(&temp_dir, local(&temp_dir))
        .with_push_timeout(Duration::from_secs(30))
        .build()
        .unwrap();
    appenderator.start_job().unwrap();
    appenderator.add(&identity(0), &row("a", 1), &NilCommitterSupplier, true).unwrap();
    let pushed = appenderator.push_and_wait(&[identity(0)], None, false).unwrap();
    assert_eq!(pushed.segments.len(), 1);
}

#[test]
fn test_drop_after_push_deletes_local_data() {
    let temp_dir = TempDir::new().unwrap();
    let appenderator = builder(&temp_dir, local(&temp_dir)).build().unwrap();
    appenderator.start_job().unwrap();
    appenderator.add(&identity(0), &row("a", 1), &NilCommitterSupplier, true).unwrap();
    let pushed = appenderator.push_and_wait(&[identity(0)], None, false).unwrap();

    appenderator.drop_sink(&identity(0)).unwrap().wait().unwrap();
    assert!(appenderator.segments().is_empty());
    assert!(!temp_dir.path().join("persist").join(identity(0).dir_name()).exists());
    // Deep storage keeps the pushed copy.
    assert!(pushed.segments[0].load_path.join(META_FILE_NAME).is_file());
    assert!(matches!(
        appenderator.drop_sink(&identity(0)),
        Err(SinkbufError::UnknownPartition { .. })
    ));
}
