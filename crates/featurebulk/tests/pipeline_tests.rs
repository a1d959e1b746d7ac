//! Pipeline integration tests for featurebulk.
//!
//! These tests run the identifier cache, resolver, worker pool and the
//! import/export pipelines against SQLite databases in temporary directories.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use featurebulk::cache::{CacheTableManager, CacheTableModel};
use featurebulk::db::{ConnectionPool, PoolOptions, PoolRole};
use featurebulk::dialect::{BackendKind, BoundingBox, DialectImpl};
use featurebulk::record::{FeatureReference, IterSource, VecSink};
use featurebulk::resolver::{PendingReference, Resolver};
use featurebulk::worker::{Worker, WorkerPool, WorkerPoolOptions};
use featurebulk::{
    BulkError, Config, ErrorKind, EventChannel, ExportFilter, ExportPipeline, FeatureRecord,
    IdCache, IdCacheConfig, ImportPipeline, JsonLinesSource, PipelineEvent, RunStatus,
};

fn pool_options(role: PoolRole, size: usize) -> PoolOptions {
    PoolOptions {
        role,
        size,
        acquire_timeout: Duration::from_secs(10),
        max_reconnect_attempts: 1,
    }
}

async fn sqlite_pool(dir: &TempDir, file: &str, role: PoolRole) -> ConnectionPool {
    ConnectionPool::sqlite(dir.path().join(file).to_str().unwrap(), pool_options(role, 4))
        .await
        .unwrap()
}

fn import_config(dir: &TempDir, threads: usize, queue_size: usize) -> Config {
    let yaml = format!(
        r#"
database:
  type: sqlite
  database: {target}
cache:
  backend: local
  path: {cache}
resources:
  threads: {threads}
  queue_size: {queue_size}
  writer_connections: {writers}
  reader_connections: {writers}
  cache_connections: 4
  acquire_timeout_secs: 30
  id_cache:
    cache_size: 4
    page_factor: 0.75
    partitions: 2
import:
  resolver_batch_size: 3
  reference_buffer: 2
"#,
        target = dir.path().join("target.db").display(),
        cache = dir.path().join("cache").display(),
        threads = threads,
        queue_size = queue_size,
        writers = threads + 1,
    );
    Config::from_yaml(&yaml).unwrap()
}

fn open_target(dir: &TempDir) -> rusqlite::Connection {
    rusqlite::Connection::open(dir.path().join("target.db")).unwrap()
}

fn feature_id(conn: &rusqlite::Connection, external_id: &str) -> i64 {
    conn.query_row(
        "SELECT id FROM feature WHERE external_id = ?1",
        [external_id],
        |r| r.get(0),
    )
    .unwrap()
}

fn link_target(conn: &rusqlite::Connection, origin: &str) -> Option<i64> {
    conn.query_row(
        "SELECT l.target_id FROM feature_link l JOIN feature f ON f.id = l.feature_id \
         WHERE f.external_id = ?1",
        [origin],
        |r| r.get(0),
    )
    .unwrap()
}

// =============================================================================
// Identifier Cache
// =============================================================================

#[tokio::test]
async fn test_id_cache_round_trip_through_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let cache_tables = Arc::new(CacheTableManager::new(
        sqlite_pool(&dir, "cache.db", PoolRole::Cache).await,
        "tmp_evict",
    ));
    let config = IdCacheConfig {
        cache_size: 4,
        page_factor: 0.75,
        partitions: Some(2),
    };
    let cache = IdCache::new(&config, 2, Arc::clone(&cache_tables), false);

    let ids_in = |partition: usize, count: usize| -> Vec<String> {
        (0..)
            .map(|n| format!("gml-{}", n))
            .filter(|id| cache.partition_of(id) == partition)
            .take(count)
            .collect()
    };
    let (p0, p1) = (ids_in(0, 3), ids_in(1, 2));
    // A, C, E land in partition 0; B, D in partition 1
    let inserted = [
        (&p0[0], 1),
        (&p1[0], 2),
        (&p0[1], 3),
        (&p1[1], 4),
    ];
    for (id, internal) in inserted {
        cache.put(id, internal).await.unwrap();
    }
    assert_eq!(cache.spilled().await, 0);
    assert_eq!(cache.in_memory().await, 4);

    // E brings partition 0 to ceil(4 * 0.75) = 3 entries; it spills down to
    // floor(3 * 0.75) = 2 while partition 1 keeps both of its entries
    cache.put(&p0[2], 5).await.unwrap();
    assert_eq!(cache.spilled().await, 1);
    assert_eq!(cache.in_memory().await, 4);
    assert_eq!(cache_tables.handles(CacheTableModel::IdCache).len(), 1);

    // A went to the backing table and is still found
    for (id, internal) in inserted.into_iter().chain([(&p0[2], 5)]) {
        assert_eq!(cache.get(id).await.unwrap(), Some(internal));
    }
    assert_eq!(cache.get("never-seen").await.unwrap(), None);

    assert!(cache.consume(&p0[0]).await.unwrap());
    assert!(cache.entry(&p0[0]).await.unwrap().unwrap().consumed);

    cache_tables.drop_all().await.unwrap();
}

#[tokio::test]
async fn test_id_cache_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let cache_tables = Arc::new(CacheTableManager::new(
        sqlite_pool(&dir, "cache.db", PoolRole::Cache).await,
        "tmp_dup",
    ));

    let lenient = IdCache::new(&IdCacheConfig::default(), 2, Arc::clone(&cache_tables), false);
    lenient.put("a", 1).await.unwrap();
    lenient.put("a", 7).await.unwrap();
    assert_eq!(lenient.get("a").await.unwrap(), Some(7));
    assert_eq!(lenient.duplicates(), 1);

    let strict = IdCache::new(&IdCacheConfig::default(), 2, cache_tables, true);
    strict.put("a", 1).await.unwrap();
    let err = strict.put("a", 7).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conversion);
    assert_eq!(strict.get("a").await.unwrap(), Some(1));
}

// =============================================================================
// Resolver
// =============================================================================

#[tokio::test]
async fn test_row_number_paging_reads_exact_batches() {
    let dir = tempfile::tempdir().unwrap();
    let target = sqlite_pool(&dir, "target.db", PoolRole::Writer).await;
    featurebulk::schema::ensure_schema(&target).await.unwrap();

    // A backend without LIMIT / FETCH FIRST pages with ROW_NUMBER()
    let cache_pool = sqlite_pool(&dir, "cache.db", PoolRole::Cache)
        .await
        .with_dialect(
            DialectImpl::for_kind(BackendKind::Sqlite)
                .with_capabilities(|caps| caps.supports_fetch_first = false),
        );
    let cache_tables = Arc::new(CacheTableManager::new(cache_pool, "tmp_rownum"));
    let id_cache = Arc::new(IdCache::new(
        &IdCacheConfig::default(),
        1,
        Arc::clone(&cache_tables),
        false,
    ));

    let handle = cache_tables
        .create(CacheTableModel::PendingReference, 0)
        .await
        .unwrap();
    let rows = (0..10)
        .map(|n| {
            PendingReference {
                origin_table: "feature_link".into(),
                origin_column: "target_id".into(),
                origin_id: n + 1,
                target_external_id: format!("t{}", n),
                payload: None,
            }
            .to_row()
        })
        .collect();
    cache_tables.insert_rows(&handle, rows).await.unwrap();

    // Every even target is known
    for n in (0..10).step_by(2) {
        id_cache.put(&format!("t{}", n), 100 + n).await.unwrap();
    }

    let resolver = Resolver::new(
        Arc::clone(&cache_tables),
        id_cache,
        target,
        3,
        EventChannel::new(),
        CancellationToken::new(),
    );
    let report = resolver.resolve_partition(&handle).await.unwrap();

    assert_eq!(report.batches, 4); // ceil(10 / 3)
    assert_eq!(report.resolved, 5);
    assert_eq!(report.remaining, 5);
    assert_eq!(cache_tables.count(&handle).await.unwrap(), 5);

    // Second sweep over the five survivors: ceil(5 / 3) batches
    let report = resolver.resolve_partition(&handle).await.unwrap();
    assert_eq!(report.batches, 2);
    assert_eq!(report.resolved, 0);

    cache_tables.drop_all().await.unwrap();
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Runs a statement that never finishes on its own.
struct Spinner {
    pool: ConnectionPool,
}

#[async_trait]
impl Worker for Spinner {
    type Task = ();

    async fn process(&mut self, _task: ()) -> featurebulk::Result<()> {
        let conn = self.pool.acquire().await?;
        conn.query_i64(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
             SELECT count(*) FROM c",
            &[],
        )
        .await?;
        Err(BulkError::Task("statement finished unexpectedly".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_now_interrupts_running_statements() {
    let dir = tempfile::tempdir().unwrap();
    let pool = sqlite_pool(&dir, "spin.db", PoolRole::Reader).await;

    let workers = (0..2).map(|_| Spinner { pool: pool.clone() }).collect();
    let mut workers = WorkerPool::start(
        workers,
        WorkerPoolOptions {
            queue_size: 4,
            submit_timeout: None,
        },
        CancellationToken::new(),
        EventChannel::new(),
    );
    workers.register_interruptible(pool.clone());

    workers.submit(()).await.unwrap();
    workers.submit(()).await.unwrap();
    workers.submit(()).await.unwrap();

    // Let both workers enter their statements
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.leased(), 2);

    let report = tokio::time::timeout(Duration::from_secs(5), workers.shutdown_now())
        .await
        .expect("workers did not stop after interrupt");
    assert!(report.fatal.is_none());
    assert_eq!(report.stats.processed, 0);
    assert_eq!(pool.leased(), 0);
}

// =============================================================================
// Import Pipeline
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_forward_references_resolve_in_first_pass() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ImportPipeline::new(import_config(&dir, 2, 4));
    let mut events = pipeline.events().subscribe();

    let records = vec![
        FeatureRecord::new("Building", "a").with_reference("neighbour", "b"),
        FeatureRecord::new("Building", "b").with_reference("neighbour", "a"),
    ];
    let summary = pipeline.run(IterSource::new(records)).await;

    assert_eq!(summary.status, RunStatus::Completed, "{:?}", summary.error);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.references, 2);
    // At most one of the two can find its target inline; the rest is
    // deferred and settled by the first pass
    assert!((1..=2).contains(&summary.resolved), "{}", summary.resolved);
    assert_eq!(summary.unresolved, 0);

    let conn = open_target(&dir);
    assert_eq!(link_target(&conn, "a"), Some(feature_id(&conn, "b")));
    assert_eq!(link_target(&conn, "b"), Some(feature_id(&conn, "a")));

    let passes: Vec<_> = events
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            PipelineEvent::ResolutionPassComplete { pass, resolved, .. } => Some((pass, resolved)),
            _ => None,
        })
        .collect();
    assert_eq!(passes, vec![(1, summary.resolved)]);
}

#[tokio::test]
async fn test_missing_target_is_unresolved_after_one_retry() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = ImportPipeline::new(import_config(&dir, 1, 4));
    let mut events = pipeline.events().subscribe();

    let mut parcel = FeatureRecord::new("Parcel", "p1");
    parcel.references.push(FeatureReference {
        role: "owner".into(),
        target: "ghost".into(),
        payload: Some("#ghost".into()),
    });
    let records = vec![
        parcel,
        FeatureRecord::new("Building", "b1").with_reference("parcel", "p1"),
    ];
    let summary = pipeline.run(IterSource::new(records)).await;

    assert_eq!(summary.status, RunStatus::Completed, "{:?}", summary.error);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.resolved, 0);
    assert_eq!(summary.unresolved, 1);

    let conn = open_target(&dir);
    assert_eq!(link_target(&conn, "p1"), None);
    assert_eq!(link_target(&conn, "b1"), Some(feature_id(&conn, "p1")));

    let events = events.drain();
    let passes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ResolutionPassComplete {
                pass, unresolvable, ..
            } => Some((*pass, *unresolvable)),
            _ => None,
        })
        .collect();
    assert_eq!(passes, vec![(1, 0), (2, 1)]);

    let unresolvable: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ReferenceUnresolvable {
                target_external_id, ..
            } => Some(target_external_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(unresolvable, vec!["ghost"]);
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::RunFinished { summary: s }) if s.unresolved == 1
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_loses_and_duplicates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    // Queue of one slot in front of three workers
    let pipeline = ImportPipeline::new(import_config(&dir, 3, 1));

    let records: Vec<_> = (0..200)
        .map(|n| {
            let record = FeatureRecord::new("Tree", format!("tree-{}", n))
                .with_geometry(format!("POINT({} {})", n, n));
            if n > 0 {
                record.with_reference("previous", format!("tree-{}", n - 1))
            } else {
                record
            }
        })
        .collect();
    let summary = pipeline.run(IterSource::new(records)).await;

    assert_eq!(summary.status, RunStatus::Completed, "{:?}", summary.error);
    assert_eq!(summary.processed, 200);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.unresolved, 0);

    let conn = open_target(&dir);
    let (rows, distinct): (i64, i64) = conn
        .query_row(
            "SELECT count(*), count(DISTINCT external_id) FROM feature",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!((rows, distinct), (200, 200));

    let dangling: i64 = conn
        .query_row(
            "SELECT count(*) FROM feature_link WHERE target_id IS NULL",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(dangling, 0);

    // Cache tables were removed with the local cache file
    let cache_dir = dir.path().join("cache");
    assert_eq!(std::fs::read_dir(cache_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_unreadable_and_invalid_records_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.csv");
    let mut config = import_config(&dir, 2, 4);
    config.import.audit_log = Some(audit.to_string_lossy().into_owned());
    let pipeline = ImportPipeline::new(config);

    let input = concat!(
        r#"{"feature_type":"Road","external_id":"r1"}"#,
        "\n",
        "{ broken\n",
        r#"{"feature_type":"Road","external_id":""}"#,
        "\n",
        r#"{"feature_type":"Road","external_id":"r2","properties":{"lanes":2}}"#,
        "\n",
    );
    let summary = pipeline
        .run(JsonLinesSource::new(input.as_bytes()))
        .await;

    assert_eq!(summary.status, RunStatus::Completed, "{:?}", summary.error);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 1);

    let mut lines: Vec<String> = std::fs::read_to_string(&audit)
        .unwrap()
        .lines()
        .map(|l| l.split(',').skip(2).collect::<Vec<_>>().join(","))
        .collect();
    lines.sort();
    assert_eq!(lines, vec!["r1", "r2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_strict_duplicates_leave_no_rows_behind() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = import_config(&dir, 4, 4);
    config.import.strict_unique_ids = true;

    let records: Vec<_> = (0..40)
        .map(|_| FeatureRecord::new("Tree", "dup").with_reference("next", "dup"))
        .collect();
    let summary = ImportPipeline::new(config)
        .run(IterSource::new(records))
        .await;

    assert_eq!(summary.status, RunStatus::Completed, "{:?}", summary.error);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 39);

    let conn = open_target(&dir);
    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |r| r.get(0)).unwrap() };
    assert_eq!(count("SELECT count(*) FROM feature"), 1);
    assert_eq!(count("SELECT count(*) FROM feature_link"), 1);
}

#[tokio::test]
async fn test_cancelled_import_still_reports() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline = ImportPipeline::new(import_config(&dir, 2, 4)).with_cancellation(cancel);

    let summary = pipeline
        .run(IterSource::new(vec![FeatureRecord::new("Road", "r1")]))
        .await;

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.processed, 0);
}

// =============================================================================
// Export Pipeline
// =============================================================================

#[tokio::test]
async fn test_export_reassembles_imported_features() {
    let dir = tempfile::tempdir().unwrap();
    let config = import_config(&dir, 2, 4);

    let records = vec![
        FeatureRecord::new("Parcel", "p1")
            .with_geometry("POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))")
            .with_properties(serde_json::json!({"area": 1.0})),
        FeatureRecord::new("Building", "b1")
            .with_geometry("POINT(0.5 0.5)")
            .with_reference("parcel", "p1"),
        FeatureRecord::new("Building", "b2").with_reference("parcel", "p1"),
    ];
    let imported = ImportPipeline::new(config.clone())
        .run(IterSource::new(records))
        .await;
    assert!(imported.is_success(), "{:?}", imported.error);

    let mut sink = VecSink::default();
    let summary = ExportPipeline::new(config)
        .with_page_size(1)
        .with_filter(ExportFilter {
            feature_type: Some("Building".into()),
            // SQLite has no spatial predicates; the box is ignored
            bbox: Some(BoundingBox {
                min_x: 10.0,
                min_y: 10.0,
                max_x: 11.0,
                max_y: 11.0,
            }),
        })
        .run(&mut sink)
        .await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(summary.processed, 2);

    let mut exported = sink.records;
    exported.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    assert_eq!(exported.len(), 2);
    assert_eq!(exported[0].external_id, "b1");
    assert_eq!(
        exported[0].geometry.as_ref().map(|g| g.wkt.as_str()),
        Some("POINT(0.5 0.5)")
    );
    assert_eq!(exported[0].references[0].target, "p1");
    assert_eq!(exported[1].geometry, None);
}

/// Sink that fails every write after a delay.
struct FailingSink;

#[async_trait]
impl featurebulk::RecordSink for FailingSink {
    async fn write(&mut self, _record: FeatureRecord) -> featurebulk::Result<()> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Err(BulkError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "sink closed",
        )))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_export_stops_when_sink_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = import_config(&dir, 4, 1);

    let records: Vec<_> = (0..20)
        .map(|n| FeatureRecord::new("Tree", format!("tree-{}", n)))
        .collect();
    let imported = ImportPipeline::new(config.clone())
        .run(IterSource::new(records))
        .await;
    assert!(imported.is_success(), "{:?}", imported.error);

    let mut sink = FailingSink;
    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        ExportPipeline::new(config).run(&mut sink),
    )
    .await
    .expect("export did not return after the sink failed");

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.unwrap().contains("sink closed"));
}
