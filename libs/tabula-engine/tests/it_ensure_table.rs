use std::sync::Arc;

use tabula_api::{ColumnType, ErrorKind, TableError, TableSchema};
use tabula_coordination::{CoordinationService, InstanceId, MemoryCoordinationService};
use tabula_engine::{DestinationConfig, EnsureTableError, TableHelper};
use tabula_storage_memory::{MemoryWarehouse, PkPolicy};

const DEST: &str = "pg_main";

struct Fixture {
    warehouse: Arc<MemoryWarehouse>,
    coordination: Arc<MemoryCoordinationService>,
}

impl Fixture {
    fn new(policy: PkPolicy) -> Self {
        Self {
            warehouse: Arc::new(MemoryWarehouse::new(policy)),
            coordination: Arc::new(MemoryCoordinationService::new(
                InstanceId::new("it-node").expect("valid id"),
            )),
        }
    }

    /// A reconciler with its own cache, as a separate server process would have.
    fn helper(&self, config: DestinationConfig) -> TableHelper {
        TableHelper::new(config, self.warehouse.clone(), self.coordination.clone())
    }
}

fn public() -> DestinationConfig {
    DestinationConfig {
        schema: "public".into(),
        ..Default::default()
    }
}

fn public_with_pk(fields: &[&str]) -> DestinationConfig {
    DestinationConfig {
        primary_key_fields: fields.iter().map(|f| f.to_string()).collect(),
        ..public()
    }
}

fn events(columns: &[&str]) -> TableSchema {
    columns
        .iter()
        .fold(TableSchema::new("events"), |t, c| t.with_column(*c, ColumnType::new("TEXT")))
}

fn column_names(table: &TableSchema) -> Vec<&str> {
    table.columns.keys().map(String::as_str).collect()
}

#[tokio::test]
async fn second_identical_request_hits_the_cache() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public());
    let desired = events(&["id", "name"]);
    let first = helper.ensure_table(DEST, &desired).await.expect("first ensure");
    let calls_after_first = (fx.warehouse.get_calls(), fx.warehouse.ddl_calls());

    //* When
    let second = helper.ensure_table(DEST, &desired).await.expect("second ensure");

    //* Then
    assert_eq!(first, second);
    assert_eq!(fx.warehouse.create_calls(), 1);
    assert_eq!((fx.warehouse.get_calls(), fx.warehouse.ddl_calls()), calls_after_first);
    assert_eq!(second.version, 1);
}

#[tokio::test]
async fn subset_of_cached_columns_needs_no_lock() {
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public());
    helper.ensure_table(DEST, &events(&["id", "name", "email"])).await.expect("ensure");
    let gets = fx.warehouse.get_calls();
    let held = fx.coordination.try_lock(DEST, "events").await.expect("take the lock");

    let schema = helper.ensure_table(DEST, &events(&["email"])).await.expect("fast path");

    assert_eq!(column_names(&schema), ["email", "id", "name"]);
    assert_eq!(fx.warehouse.get_calls(), gets);
    fx.coordination.unlock(&held).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_writers_converge_on_one_table() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let writers: Vec<_> = (0..8)
        .map(|i| {
            let helper = fx.helper(public());
            let desired = events(&["id", "ts", &format!("col_{i}")]);
            tokio::spawn(async move { helper.ensure_table(DEST, &desired).await })
        })
        .collect();

    //* When
    let mut results = Vec::new();
    for writer in writers {
        results.push(writer.await.expect("task joins").expect("ensure succeeds"));
    }

    //* Then
    assert_eq!(fx.warehouse.create_calls(), 1, "exactly one table creation");
    assert!(!fx.warehouse.overlap_detected(), "DDL never overlapped");
    let table = fx.warehouse.table("events").await.expect("table exists");
    let mut expected: Vec<String> = (0..8).map(|i| format!("col_{i}")).collect();
    expected.extend(["id".to_string(), "ts".to_string()]);
    expected.sort();
    assert_eq!(table.columns.keys().cloned().collect::<Vec<_>>(), expected);
    for (i, schema) in results.iter().enumerate() {
        assert!(schema.columns.contains_key(&format!("col_{i}")));
    }
}

#[tokio::test]
async fn foreign_primary_key_is_never_dropped() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    fx.warehouse
        .seed_table(events(&["id", "name"]).with_primary_key("events_pkey", ["id"]))
        .await;
    let helper = fx.helper(public());

    //* When
    let err = helper
        .ensure_table(DEST, &events(&["id", "name", "email"]))
        .await
        .expect_err("foreign key blocks reconciliation");

    //* Then
    assert!(matches!(
        &err,
        EnsureTableError::PrimaryKeyConflict { key_name, .. } if key_name == "events_pkey"
    ));
    assert!(err.is_primary_key_conflict());
    assert_eq!(fx.warehouse.ddl_calls(), 0);
    let table = fx.warehouse.table("events").await.expect("table");
    assert_eq!(table.primary_key_name.as_deref(), Some("events_pkey"));
    assert!(helper.cached_table(DEST, "events").is_none());
    assert!(!fx.coordination.is_locked(DEST, "events").await.expect("is_locked"));
}

#[tokio::test]
async fn foreign_primary_key_on_configured_fields_is_accepted() {
    let fx = Fixture::new(PkPolicy::Refuse);
    fx.warehouse
        .seed_table(events(&["id"]).with_primary_key("PRIMARY", ["id"]))
        .await;
    let helper = fx.helper(public_with_pk(&["id"]));

    let schema = helper
        .ensure_table(DEST, &events(&["id", "name"]).with_primary_key("public_events_pk", ["id"]))
        .await
        .expect("same fields are compatible");

    assert_eq!(fx.warehouse.pk_calls(), 0);
    assert_eq!(schema.primary_key_name.as_deref(), Some("PRIMARY"));
    assert_eq!(column_names(&schema), ["id", "name"]);
}

#[tokio::test]
async fn managed_primary_key_is_dropped_when_unconfigured() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let with_pk = fx.helper(public_with_pk(&["id"]));
    let header_pk = with_pk.config().managed_primary_key_name("events");
    with_pk
        .ensure_table(DEST, &events(&["id"]).with_primary_key(header_pk, ["id"]))
        .await
        .expect("create with key");

    //* When
    let without_pk = fx.helper(public());
    let schema = without_pk.ensure_table(DEST, &events(&["id"])).await.expect("drop key");

    //* Then
    assert!(schema.primary_key_fields.is_empty());
    let table = fx.warehouse.table("events").await.expect("table");
    assert!(table.primary_key_fields.is_empty());
    assert_eq!(fx.warehouse.pk_calls(), 1);
    assert_eq!(schema.version, 2);
}

#[tokio::test]
async fn managed_primary_key_is_replaced_when_fields_change() {
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public_with_pk(&["id"]));
    helper
        .ensure_table(DEST, &events(&["id", "ts"]).with_primary_key("public_events_pk", ["id"]))
        .await
        .expect("create");

    let schema = helper
        .ensure_table(DEST, &events(&["id", "ts"]).with_primary_key("public_events_pk", ["id", "ts"]))
        .await
        .expect("replace key");

    assert_eq!(schema.primary_key_fields.len(), 2);
    assert_eq!(fx.warehouse.table("events").await.expect("table").primary_key_fields.len(), 2);
}

#[tokio::test]
async fn failed_ddl_leaves_cache_and_version_untouched() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public());
    fx.warehouse.fail_next_ddl(TableError::io("connection reset by peer"));

    //* When
    let err = helper
        .ensure_table(DEST, &events(&["id"]))
        .await
        .expect_err("DDL fails");

    //* Then
    assert!(matches!(&err, EnsureTableError::Ddl { source, .. } if source.kind() == ErrorKind::Io));
    assert!(err.is_transient());
    assert!(helper.cached_table(DEST, "events").is_none());
    assert_eq!(fx.coordination.get_version(DEST, "events").await.expect("version"), 0);
    assert!(!fx.coordination.is_locked(DEST, "events").await.expect("is_locked"));

    let retried = helper.ensure_table(DEST, &events(&["id"])).await.expect("retry succeeds");
    assert_eq!(retried.version, 1);
    assert_eq!(fx.warehouse.create_calls(), 2);
}

#[tokio::test]
async fn column_limit_counts_existing_columns() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    fx.warehouse.seed_table(events(&["a", "b"])).await;
    let helper = fx.helper(DestinationConfig {
        max_columns: 3,
        ..public()
    });

    //* When
    let err = helper
        .ensure_table(DEST, &events(&["a", "c", "d"]))
        .await
        .expect_err("four columns exceed three");

    //* Then
    assert!(matches!(err, EnsureTableError::TooManyColumns { count: 4, max: 3, .. }));
    assert_eq!(fx.warehouse.ddl_calls(), 0);
}

#[tokio::test]
async fn stream_path_falls_back_to_cache_while_locked() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public());
    helper.ensure_table_stream(DEST, &events(&["id"])).await.expect("create via stream");
    let held = fx.coordination.try_lock(DEST, "events").await.expect("someone else locks");

    //* When
    let schema = helper
        .ensure_table_stream(DEST, &events(&["id", "late_column"]))
        .await
        .expect("falls back to cache");

    //* Then
    assert_eq!(column_names(&schema), ["id"]);
    assert_eq!(fx.warehouse.patch_calls(), 0);
    fx.coordination.unlock(&held).await;
}

#[tokio::test]
async fn stream_path_without_cache_reports_contention() {
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public());
    let held = fx.coordination.try_lock(DEST, "events").await.expect("someone else locks");

    let err = helper
        .ensure_table_stream(DEST, &events(&["id"]))
        .await
        .expect_err("nothing cached to fall back to");

    assert!(matches!(&err, EnsureTableError::Coordination { source, .. } if source.is_already_locked()));
    assert_eq!(fx.warehouse.get_calls(), 0);
    fx.coordination.unlock(&held).await;
}

#[tokio::test]
async fn stale_cache_is_refreshed_from_version_counter() {
    //* Given
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let node_a = fx.helper(public());
    let node_b = fx.helper(public());
    node_a.ensure_table(DEST, &events(&["id"])).await.expect("a creates");
    node_b.ensure_table(DEST, &events(&["id"])).await.expect("b caches");
    node_a.ensure_table(DEST, &events(&["id", "email"])).await.expect("a adds a column");

    //* When
    let refreshed = node_b.refresh_if_stale(DEST, "events").await.expect("refresh");
    let again = node_b.refresh_if_stale(DEST, "events").await.expect("refresh");

    //* Then
    assert!(refreshed);
    assert!(!again);
    let cached = node_b.cached_table(DEST, "events").expect("cached");
    assert_eq!(column_names(&cached), ["email", "id"]);
    assert_eq!(cached.version, 2);
}

#[tokio::test]
async fn clear_cache_forces_a_warehouse_read() {
    let fx = Fixture::new(PkPolicy::TrackOwnership);
    let helper = fx.helper(public());
    helper.ensure_table(DEST, &events(&["id"])).await.expect("create");
    let gets = fx.warehouse.get_calls();

    helper.clear_cache();
    let schema = helper.ensure_table(DEST, &events(&["id"])).await.expect("re-verify");

    assert_eq!(fx.warehouse.get_calls(), gets + 1);
    assert_eq!(fx.warehouse.ddl_calls(), 1);
    assert_eq!(schema.version, 1);
}
