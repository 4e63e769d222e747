use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;

use tabula_api::{BoxFuture, TableError, TableManager, TableSchema};

// ═══════════════════════════════════════════════════════════════
//  MemoryWarehouseConfig
// ═══════════════════════════════════════════════════════════════

/// How the warehouse treats a primary key it finds on a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkPolicy {
    /// MySQL-like: an existing key is never replaced. It may be dropped
    /// only by its own name.
    Refuse,
    /// Postgres-like: an existing key may be replaced or dropped only by a
    /// request that names it.
    #[default]
    TrackOwnership,
}

fn default_ddl_delay_ms() -> u64 {
    5
}

#[derive(Debug, serde::Deserialize)]
pub struct MemoryWarehouseConfig {
    #[serde(default)]
    pub pk_policy: PkPolicy,
    /// Simulated DDL latency. Widens the window in which overlapping DDL
    /// would be observed.
    #[serde(default = "default_ddl_delay_ms")]
    pub ddl_delay_ms: u64,
}

impl Default for MemoryWarehouseConfig {
    fn default() -> Self {
        Self {
            pk_policy: PkPolicy::default(),
            ddl_delay_ms: default_ddl_delay_ms(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  MemoryWarehouse
// ═══════════════════════════════════════════════════════════════

/// In-process warehouse. Tables live in a map; DDL is simulated with a
/// short delay and recorded so callers can assert on it.
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<String, TableSchema>>,
    policy: PkPolicy,
    ddl_delay: Duration,
    ddl_in_flight: AtomicUsize,
    overlap: AtomicBool,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    patch_calls: AtomicUsize,
    pk_calls: AtomicUsize,
    next_failure: Mutex<Option<TableError>>,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::from_config(&MemoryWarehouseConfig::default())
    }
}

impl MemoryWarehouse {
    pub fn new(policy: PkPolicy) -> Self {
        Self::from_config(&MemoryWarehouseConfig {
            pk_policy: policy,
            ..Default::default()
        })
    }

    pub fn from_config(config: &MemoryWarehouseConfig) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            policy: config.pk_policy,
            ddl_delay: Duration::from_millis(config.ddl_delay_ms),
            ddl_in_flight: AtomicUsize::new(0),
            overlap: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            patch_calls: AtomicUsize::new(0),
            pk_calls: AtomicUsize::new(0),
            next_failure: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> PkPolicy {
        self.policy
    }

    /// Pre-load a table as if something else had created it.
    pub async fn seed_table(&self, schema: TableSchema) {
        let mut schema = schema;
        schema.delete_primary_key = false;
        schema.version = 0;
        self.tables.write().await.insert(schema.name.clone(), schema);
    }

    /// The next DDL call fails with `err` and changes nothing.
    pub fn fail_next_ddl(&self, err: TableError) {
        *self.failure_slot() = Some(err);
    }

    /// Current definition, without counting as a `get_table_schema` call.
    pub async fn table(&self, name: &str) -> Option<TableSchema> {
        self.tables.read().await.get(name).cloned()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn patch_calls(&self) -> usize {
        self.patch_calls.load(Ordering::SeqCst)
    }

    pub fn pk_calls(&self) -> usize {
        self.pk_calls.load(Ordering::SeqCst)
    }

    /// Total of create, patch and primary-key calls.
    pub fn ddl_calls(&self) -> usize {
        self.create_calls() + self.patch_calls() + self.pk_calls()
    }

    /// Whether two DDL calls were ever in progress at the same time.
    pub fn overlap_detected(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }

    fn failure_slot(&self) -> std::sync::MutexGuard<'_, Option<TableError>> {
        match self.next_failure.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("memory warehouse failure slot was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Mark a DDL call as running, simulate its latency and consume an
    /// injected failure. The returned guard ends the call when dropped.
    async fn begin_ddl(&self, op: &'static str, table: &str) -> Result<DdlGuard<'_>, TableError> {
        let guard = DdlGuard::enter(self);
        if !self.ddl_delay.is_zero() {
            tokio::time::sleep(self.ddl_delay).await;
        }
        if let Some(err) = self.failure_slot().take() {
            tracing::debug!(op, table, error = %err, "injected DDL failure");
            return Err(err.with_context(format!("{op} '{table}'")));
        }
        Ok(guard)
    }
}

struct DdlGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl<'a> DdlGuard<'a> {
    fn enter(warehouse: &'a MemoryWarehouse) -> Self {
        if warehouse.ddl_in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            tracing::warn!("overlapping DDL detected");
            warehouse.overlap.store(true, Ordering::SeqCst);
        }
        Self {
            in_flight: &warehouse.ddl_in_flight,
        }
    }
}

impl Drop for DdlGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn missing_table(name: &str) -> TableError {
    TableError::ddl(format!("table '{name}' does not exist"))
}

impl TableManager for MemoryWarehouse {
    fn get_table_schema<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<TableSchema, TableError>> {
        Box::pin(async move {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let tables = self.tables.read().await;
            Ok(tables
                .get(name)
                .cloned()
                .unwrap_or_else(|| TableSchema::new(name)))
        })
    }

    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(async move {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let _ddl = self.begin_ddl("create_table", &schema.name).await?;

            if schema.columns.is_empty() {
                return Err(TableError::ddl(format!("table '{}' has no columns", schema.name)));
            }
            if let Some(field) = schema.primary_key_fields.iter().find(|f| !schema.columns.contains_key(*f)) {
                return Err(TableError::config(format!(
                    "primary key field '{field}' is not a column of '{}'",
                    schema.name
                )));
            }

            let mut tables = self.tables.write().await;
            if tables.contains_key(&schema.name) {
                return Err(TableError::ddl(format!("table '{}' already exists", schema.name)));
            }
            let mut created = schema.clone();
            created.delete_primary_key = false;
            created.version = 0;
            if created.primary_key_fields.is_empty() {
                created.primary_key_name = None;
            }
            tables.insert(created.name.clone(), created);
            tracing::debug!(table = %schema.name, columns = schema.columns.len(), "table created");
            Ok(())
        })
    }

    fn patch_table_schema<'a>(&'a self, patch: &'a TableSchema) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(async move {
            self.patch_calls.fetch_add(1, Ordering::SeqCst);
            let _ddl = self.begin_ddl("patch_table_schema", &patch.name).await?;

            let mut tables = self.tables.write().await;
            let table = tables.get_mut(&patch.name).ok_or_else(|| missing_table(&patch.name))?;
            if let Some(existing) = patch.columns.keys().find(|c| table.columns.contains_key(*c)) {
                return Err(TableError::ddl(format!(
                    "column '{existing}' already exists in '{}'",
                    patch.name
                )));
            }
            for (name, column_type) in &patch.columns {
                table.columns.insert(name.clone(), column_type.clone());
            }
            tracing::debug!(table = %patch.name, added = patch.columns.len(), "columns added");
            Ok(())
        })
    }

    fn update_primary_key<'a>(&'a self, patch: &'a TableSchema) -> BoxFuture<'a, Result<(), TableError>> {
        Box::pin(async move {
            self.pk_calls.fetch_add(1, Ordering::SeqCst);
            let _ddl = self.begin_ddl("update_primary_key", &patch.name).await?;

            let mut tables = self.tables.write().await;
            let table = tables.get_mut(&patch.name).ok_or_else(|| missing_table(&patch.name))?;
            let names_current = table.primary_key_name.is_some() && table.primary_key_name == patch.primary_key_name;
            let has_key = !table.primary_key_fields.is_empty();

            if patch.delete_primary_key {
                if !has_key {
                    return Ok(());
                }
                if !names_current {
                    return Err(TableError::primary_key_conflict(format!(
                        "refusing to drop primary key {:?} of '{}' by name {:?}",
                        table.primary_key_name, patch.name, patch.primary_key_name
                    )));
                }
                table.primary_key_fields.clear();
                table.primary_key_name = None;
                tracing::debug!(table = %patch.name, "primary key dropped");
                return Ok(());
            }

            if patch.primary_key_fields.is_empty() {
                return Err(TableError::new("primary key patch carries no fields"));
            }
            if let Some(field) = patch.primary_key_fields.iter().find(|f| !table.columns.contains_key(*f)) {
                return Err(TableError::config(format!(
                    "primary key field '{field}' is not a column of '{}'",
                    patch.name
                )));
            }
            if has_key {
                let replace_allowed = match self.policy {
                    PkPolicy::Refuse => false,
                    PkPolicy::TrackOwnership => names_current,
                };
                if !replace_allowed {
                    return Err(TableError::primary_key_conflict(format!(
                        "'{}' already has primary key {:?} on {:?}",
                        patch.name, table.primary_key_name, table.primary_key_fields
                    )));
                }
            }

            table.primary_key_fields = patch.primary_key_fields.clone();
            table.primary_key_name = patch.primary_key_name.clone();
            tracing::debug!(table = %patch.name, fields = ?patch.primary_key_fields, "primary key set");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tabula_api::{ColumnType, ErrorKind};

    use super::*;

    fn events(columns: &[&str]) -> TableSchema {
        columns.iter().fold(TableSchema::new("events"), |t, c| {
            t.with_column(*c, ColumnType::new("TEXT"))
        })
    }

    fn pk_patch(key_name: &str, fields: &[&str]) -> TableSchema {
        TableSchema::new("events").with_primary_key(key_name, fields.iter().copied())
    }

    #[tokio::test]
    async fn absent_table_reads_as_not_existing() {
        let warehouse = MemoryWarehouse::default();

        let schema = warehouse.get_table_schema("events").await.expect("get");

        assert_eq!(schema.name, "events");
        assert!(!schema.exists());
        assert_eq!(warehouse.get_calls(), 1);
    }

    #[tokio::test]
    async fn create_then_patch_adds_columns() {
        //* Given
        let warehouse = MemoryWarehouse::default();
        warehouse.create_table(&events(&["id"])).await.expect("create");

        //* When
        warehouse.patch_table_schema(&events(&["email"])).await.expect("patch");

        //* Then
        let table = warehouse.table("events").await.expect("table exists");
        assert_eq!(table.columns.keys().collect::<Vec<_>>(), ["email", "id"]);
        assert_eq!((warehouse.create_calls(), warehouse.patch_calls()), (1, 1));
    }

    #[tokio::test]
    async fn create_twice_is_a_ddl_error() {
        let warehouse = MemoryWarehouse::default();
        warehouse.create_table(&events(&["id"])).await.expect("create");

        let err = warehouse.create_table(&events(&["id"])).await.expect_err("duplicate");

        assert_eq!(err.kind(), ErrorKind::Ddl);
    }

    #[tokio::test]
    async fn injected_failure_applies_once_and_changes_nothing() {
        //* Given
        let warehouse = MemoryWarehouse::default();
        warehouse.fail_next_ddl(TableError::io("connection reset"));

        //* When
        let first = warehouse.create_table(&events(&["id"])).await;
        let second = warehouse.create_table(&events(&["id"])).await;

        //* Then
        let first = first.expect_err("injected");
        assert_eq!(first.kind(), ErrorKind::Io);
        assert_eq!(first.message(), "create_table 'events': connection reset");
        assert!(second.is_ok());
        assert_eq!(warehouse.create_calls(), 2);
    }

    #[tokio::test]
    async fn key_on_missing_column_is_a_config_error() {
        //* Given
        let warehouse = MemoryWarehouse::new(PkPolicy::Refuse);
        warehouse.seed_table(events(&["id"])).await;

        //* When
        let other = TableSchema::new("other")
            .with_column("id", ColumnType::new("TEXT"))
            .with_primary_key("other_pk", ["user_id"]);
        let create = warehouse.create_table(&other).await;
        let update = warehouse.update_primary_key(&pk_patch("events_pk", &["user_id"])).await;

        //* Then
        assert_eq!(create.expect_err("missing column").kind(), ErrorKind::Config);
        assert_eq!(update.expect_err("missing column").kind(), ErrorKind::Config);
        assert_eq!(warehouse.policy(), PkPolicy::Refuse);
        assert!(warehouse.table("other").await.is_none());
    }

    #[tokio::test]
    async fn track_ownership_replaces_only_named_key() {
        //* Given
        let warehouse = MemoryWarehouse::new(PkPolicy::TrackOwnership);
        warehouse
            .seed_table(events(&["id", "ts"]).with_primary_key("legacy_pk", ["id"]))
            .await;

        //* When
        let foreign = warehouse.update_primary_key(&pk_patch("public_events_pk", &["id", "ts"])).await;
        let owned = warehouse.update_primary_key(&pk_patch("legacy_pk", &["id", "ts"])).await;

        //* Then
        assert_eq!(foreign.expect_err("foreign key").kind(), ErrorKind::PrimaryKeyConflict);
        owned.expect("named key is replaced");
        let table = warehouse.table("events").await.expect("table");
        assert_eq!(table.primary_key_fields.len(), 2);
    }

    #[tokio::test]
    async fn refuse_never_replaces_existing_key() {
        let warehouse = MemoryWarehouse::new(PkPolicy::Refuse);
        warehouse
            .seed_table(events(&["id", "ts"]).with_primary_key("events_pk", ["id"]))
            .await;

        let err = warehouse
            .update_primary_key(&pk_patch("events_pk", &["id", "ts"]))
            .await
            .expect_err("refused");

        assert_eq!(err.kind(), ErrorKind::PrimaryKeyConflict);
    }

    #[tokio::test]
    async fn drop_requires_key_name() {
        //* Given
        let warehouse = MemoryWarehouse::new(PkPolicy::Refuse);
        warehouse
            .seed_table(events(&["id"]).with_primary_key("events_pk", ["id"]))
            .await;
        let mut wrong = TableSchema::new("events");
        wrong.delete_primary_key = true;
        wrong.primary_key_name = Some("other_pk".into());
        let mut right = wrong.clone();
        right.primary_key_name = Some("events_pk".into());

        //* When
        let refused = warehouse.update_primary_key(&wrong).await;
        let dropped = warehouse.update_primary_key(&right).await;

        //* Then
        assert_eq!(refused.expect_err("wrong name").kind(), ErrorKind::PrimaryKeyConflict);
        dropped.expect("drop by name");
        assert!(warehouse.table("events").await.expect("table").primary_key_fields.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ddl_is_reported_as_overlap() {
        //* Given
        let warehouse = Arc::new(MemoryWarehouse::from_config(&MemoryWarehouseConfig {
            pk_policy: PkPolicy::TrackOwnership,
            ddl_delay_ms: 50,
        }));
        warehouse.seed_table(events(&["id"])).await;

        //* When
        let a = tokio::spawn({
            let warehouse = warehouse.clone();
            async move { warehouse.patch_table_schema(&events(&["a"])).await }
        });
        let b = tokio::spawn({
            let warehouse = warehouse.clone();
            async move { warehouse.patch_table_schema(&events(&["b"])).await }
        });
        a.await.expect("join").expect("patch a");
        b.await.expect("join").expect("patch b");

        //* Then
        assert!(warehouse.overlap_detected());
    }

    #[test]
    fn config_defaults_from_empty_json() {
        let config: MemoryWarehouseConfig = serde_json::from_str("{}").expect("valid config");

        assert_eq!(config.pk_policy, PkPolicy::TrackOwnership);
        assert_eq!(config.ddl_delay_ms, 5);
    }
}
