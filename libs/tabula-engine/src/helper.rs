use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tabula_api::{BatchHeader, Field, TableManager, TableSchema};
use tabula_coordination::{CoordinationLock, CoordinationService};

use crate::config::DestinationConfig;
use crate::error::EnsureTableError;

type CacheKey = (String, String);

/// Schema reconciler for one warehouse.
///
/// Keeps the last verified definition of every `(destination, table)` and
/// only takes the coordination lock when a request asks for something the
/// cached definition lacks. All DDL for a table runs under its lock, so
/// DDL is serialized per table across every process sharing the
/// coordination backend.
pub struct TableHelper {
    config: DestinationConfig,
    manager: Arc<dyn TableManager>,
    coordination: Arc<dyn CoordinationService>,
    cache: RwLock<HashMap<CacheKey, TableSchema>>,
}

impl TableHelper {
    pub fn new(
        config: DestinationConfig,
        manager: Arc<dyn TableManager>,
        coordination: Arc<dyn CoordinationService>,
    ) -> Self {
        Self {
            config,
            manager,
            coordination,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════
    //  Mapping
    // ═══════════════════════════════════════════════════════════════

    /// Desired table for `header`: one column per field, typed through the
    /// destination's overrides and type mapping, plus the configured
    /// primary key under its managed name.
    ///
    /// Pure: touches neither the cache nor coordination.
    pub fn map_table_schema(&self, destination_id: &str, header: &BatchHeader) -> Result<TableSchema, EnsureTableError> {
        let table = header.table_name.as_str();
        let mut schema = TableSchema::new(table);

        // Fields that normalize to one column share it, so their types widen together.
        let mut columns: BTreeMap<String, Field> = BTreeMap::new();
        for (name, field) in header.fields.iter() {
            columns
                .entry(self.config.column_name_style.apply(name))
                .and_modify(|merged| merged.merge(field))
                .or_insert_with(|| field.clone());
        }

        for (column, field) in columns {
            let column_type = match self.config.column_type_override(&column) {
                Some(column_type) => column_type,
                None => {
                    let data_type = field.resolve().map_err(|source| EnsureTableError::Schema {
                        destination: destination_id.to_string(),
                        table: table.to_string(),
                        source,
                    })?;
                    self.config
                        .type_mapping
                        .column_type(data_type)
                        .cloned()
                        .ok_or_else(|| EnsureTableError::TypeMapping {
                            destination: destination_id.to_string(),
                            table: table.to_string(),
                            data_type,
                        })?
                }
            };
            schema.columns.insert(column, column_type);
        }

        let pk_fields = self.config.normalized_primary_key_fields();
        if !pk_fields.is_empty() {
            schema = schema.with_primary_key(self.config.managed_primary_key_name(table), pk_fields);
        }
        Ok(schema)
    }

    // ═══════════════════════════════════════════════════════════════
    //  EnsureTable
    // ═══════════════════════════════════════════════════════════════

    /// Make sure `desired` exists in the warehouse, waiting for the table
    /// lock if DDL is needed. Returns the verified current definition, a
    /// superset of `desired`'s columns.
    pub async fn ensure_table(&self, destination_id: &str, desired: &TableSchema) -> Result<TableSchema, EnsureTableError> {
        if let Some(cached) = self.fast_path(destination_id, desired) {
            return Ok(cached);
        }
        self.check_cached_column_limit(destination_id, desired)?;

        let lock = self
            .coordination
            .lock(destination_id, &desired.name)
            .await
            .map_err(|e| EnsureTableError::coordination(destination_id, &desired.name, e))?;
        self.reconcile_and_release(destination_id, desired, lock).await
    }

    /// Like [`ensure_table`](Self::ensure_table) but never waits for the
    /// lock. If someone else holds it, returns the cached definition so the
    /// caller can keep streaming, and fails only when nothing is cached.
    pub async fn ensure_table_stream(
        &self,
        destination_id: &str,
        desired: &TableSchema,
    ) -> Result<TableSchema, EnsureTableError> {
        if let Some(cached) = self.fast_path(destination_id, desired) {
            return Ok(cached);
        }
        self.check_cached_column_limit(destination_id, desired)?;

        match self.coordination.try_lock(destination_id, &desired.name).await {
            Ok(lock) => self.reconcile_and_release(destination_id, desired, lock).await,
            Err(e) if e.is_already_locked() => match self.cached_table(destination_id, &desired.name) {
                Some(cached) => {
                    tracing::warn!(
                        destination = destination_id,
                        table = %desired.name,
                        "table is locked by another writer, continuing with cached schema"
                    );
                    Ok(cached)
                }
                None => Err(EnsureTableError::coordination(destination_id, &desired.name, e)),
            },
            Err(e) => Err(EnsureTableError::coordination(destination_id, &desired.name, e)),
        }
    }

    /// Cached definition, if it already covers `desired`.
    fn fast_path(&self, destination_id: &str, desired: &TableSchema) -> Option<TableSchema> {
        let cache = self.read_cache();
        let key = cache_key(destination_id, &desired.name);
        match cache.get(&key) {
            Some(cached) => (!cached.diff(desired).exists()).then(|| cached.clone()),
            None => (!TableSchema::new(desired.name.as_str()).diff(desired).exists())
                .then(|| TableSchema::new(desired.name.as_str())),
        }
    }

    fn check_cached_column_limit(&self, destination_id: &str, desired: &TableSchema) -> Result<(), EnsureTableError> {
        let cache = self.read_cache();
        let current = cache.get(&cache_key(destination_id, &desired.name));
        self.check_column_limit(destination_id, current, desired)
    }

    /// Union of existing and requested columns against `max_columns`.
    fn check_column_limit(
        &self,
        destination_id: &str,
        current: Option<&TableSchema>,
        desired: &TableSchema,
    ) -> Result<(), EnsureTableError> {
        let max = self.config.max_columns;
        if max == 0 {
            return Ok(());
        }
        let mut columns: BTreeSet<&str> = desired.columns.keys().map(String::as_str).collect();
        if let Some(current) = current {
            columns.extend(current.columns.keys().map(String::as_str));
        }
        if columns.len() > max {
            return Err(EnsureTableError::TooManyColumns {
                destination: destination_id.to_string(),
                table: desired.name.clone(),
                count: columns.len(),
                max,
            });
        }
        Ok(())
    }

    /// A key that is present, not under the managed name, and different
    /// from the configured one belongs to someone else. Never touch it.
    fn check_primary_key_ownership(
        &self,
        destination_id: &str,
        current: &TableSchema,
        desired: &TableSchema,
    ) -> Result<(), EnsureTableError> {
        if current.primary_key_fields.is_empty() {
            return Ok(());
        }
        let managed = self.config.managed_primary_key_name(&desired.name);
        if current.primary_key_name.as_deref() == Some(managed.as_str()) {
            return Ok(());
        }
        if current.primary_key_fields == desired.primary_key_fields {
            return Ok(());
        }
        Err(EnsureTableError::PrimaryKeyConflict {
            destination: destination_id.to_string(),
            table: desired.name.clone(),
            key_name: current
                .primary_key_name
                .clone()
                .unwrap_or_else(|| "<unnamed>".to_string()),
            fields: current.primary_key_fields.clone(),
        })
    }

    async fn reconcile_and_release(
        &self,
        destination_id: &str,
        desired: &TableSchema,
        lock: CoordinationLock,
    ) -> Result<TableSchema, EnsureTableError> {
        tracing::debug!(destination = destination_id, table = %desired.name, "table lock acquired");
        let result = self.reconcile_locked(destination_id, desired).await;
        self.coordination.unlock(&lock).await;
        result
    }

    /// Runs with the table lock held. The cache is only written after the
    /// warehouse and the version counter agree on the new state.
    async fn reconcile_locked(&self, destination_id: &str, desired: &TableSchema) -> Result<TableSchema, EnsureTableError> {
        let table = desired.name.as_str();
        let ddl_err = |e| EnsureTableError::ddl(destination_id, table, e);
        let coordination_err = |e| EnsureTableError::coordination(destination_id, table, e);

        let current = self.manager.get_table_schema(table).await.map_err(ddl_err)?;
        self.check_column_limit(destination_id, Some(&current), desired)?;
        self.check_primary_key_ownership(destination_id, &current, desired)?;

        let patch = current.diff(desired);
        if !patch.exists() {
            let mut verified = current;
            verified.version = self.coordination.get_version(destination_id, table).await.map_err(coordination_err)?;
            self.write_cache().insert(cache_key(destination_id, table), verified.clone());
            return Ok(verified);
        }

        let mut updated = if current.exists() {
            if !patch.columns.is_empty() {
                self.manager.patch_table_schema(&patch).await.map_err(ddl_err)?;
                tracing::info!(
                    destination = destination_id,
                    table,
                    added = ?patch.columns.keys().collect::<Vec<_>>(),
                    "columns added"
                );
            }
            if patch.primary_key_changed() {
                self.manager.update_primary_key(&patch).await.map_err(ddl_err)?;
                if patch.delete_primary_key {
                    tracing::info!(destination = destination_id, table, key = ?patch.primary_key_name, "primary key dropped");
                } else {
                    tracing::info!(destination = destination_id, table, fields = ?patch.primary_key_fields, "primary key set");
                }
            }
            let mut updated = current;
            updated.apply(&patch);
            updated
        } else {
            let mut created = desired.clone();
            created.delete_primary_key = false;
            self.manager.create_table(&created).await.map_err(ddl_err)?;
            tracing::info!(destination = destination_id, table, columns = created.columns.len(), "table created");
            created
        };

        updated.version = self
            .coordination
            .increment_version(destination_id, table)
            .await
            .map_err(coordination_err)?;
        self.write_cache().insert(cache_key(destination_id, table), updated.clone());
        Ok(updated)
    }

    // ═══════════════════════════════════════════════════════════════
    //  Cache
    // ═══════════════════════════════════════════════════════════════

    /// Re-read the table if another node bumped its version since it was
    /// cached. Runs without the lock; it only reads. Returns whether the
    /// cache entry changed.
    pub async fn refresh_if_stale(&self, destination_id: &str, table: &str) -> Result<bool, EnsureTableError> {
        let Some(cached_version) = self.cached_table(destination_id, table).map(|t| t.version) else {
            return Ok(false);
        };
        let version = self
            .coordination
            .get_version(destination_id, table)
            .await
            .map_err(|e| EnsureTableError::coordination(destination_id, table, e))?;
        if version == cached_version {
            return Ok(false);
        }

        let mut fresh = self
            .manager
            .get_table_schema(table)
            .await
            .map_err(|e| EnsureTableError::ddl(destination_id, table, e))?;
        let key = cache_key(destination_id, table);
        if fresh.exists() {
            fresh.version = version;
            self.write_cache().insert(key, fresh);
        } else {
            self.write_cache().remove(&key);
        }
        tracing::debug!(destination = destination_id, table, cached_version, version, "stale schema refreshed");
        Ok(true)
    }

    pub fn cached_table(&self, destination_id: &str, table: &str) -> Option<TableSchema> {
        self.read_cache().get(&cache_key(destination_id, table)).cloned()
    }

    pub fn clear_cache(&self) {
        self.write_cache().clear();
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<CacheKey, TableSchema>> {
        match self.cache.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("schema cache read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<CacheKey, TableSchema>> {
        match self.cache.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("schema cache write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn cache_key(destination_id: &str, table: &str) -> CacheKey {
    (destination_id.to_string(), table.to_string())
}
