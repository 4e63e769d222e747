use std::future::Future;
use std::pin::Pin;

use crate::error::TableError;
use crate::table::TableSchema;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Warehouse adapter trait.
///
/// The reconciler doesn't know concrete warehouses. For the reconciler, a
/// destination is just this trait. Every method may be called concurrently
/// from many workers, but DDL methods are only called while the caller holds
/// the coordination lock for the table.
pub trait TableManager: Send + Sync {
    /// Current physical definition of `name`.
    ///
    /// An absent table is not an error: return `TableSchema::new(name)`,
    /// whose `exists()` is `false`.
    fn get_table_schema<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<TableSchema, TableError>>;

    /// Create a table with exactly the given columns and primary key.
    ///
    /// Not idempotent: the caller checks existence first.
    fn create_table<'a>(&'a self, schema: &'a TableSchema) -> BoxFuture<'a, Result<(), TableError>>;

    /// Add the columns listed in `patch`. Never removes columns.
    fn patch_table_schema<'a>(&'a self, patch: &'a TableSchema) -> BoxFuture<'a, Result<(), TableError>>;

    /// Add, replace or drop the primary key of `patch.name` according to
    /// `patch.primary_key_fields`, `patch.primary_key_name` and
    /// `patch.delete_primary_key`.
    ///
    /// Must return an [`ErrorKind::PrimaryKeyConflict`](crate::ErrorKind)
    /// error instead of touching a key it did not create.
    fn update_primary_key<'a>(&'a self, patch: &'a TableSchema) -> BoxFuture<'a, Result<(), TableError>>;
}
