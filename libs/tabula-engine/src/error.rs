use std::collections::BTreeSet;

use tabula_api::{DataType, ErrorKind, SchemaError, TableError};
use tabula_coordination::CoordinationError;

/// Failure of one `ensure_table` call. Every variant names the destination
/// and table so a log line is enough to find the affected stream.
#[derive(Debug, thiserror::Error)]
pub enum EnsureTableError {
    #[error("[{destination}] {table}: coordination: {source}")]
    Coordination {
        destination: String,
        table: String,
        #[source]
        source: CoordinationError,
    },

    #[error("[{destination}] {table}: {source}")]
    Ddl {
        destination: String,
        table: String,
        #[source]
        source: TableError,
    },

    #[error(
        "[{destination}] {table}: primary key '{key_name}' on {fields:?} was not created by tabula \
         and does not match the configured key; drop or rename it manually"
    )]
    PrimaryKeyConflict {
        destination: String,
        table: String,
        key_name: String,
        fields: BTreeSet<String>,
    },

    #[error("[{destination}] {table}: {count} columns exceed the limit of {max}")]
    TooManyColumns {
        destination: String,
        table: String,
        count: usize,
        max: usize,
    },

    #[error("[{destination}] {table}: {source}")]
    Schema {
        destination: String,
        table: String,
        #[source]
        source: SchemaError,
    },

    #[error("[{destination}] {table}: no column type configured for '{data_type}'")]
    TypeMapping {
        destination: String,
        table: String,
        data_type: DataType,
    },
}

impl EnsureTableError {
    pub(crate) fn coordination(destination: &str, table: &str, source: CoordinationError) -> Self {
        EnsureTableError::Coordination {
            destination: destination.to_string(),
            table: table.to_string(),
            source,
        }
    }

    pub(crate) fn ddl(destination: &str, table: &str, source: TableError) -> Self {
        EnsureTableError::Ddl {
            destination: destination.to_string(),
            table: table.to_string(),
            source,
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            EnsureTableError::Coordination { destination, .. }
            | EnsureTableError::Ddl { destination, .. }
            | EnsureTableError::PrimaryKeyConflict { destination, .. }
            | EnsureTableError::TooManyColumns { destination, .. }
            | EnsureTableError::Schema { destination, .. }
            | EnsureTableError::TypeMapping { destination, .. } => destination,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            EnsureTableError::Coordination { table, .. }
            | EnsureTableError::Ddl { table, .. }
            | EnsureTableError::PrimaryKeyConflict { table, .. }
            | EnsureTableError::TooManyColumns { table, .. }
            | EnsureTableError::Schema { table, .. }
            | EnsureTableError::TypeMapping { table, .. } => table,
        }
    }

    /// Whether retrying the same call later may succeed without operator
    /// action: lock timeouts, backend hiccups and warehouse I/O failures.
    pub fn is_transient(&self) -> bool {
        match self {
            EnsureTableError::Coordination { source, .. } => source.is_transient() || source.is_already_locked(),
            EnsureTableError::Ddl { source, .. } => source.kind() == ErrorKind::Io,
            _ => false,
        }
    }

    /// Primary-key conflict found by the reconciler or refused by the warehouse.
    pub fn is_primary_key_conflict(&self) -> bool {
        match self {
            EnsureTableError::PrimaryKeyConflict { .. } => true,
            EnsureTableError::Ddl { source, .. } => source.kind() == ErrorKind::PrimaryKeyConflict,
            _ => false,
        }
    }
}
