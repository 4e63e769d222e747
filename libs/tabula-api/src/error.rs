/// Category of a table-manager error. Lets the reconciler tell a
/// misconfigured destination from a flaky connection or a refused DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid destination configuration. Permanent.
    Config,
    /// Connectivity or I/O failure. Transient; the next batch retries.
    Io,
    /// The warehouse rejected a CREATE/ALTER statement.
    Ddl,
    /// An existing primary key is not owned by us and does not match the
    /// managed key fields.
    PrimaryKeyConflict,
    /// Logical error (not found, invalid state, generic).
    Logic,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => f.write_str("config"),
            ErrorKind::Io => f.write_str("io"),
            ErrorKind::Ddl => f.write_str("ddl"),
            ErrorKind::PrimaryKeyConflict => f.write_str("primary_key_conflict"),
            ErrorKind::Logic => f.write_str("logic"),
        }
    }
}

/// Error returned by every [`TableManager`](crate::TableManager) method.
///
/// Carries an `ErrorKind` for categorization and a human-readable message
/// produced by the warehouse adapter.
#[derive(Clone, PartialEq, Eq)]
pub struct TableError {
    kind: ErrorKind,
    message: String,
}

impl TableError {
    /// Generic logic error (default kind).
    pub fn new(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Logic, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Io, message: msg.into() }
    }

    pub fn ddl(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Ddl, message: msg.into() }
    }

    pub fn primary_key_conflict(msg: impl Into<String>) -> Self {
        Self { kind: ErrorKind::PrimaryKeyConflict, message: msg.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Add context to the error, preserving the original ErrorKind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl std::fmt::Debug for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TableError {}

/// Violations of the inferred-schema data model.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// A field was resolved without any observed type. Upstream type
    /// inference never produces such a field, so this is an internal bug.
    #[error("internal: field has no observed types")]
    EmptyOccurrence,

    #[error("unknown data type '{0}'")]
    UnknownType(String),
}
