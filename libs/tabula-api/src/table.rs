use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Column Type
// ════════════════════════════════════════════════════════════════

/// Destination-native column type, e.g. `BIGINT` or `Nullable(String)`.
///
/// Opaque to the reconciler. Only the warehouse adapter interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnType {
    pub sql_type: String,
}

impl ColumnType {
    pub fn new(sql_type: impl Into<String>) -> Self {
        Self { sql_type: sql_type.into() }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql_type)
    }
}

// ════════════════════════════════════════════════════════════════
//  Table Schema
// ════════════════════════════════════════════════════════════════

/// Physical table definition, or a patch against one.
///
/// As a *definition* (returned by `TableManager::get_table_schema`, cached
/// by the reconciler) `delete_primary_key` is always `false`. As a *patch*
/// (returned by [`TableSchema::diff`]) it carries only what must change:
/// - `columns`: columns to add
/// - `primary_key_fields`: replacement primary key, if it changed
/// - `delete_primary_key`: drop the current key, configuration no longer
///   declares one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnType>,
    #[serde(default)]
    pub primary_key_fields: BTreeSet<String>,
    /// Constraint name of the primary key. For a definition: the name the
    /// warehouse reports. For a patch: the name to create/drop.
    #[serde(default)]
    pub primary_key_name: Option<String>,
    #[serde(skip)]
    pub delete_primary_key: bool,
    /// Coordination version this definition was verified at.
    #[serde(default)]
    pub version: i64,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub fn with_primary_key<I, S>(mut self, key_name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key_fields = fields.into_iter().map(Into::into).collect();
        self.primary_key_name = Some(key_name.into());
        self
    }

    /// `false` for an absent table and for an empty patch.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty() || !self.primary_key_fields.is_empty() || self.delete_primary_key
    }

    /// Whether this patch asks for a primary key change.
    pub fn primary_key_changed(&self) -> bool {
        self.delete_primary_key || !self.primary_key_fields.is_empty()
    }

    /// Patch that brings `self` (current) up to `desired`.
    ///
    /// Columns are compared by presence only. Types were already widened
    /// upstream, and an existing column is never altered.
    pub fn diff(&self, desired: &TableSchema) -> TableSchema {
        let mut patch = TableSchema::new(desired.name.clone());

        for (name, column_type) in &desired.columns {
            if !self.columns.contains_key(name) {
                patch.columns.insert(name.clone(), column_type.clone());
            }
        }

        if !self.primary_key_fields.is_empty() && desired.primary_key_fields.is_empty() {
            patch.delete_primary_key = true;
            patch.primary_key_name = self.primary_key_name.clone();
        } else if self.primary_key_fields != desired.primary_key_fields {
            patch.primary_key_fields = desired.primary_key_fields.clone();
            patch.primary_key_name = desired.primary_key_name.clone();
        }

        patch
    }

    /// Fold a successfully applied patch into this definition.
    pub fn apply(&mut self, patch: &TableSchema) {
        for (name, column_type) in &patch.columns {
            self.columns.insert(name.clone(), column_type.clone());
        }
        if patch.delete_primary_key {
            self.primary_key_fields.clear();
            self.primary_key_name = None;
        } else if !patch.primary_key_fields.is_empty() {
            self.primary_key_fields = patch.primary_key_fields.clone();
            self.primary_key_name = patch.primary_key_name.clone();
        }
    }
}
