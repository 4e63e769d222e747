use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use tabula_api::{ColumnType, DataType};

// ═══════════════════════════════════════════════════════════════
//  DestinationConfig
// ═══════════════════════════════════════════════════════════════

/// Per-destination reconciliation settings.
///
/// ```toml
/// [destinations.pg_main]
/// schema = "public"
/// primary_key_fields = ["id"]
/// max_columns = 1000
/// column_name_style = "lowercase"
/// type_mapping = "postgres"
///
/// [destinations.pg_main.column_types]
/// payload = "JSONB"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationConfig {
    /// Database schema / namespace the tables live in.
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub primary_key_fields: BTreeSet<String>,
    /// Upper bound on columns per table. `0` disables the guard.
    #[serde(default)]
    pub max_columns: usize,
    #[serde(default)]
    pub column_name_style: ColumnNameStyle,
    /// Explicit column types that win over `type_mapping`.
    #[serde(default)]
    pub column_types: BTreeMap<String, String>,
    #[serde(default)]
    pub type_mapping: TypeMapping,
}

impl DestinationConfig {
    /// Name of the primary key the reconciler creates and owns for `table`.
    pub fn managed_primary_key_name(&self, table: &str) -> String {
        if self.schema.is_empty() {
            format!("{table}_pk")
        } else {
            format!("{}_{table}_pk", self.schema)
        }
    }

    /// Configured override for an already normalized column name.
    pub fn column_type_override(&self, column: &str) -> Option<ColumnType> {
        self.column_types
            .iter()
            .find(|(name, _)| self.column_name_style.apply(name) == column)
            .map(|(_, sql_type)| ColumnType::new(sql_type.as_str()))
    }

    /// Configured primary key fields after name normalization.
    pub fn normalized_primary_key_fields(&self) -> BTreeSet<String> {
        self.primary_key_fields
            .iter()
            .map(|f| self.column_name_style.apply(f))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNameStyle {
    #[default]
    AsIs,
    Lowercase,
    Uppercase,
}

impl ColumnNameStyle {
    pub fn apply(&self, name: &str) -> String {
        match self {
            ColumnNameStyle::AsIs => name.to_string(),
            ColumnNameStyle::Lowercase => name.to_lowercase(),
            ColumnNameStyle::Uppercase => name.to_uppercase(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  TypeMapping
// ═══════════════════════════════════════════════════════════════

/// `DataType` → destination column type.
///
/// In config either a preset name or an explicit table:
/// ```toml
/// type_mapping = "clickhouse"
/// # or
/// type_mapping = { int64 = "BIGINT", string = "TEXT" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "TypeMappingSource")]
pub struct TypeMapping {
    types: BTreeMap<DataType, ColumnType>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TypeMappingSource {
    Preset(String),
    Table(BTreeMap<DataType, String>),
}

impl TryFrom<TypeMappingSource> for TypeMapping {
    type Error = String;

    fn try_from(source: TypeMappingSource) -> Result<Self, Self::Error> {
        match source {
            TypeMappingSource::Preset(name) => {
                TypeMapping::preset(&name).ok_or_else(|| format!("unknown type mapping preset '{name}'"))
            }
            TypeMappingSource::Table(table) => Ok(table
                .into_iter()
                .fold(TypeMapping::empty(), |m, (data_type, sql_type)| m.with(data_type, sql_type))),
        }
    }
}

impl Default for TypeMapping {
    fn default() -> Self {
        TypeMapping::postgres()
    }
}

impl TypeMapping {
    pub fn empty() -> Self {
        Self { types: BTreeMap::new() }
    }

    pub fn with(mut self, data_type: DataType, sql_type: impl Into<String>) -> Self {
        self.types.insert(data_type, ColumnType::new(sql_type));
        self
    }

    pub fn postgres() -> Self {
        TypeMapping::empty()
            .with(DataType::Bool, "BOOLEAN")
            .with(DataType::Int64, "BIGINT")
            .with(DataType::Float64, "DOUBLE PRECISION")
            .with(DataType::Timestamp, "TIMESTAMP")
            .with(DataType::String, "TEXT")
    }

    pub fn clickhouse() -> Self {
        TypeMapping::empty()
            .with(DataType::Bool, "UInt8")
            .with(DataType::Int64, "Int64")
            .with(DataType::Float64, "Float64")
            .with(DataType::Timestamp, "DateTime64(6)")
            .with(DataType::String, "String")
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(TypeMapping::postgres()),
            "clickhouse" => Some(TypeMapping::clickhouse()),
            _ => None,
        }
    }

    /// Column type for `data_type`, falling back to the `String` entry.
    pub fn column_type(&self, data_type: DataType) -> Option<&ColumnType> {
        self.types
            .get(&data_type)
            .or_else(|| self.types.get(&DataType::String))
    }
}
