use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

// ════════════════════════════════════════════════════════════════
//  Data Type
// ════════════════════════════════════════════════════════════════

/// Primitive value types observed in incoming events.
///
/// Forms a small lattice: `Int64` widens to `Float64`, every other pair of
/// distinct types widens to `String`, which absorbs everything.
/// Each destination maps the resolved type to its own column type:
/// - Postgres: `BIGINT`, `DOUBLE PRECISION`, `TIMESTAMP`, `TEXT`, ...
/// - ClickHouse: `Int64`, `Float64`, `DateTime`, `String`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Unknown,
    Bool,
    Int64,
    Float64,
    Timestamp,
    String,
}

impl DataType {
    /// Narrowest type that can represent values of both `self` and `other`.
    pub fn widen(self, other: DataType) -> DataType {
        match (self, other) {
            (a, b) if a == b => a,
            (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
                DataType::Float64
            }
            _ => DataType::String,
        }
    }

    /// Classify a flat JSON value.
    ///
    /// Nested values only show up here when flattening left them in place;
    /// they are written as serialized strings.
    pub fn infer(value: &serde_json::Value) -> DataType {
        match value {
            serde_json::Value::Null => DataType::Unknown,
            serde_json::Value::Bool(_) => DataType::Bool,
            serde_json::Value::Number(n) if n.is_i64() => DataType::Int64,
            serde_json::Value::Number(_) => DataType::Float64,
            serde_json::Value::String(s) if chrono::DateTime::parse_from_rfc3339(s).is_ok() => {
                DataType::Timestamp
            }
            serde_json::Value::String(_) => DataType::String,
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => DataType::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Unknown => "unknown",
            DataType::Bool => "bool",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Timestamp => "timestamp",
            DataType::String => "string",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(DataType::Unknown),
            "bool" | "boolean" => Ok(DataType::Bool),
            "int64" | "int" | "integer" => Ok(DataType::Int64),
            "float64" | "float" | "double" => Ok(DataType::Float64),
            "timestamp" => Ok(DataType::Timestamp),
            "string" => Ok(DataType::String),
            _ => Err(SchemaError::UnknownType(s.to_string())),
        }
    }
}

/// Left-fold [`DataType::widen`] over `types`. `None` for an empty input.
///
/// The lattice is commutative and associative, so the result does not
/// depend on iteration order.
pub fn widen_all<I>(types: I) -> Option<DataType>
where
    I: IntoIterator<Item = DataType>,
{
    let mut iter = types.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, DataType::widen))
}
