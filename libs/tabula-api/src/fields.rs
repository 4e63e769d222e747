use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::types::{DataType, widen_all};

// ════════════════════════════════════════════════════════════════
//  Field
// ════════════════════════════════════════════════════════════════

/// One inferred column: every type observed for it so far, plus a memoized
/// widened type.
///
/// The memo is cleared whenever a type not seen before is added, so
/// [`Field::resolve`] never returns a stale value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<DataType>", into = "Vec<DataType>")]
pub struct Field {
    type_occurrence: BTreeSet<DataType>,
    resolved: OnceLock<DataType>,
}

impl Field {
    pub fn new(data_type: DataType) -> Self {
        Self::from_types([data_type])
    }

    pub fn from_types(types: impl IntoIterator<Item = DataType>) -> Self {
        Self {
            type_occurrence: types.into_iter().collect(),
            resolved: OnceLock::new(),
        }
    }

    /// Record an observed type. Returns `true` if the type was new.
    pub fn add_type(&mut self, data_type: DataType) -> bool {
        let added = self.type_occurrence.insert(data_type);
        if added {
            self.resolved.take();
        }
        added
    }

    pub fn occurrences(&self) -> &BTreeSet<DataType> {
        &self.type_occurrence
    }

    /// Widened type of all occurrences, computed once and cached.
    pub fn resolve(&self) -> Result<DataType, SchemaError> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(*resolved);
        }
        let widened = widen_all(self.type_occurrence.iter().copied())
            .ok_or(SchemaError::EmptyOccurrence)?;
        Ok(*self.resolved.get_or_init(|| widened))
    }

    /// Union `other`'s occurrences into this field.
    pub fn merge(&mut self, other: &Field) {
        for data_type in &other.type_occurrence {
            self.add_type(*data_type);
        }
    }

    /// Replace this field's type information with `other`'s.
    pub fn override_with(&mut self, other: &Field) {
        self.type_occurrence = other.type_occurrence.clone();
        self.resolved = OnceLock::new();
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.type_occurrence == other.type_occurrence
    }
}

impl Eq for Field {}

impl From<Vec<DataType>> for Field {
    fn from(types: Vec<DataType>) -> Self {
        Self::from_types(types)
    }
}

impl From<Field> for Vec<DataType> {
    fn from(field: Field) -> Self {
        field.type_occurrence.into_iter().collect()
    }
}

// ════════════════════════════════════════════════════════════════
//  Fields
// ════════════════════════════════════════════════════════════════

/// Column name → inferred field. Sorted by name so that generated DDL
/// lists columns in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, Field>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build fields from one flattened event. Null values carry no type
    /// information and are skipped.
    pub fn from_flat_event(event: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut fields = Fields::new();
        for (name, value) in event {
            let data_type = DataType::infer(value);
            if data_type == DataType::Unknown {
                continue;
            }
            fields.observe(name, data_type);
        }
        fields
    }

    /// Record one observed type for `name`, creating the field if needed.
    pub fn observe(&mut self, name: &str, data_type: DataType) {
        match self.0.get_mut(name) {
            Some(field) => {
                field.add_type(data_type);
            }
            None => {
                self.0.insert(name.to_string(), Field::new(data_type));
            }
        }
    }

    /// Union `other` into `self`, widening columns present in both.
    pub fn merge(&mut self, other: &Fields) {
        for (name, field) in &other.0 {
            match self.0.get_mut(name) {
                Some(existing) => existing.merge(field),
                None => {
                    self.0.insert(name.clone(), field.clone());
                }
            }
        }
    }

    /// Add only the columns `self` does not have yet. Never overwrites.
    pub fn add(&mut self, other: &Fields) {
        for (name, field) in &other.0 {
            if !self.0.contains_key(name) {
                self.0.insert(name.clone(), field.clone());
            }
        }
    }

    /// Force `other`'s type information onto columns present in both.
    /// Columns only in `other` are ignored.
    pub fn override_types(&mut self, other: &Fields) {
        for (name, field) in &other.0 {
            if let Some(existing) = self.0.get_mut(name) {
                existing.override_with(field);
            }
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, field: Field) -> Option<Field> {
        self.0.insert(name.into(), field)
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.0.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Field)> for Fields {
    fn from_iter<T: IntoIterator<Item = (String, Field)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ════════════════════════════════════════════════════════════════
//  BatchHeader
// ════════════════════════════════════════════════════════════════

/// Inferred table name and columns for one processed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub table_name: String,
    pub fields: Fields,
}

impl BatchHeader {
    pub fn new(table_name: impl Into<String>, fields: Fields) -> Self {
        Self {
            table_name: table_name.into(),
            fields,
        }
    }

    pub fn exists(&self) -> bool {
        !self.fields.is_empty()
    }
}
