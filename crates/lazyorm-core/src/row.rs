//! Loaded row data.
//!
//! The loader hands back one `EntityRow` per loaded entity: the concrete
//! identity, the columns of the requested lazy groups (named after the
//! attributes they populate) and, for associations resolved by join, the
//! joined target rows.

use crate::identity::EntityIdentity;
use crate::value::Value;
use std::collections::HashMap;

/// A single row returned by the loader.
#[derive(Debug, Clone, Default)]
pub struct Row {
    names: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row with the given columns and values.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            names: column_names,
            values,
        }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (names, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self::new(names, values)
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    /// Check if a column exists by name.
    pub fn contains_column(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }
}

/// One loaded entity: concrete identity, group columns and joined targets.
#[derive(Debug, Clone)]
pub struct EntityRow {
    /// Identity carrying the *concrete* entity type of the row.
    pub identity: EntityIdentity,
    /// Columns for the requested groups.
    pub row: Row,
    /// Targets of associations resolved by join; `None` means the target
    /// row does not exist.
    pub joined: HashMap<&'static str, Option<EntityRow>>,
}

impl EntityRow {
    pub fn new(identity: EntityIdentity, row: Row) -> Self {
        Self {
            identity,
            row,
            joined: HashMap::new(),
        }
    }

    /// Attach the joined target row for `attribute`.
    #[must_use]
    pub fn with_joined(mut self, attribute: &'static str, target: Option<EntityRow>) -> Self {
        self.joined.insert(attribute, target);
        self
    }
}
