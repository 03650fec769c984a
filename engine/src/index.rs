use std::collections::HashMap;

use crate::record::{Row, Value};

/// Hashable form of a [`Value`]. Floats are keyed by their bit pattern with
/// `-0.0` folded into `0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Int(i64),
    Float(u64),
    Text(String),
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int(v) => IndexKey::Int(*v),
            Value::Float(v) => {
                let normalized = if *v == 0.0 { 0.0 } else { *v };
                IndexKey::Float(normalized.to_bits())
            }
            Value::Text(v) => IndexKey::Text(v.clone()),
        }
    }
}

/// Equality index from one column's values to row positions in the table's
/// stored sequence.
///
/// Positions are only meaningful for the row order the index was built
/// against; any rewrite that reorders or removes rows needs a rebuild.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    column: String,
    entries: HashMap<IndexKey, usize>,
}

impl Index {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            entries: HashMap::new(),
        }
    }

    /// Indexes `column` over `rows`, assigning positions `0..rows.len()`.
    ///
    /// Rows lacking the column are skipped. Returns the values that appeared
    /// more than once; only their first position is kept.
    pub fn build(column: impl Into<String>, rows: &[Row]) -> (Self, Vec<Value>) {
        let mut index = Self::new(column);
        let mut duplicates = Vec::new();
        for (position, row) in rows.iter().enumerate() {
            if let Some(value) = row.get(&index.column) {
                if !index.add(value, position) {
                    duplicates.push(value.clone());
                }
            }
        }
        (index, duplicates)
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Records `value` at `position`. Returns `false`, leaving the index
    /// untouched, if `value` is already present.
    pub fn add(&mut self, value: &Value, position: usize) -> bool {
        let key = IndexKey::from(value);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, position);
        true
    }

    pub fn get(&self, value: &Value) -> Option<usize> {
        self.entries.get(&IndexKey::from(value)).copied()
    }

    pub fn remove(&mut self, value: &Value) {
        self.entries.remove(&IndexKey::from(value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
