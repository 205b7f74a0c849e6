//! Hash indexes over in-memory tables.
//!
//! A [`TableIndex`] maps the projection of a tuple onto the index columns to
//! the slots holding matching rows. Unique indexes (the primary key of a view
//! is always one) reject a second row for the same key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::{Tuple, Value};

/// Slot of a row inside its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId(pub usize);

/// Position of an index inside its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub usize);

/// Declarative description of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<usize>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: &str, columns: &[usize], unique: bool) -> Self {
        IndexDef {
            name: name.to_string(),
            columns: columns.to_vec(),
            unique,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableIndex {
    id: IndexId,
    def: IndexDef,
    entries: HashMap<Vec<Value>, Vec<RowId>>,
}

impl TableIndex {
    pub fn new(id: IndexId, def: IndexDef) -> Self {
        TableIndex {
            id,
            def,
            entries: HashMap::new(),
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn columns(&self) -> &[usize] {
        &self.def.columns
    }

    pub fn is_unique(&self) -> bool {
        self.def.unique
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub fn key_of(&self, tuple: &Tuple) -> Vec<Value> {
        tuple.project(&self.def.columns)
    }

    /// Whether `old` and `new` map to different keys of this index.
    pub fn key_changed(&self, old: &Tuple, new: &Tuple) -> bool {
        self.def.columns.iter().any(|&c| old.value(c) != new.value(c))
    }

    /// Add `row` under the key of `tuple`.
    ///
    /// Returns the conflicting key, rendered, when a unique index already
    /// holds a row for it.
    pub fn insert(&mut self, tuple: &Tuple, row: RowId) -> Result<(), String> {
        let key = self.key_of(tuple);
        let slots = self.entries.entry(key).or_default();
        if self.def.unique && !slots.is_empty() {
            return Err(format!(
                "duplicate key {} in unique index {}",
                Tuple::new(tuple.project(&self.def.columns)),
                self.def.name
            ));
        }
        slots.push(row);
        Ok(())
    }

    pub fn remove(&mut self, tuple: &Tuple, row: RowId) {
        let key = self.key_of(tuple);
        if let Some(slots) = self.entries.get_mut(&key) {
            slots.retain(|r| *r != row);
            if slots.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    /// All rows stored under `key`.
    pub fn lookup(&self, key: &[Value]) -> &[RowId] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The first row stored under `key`, if any.
    pub fn lookup_first(&self, key: &[Value]) -> Option<RowId> {
        self.lookup(key).first().copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
