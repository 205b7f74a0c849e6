//! In-memory persistent tables.
//!
//! A [`PersistentTable`] stores rows in slots, keeps its indexes in sync,
//! remembers the rows touched by the most recent mutation (the delta a view
//! trigger reads in delta-capture mode) and carries the list of view
//! triggers to invoke after each mutation.

use crate::error::MatViewError;
use crate::storage::index::{IndexId, RowId, TableIndex};
use crate::storage::{Placement, TableDef, TableId};
use crate::value::{Tuple, Value};
use crate::view::placement::ViewTrigger;

#[derive(Debug, Clone)]
pub struct PersistentTable {
    def: TableDef,
    slots: Vec<Option<Tuple>>,
    free: Vec<usize>,
    live: usize,
    indexes: Vec<TableIndex>,
    primary: Option<IndexId>,
    view_triggers: Vec<ViewTrigger>,
    last_delta: Vec<Tuple>,
}

impl PersistentTable {
    pub fn new(def: TableDef) -> Result<Self, MatViewError> {
        def.validate()?;
        let mut indexes = Vec::new();
        let mut primary = None;
        if let Some(pk) = &def.primary_key {
            let id = IndexId(indexes.len());
            indexes.push(TableIndex::new(id, pk.clone()));
            primary = Some(id);
        }
        for idx in &def.indexes {
            indexes.push(TableIndex::new(IndexId(indexes.len()), idx.clone()));
        }
        Ok(PersistentTable {
            def,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            indexes,
            primary,
            view_triggers: Vec::new(),
            last_delta: Vec::new(),
        })
    }

    pub fn id(&self) -> TableId {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn def(&self) -> &TableDef {
        &self.def
    }

    pub fn width(&self) -> usize {
        self.def.columns.len()
    }

    pub fn placement(&self) -> Placement {
        self.def.placement
    }

    pub fn is_replicated(&self) -> bool {
        self.def.placement.is_replicated()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn get(&self, row: RowId) -> Option<&Tuple> {
        self.slots.get(row.0).and_then(Option::as_ref)
    }

    /// Live rows in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (RowId, &Tuple)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|t| (RowId(i), t)))
    }

    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// The first live row, used for views that hold exactly one row.
    pub fn first_row(&self) -> Option<RowId> {
        self.iter().next().map(|(row, _)| row)
    }

    pub fn indexes(&self) -> &[TableIndex] {
        &self.indexes
    }

    pub fn index(&self, id: IndexId) -> Option<&TableIndex> {
        self.indexes.get(id.0)
    }

    pub fn primary_key_index(&self) -> Option<&TableIndex> {
        self.primary.and_then(|id| self.indexes.get(id.0))
    }

    /// Point lookup through the primary key index.
    pub fn lookup_by_key(&self, key: &[Value]) -> Option<RowId> {
        self.primary_key_index()?.lookup_first(key)
    }

    /// Locate a row equal to `tuple`, through the primary key when there is one.
    pub fn find_row(&self, tuple: &Tuple) -> Option<RowId> {
        match self.primary_key_index() {
            Some(pk) => pk
                .lookup(&pk.key_of(tuple))
                .iter()
                .copied()
                .find(|row| self.get(*row) == Some(tuple)),
            None => self
                .iter()
                .find(|(_, t)| *t == tuple)
                .map(|(row, _)| row),
        }
    }

    /// Locate the row a delete of `tuple` refers to: the row with the same
    /// primary key when the table has one, otherwise an equal row.
    pub fn locate(&self, tuple: &Tuple) -> Result<Option<RowId>, MatViewError> {
        self.check_tuple(tuple)?;
        Ok(match self.primary_key_index() {
            Some(pk) => pk.lookup_first(&pk.key_of(tuple)),
            None => self.find_row(tuple),
        })
    }

    /// Check width, column types and nullability of a tuple for this table.
    pub fn check_tuple(&self, tuple: &Tuple) -> Result<(), MatViewError> {
        if tuple.len() != self.width() {
            return Err(MatViewError::InvalidArgument(format!(
                "table {} has {} columns, tuple has {}",
                self.def.name,
                self.width(),
                tuple.len()
            )));
        }
        for (value, column) in tuple.iter().zip(&self.def.columns) {
            if value.is_null() && !column.nullable {
                return Err(MatViewError::ConstraintViolation {
                    table: self.def.name.clone(),
                    detail: format!("column {} is not nullable", column.name),
                });
            }
            if !value.fits(column.column_type) {
                return Err(MatViewError::TypeMismatch(format!(
                    "value {value} does not fit column {}.{} of type {:?}",
                    self.def.name, column.name, column.column_type
                )));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, tuple: Tuple) -> Result<RowId, MatViewError> {
        self.check_tuple(&tuple)?;
        let row = match self.free.last() {
            Some(&slot) => RowId(slot),
            None => RowId(self.slots.len()),
        };
        for i in 0..self.indexes.len() {
            if let Err(detail) = self.indexes[i].insert(&tuple, row) {
                for idx in &mut self.indexes[..i] {
                    idx.remove(&tuple, row);
                }
                return Err(MatViewError::ConstraintViolation {
                    table: self.def.name.clone(),
                    detail,
                });
            }
        }
        if self.free.pop().is_none() {
            self.slots.push(None);
        }
        self.slots[row.0] = Some(tuple);
        self.live += 1;
        Ok(row)
    }

    /// Replace the row at `row` with `new`, refreshing only the listed
    /// indexes. Indexes left out must not have their keys changed.
    pub fn update_with_indexes(
        &mut self,
        row: RowId,
        new: Tuple,
        indexes: &[IndexId],
    ) -> Result<(), MatViewError> {
        self.check_tuple(&new)?;
        let old = self.get(row).cloned().ok_or_else(|| {
            MatViewError::InternalError(format!("update of a free slot in {}", self.def.name))
        })?;
        debug_assert!(
            self.indexes
                .iter()
                .filter(|idx| !indexes.contains(&idx.id()))
                .all(|idx| !idx.key_changed(&old, &new)),
            "update changed the key of an index that is not refreshed"
        );
        let mut moved: Vec<IndexId> = Vec::new();
        for &id in indexes {
            let idx = self
                .indexes
                .get_mut(id.0)
                .ok_or_else(|| MatViewError::InternalError(format!("unknown index {id:?}")))?;
            if !idx.key_changed(&old, &new) {
                continue;
            }
            idx.remove(&old, row);
            if let Err(detail) = idx.insert(&new, row) {
                idx.insert(&old, row).ok();
                for done in moved.iter().rev() {
                    let undo = &mut self.indexes[done.0];
                    undo.remove(&new, row);
                    undo.insert(&old, row).ok();
                }
                return Err(MatViewError::ConstraintViolation {
                    table: self.def.name.clone(),
                    detail,
                });
            }
            moved.push(id);
        }
        self.slots[row.0] = Some(new);
        Ok(())
    }

    pub fn delete(&mut self, row: RowId) -> Result<Tuple, MatViewError> {
        let tuple = self
            .slots
            .get_mut(row.0)
            .and_then(Option::take)
            .ok_or_else(|| {
                MatViewError::InternalError(format!("delete of a free slot in {}", self.def.name))
            })?;
        for idx in &mut self.indexes {
            idx.remove(&tuple, row);
        }
        self.free.push(row.0);
        self.live -= 1;
        Ok(tuple)
    }

    /// Remove every row, keeping indexes and view triggers.
    pub fn truncate(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        for idx in &mut self.indexes {
            idx.clear();
        }
        self.last_delta.clear();
    }

    // ── Delta capture ───────────────────────────────────────────────────

    /// Record the rows changed by the mutation that just completed.
    pub fn set_delta(&mut self, rows: Vec<Tuple>) {
        self.last_delta = rows;
    }

    /// Rows changed by the most recent mutation.
    pub fn delta_rows(&self) -> &[Tuple] {
        &self.last_delta
    }

    pub fn clear_delta(&mut self) {
        self.last_delta.clear();
    }

    // ── View triggers ───────────────────────────────────────────────────

    pub fn view_triggers(&self) -> &[ViewTrigger] {
        &self.view_triggers
    }

    pub fn add_view_trigger(&mut self, trigger: ViewTrigger) {
        self.view_triggers.push(trigger);
    }

    /// Unregister a trigger. Returns whether it was registered.
    pub fn drop_view_trigger(&mut self, trigger: &ViewTrigger) -> bool {
        match self.view_triggers.iter().position(|t| t == trigger) {
            Some(pos) => {
                self.view_triggers.remove(pos);
                true
            }
            None => false,
        }
    }
}
