//! Query plan execution.
//!
//! A view is maintained by running precompiled plans: one create plan that
//! aggregates source rows into view rows, and one fallback plan per MIN/MAX
//! column. Plans are opaque to the maintenance engine; they implement
//! [`QueryPlan`] and read tables through an [`ExecutorContext`], which is the
//! explicit execution context of one partition (its tables, the replicated
//! tables it can see, its parameter container, and the current delta scope).
//!
//! # Delta capture
//!
//! While a [`DeltaScope`] is open for table `T`, [`ExecutorContext::scan`]
//! over `T` yields only the rows touched by the mutation that fired the
//! trigger. Every other table reads normally. The scope is closed when the
//! guard drops, on every exit path.
//!
//! # Parameters
//!
//! Fallback plans are parameterised by the group being recomputed.
//! [`ExecutorContext::execute_with_params`] pushes a parameter frame, runs
//! the plan and pops the frame before returning. Plans only ever see a
//! shared `&ExecutorContext`, so they cannot open a nested frame.

pub mod aggregate;

use std::fmt;
use std::ops::{Deref, DerefMut};

use tracing::trace;

use crate::config::EngineConfig;
use crate::error::MatViewError;
use crate::hash::PartitionId;
use crate::storage::{PersistentTable, TableId, TableStore};
use crate::value::{Tuple, Value};

pub use aggregate::{AggregateExpr, ExtremumKind, ExtremumPlan, GroupAggregatePlan, RowSource};

/// A compiled query.
pub trait QueryPlan: fmt::Debug + Send + Sync {
    /// Run the plan to completion and return its result rows.
    fn execute(&self, ctx: &ExecutorContext<'_>) -> Result<TempTable, MatViewError>;
}

// ── Temp tables ─────────────────────────────────────────────────────────

/// Materialized plan output, bounded by the configured row limit.
#[derive(Debug, Clone)]
pub struct TempTable {
    rows: Vec<Tuple>,
    limit: usize,
}

impl TempTable {
    pub fn new(limit: usize) -> Self {
        TempTable {
            rows: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, tuple: Tuple) -> Result<(), MatViewError> {
        if self.rows.len() >= self.limit {
            return Err(MatViewError::TempTableLimitExceeded { limit: self.limit });
        }
        self.rows.push(tuple);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Tuple] {
        &self.rows
    }

    pub fn first(&self) -> Option<&Tuple> {
        self.rows.first()
    }
}

impl IntoIterator for TempTable {
    type Item = Tuple;
    type IntoIter = std::vec::IntoIter<Tuple>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

// ── Parameters ──────────────────────────────────────────────────────────

/// Parameter slots read by plans.
#[derive(Debug, Clone, Default)]
pub struct ParameterContainer {
    slots: Vec<Value>,
}

/// Saved slots of an enclosing frame. Must be handed back to
/// [`ParameterContainer::pop_frame`].
#[must_use]
#[derive(Debug)]
pub struct ParameterFrame {
    saved: Vec<Value>,
}

impl ParameterContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Value, MatViewError> {
        self.slots.get(index).ok_or_else(|| {
            MatViewError::InvalidArgument(format!(
                "parameter {index} is not bound ({} bound)",
                self.slots.len()
            ))
        })
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.slots
    }

    /// Replace every slot with `values`, returning the previous slots.
    pub fn push_frame(&mut self, values: Vec<Value>) -> ParameterFrame {
        ParameterFrame {
            saved: std::mem::replace(&mut self.slots, values),
        }
    }

    /// Restore the slots saved by the matching [`push_frame`](Self::push_frame).
    pub fn pop_frame(&mut self, frame: ParameterFrame) {
        self.slots = frame.saved;
    }
}

// ── Execution context ───────────────────────────────────────────────────

/// The execution context of one partition.
///
/// `local` holds the tables the running handler may mutate (the partition's
/// own tables, or the replicated tables when a replicated view runs).
/// `shared` is the read-only replicated store seen by partitioned views.
pub struct ExecutorContext<'a> {
    partition_id: PartitionId,
    local: &'a mut TableStore,
    shared: Option<&'a TableStore>,
    params: &'a mut ParameterContainer,
    delta_table: Option<TableId>,
    temp_table_row_limit: usize,
    trace_merges: bool,
}

impl<'a> ExecutorContext<'a> {
    pub fn new(
        partition_id: PartitionId,
        local: &'a mut TableStore,
        shared: Option<&'a TableStore>,
        params: &'a mut ParameterContainer,
        config: &EngineConfig,
    ) -> Self {
        ExecutorContext {
            partition_id,
            local,
            shared,
            params,
            delta_table: None,
            temp_table_row_limit: config.temp_table_row_limit,
            trace_merges: config.trace_merges,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn trace_merges(&self) -> bool {
        self.trace_merges
    }

    /// Table currently in delta-capture mode, if any.
    pub fn delta_table(&self) -> Option<TableId> {
        self.delta_table
    }

    pub fn params(&self) -> &ParameterContainer {
        &*self.params
    }

    /// Resolve a table, local store first.
    pub fn table(&self, id: TableId) -> Result<&PersistentTable, MatViewError> {
        if let Ok(table) = self.local.get(id) {
            return Ok(table);
        }
        match self.shared {
            Some(shared) => shared.get(id),
            None => Err(MatViewError::TableNotFound(id)),
        }
    }

    pub fn local(&self) -> &TableStore {
        &*self.local
    }

    pub fn local_mut(&mut self) -> &mut TableStore {
        &mut *self.local
    }

    /// Rows of `id` visible to plans: the captured delta while `id` is in
    /// delta-capture mode, every live row otherwise.
    pub fn scan(
        &self,
        id: TableId,
    ) -> Result<Box<dyn Iterator<Item = &Tuple> + '_>, MatViewError> {
        let table = self.table(id)?;
        if self.delta_table == Some(id) {
            Ok(Box::new(table.delta_rows().iter()))
        } else {
            Ok(Box::new(table.tuples()))
        }
    }

    /// An empty temp table bounded by this context's row limit.
    pub fn temp_table(&self) -> TempTable {
        TempTable::new(self.temp_table_row_limit)
    }

    /// Put `table` in delta-capture mode until the guard drops.
    pub fn delta_scope(&mut self, table: TableId) -> DeltaScope<'_, 'a> {
        let previous = self.delta_table.replace(table);
        DeltaScope { ctx: self, previous }
    }

    pub fn execute(&self, plan: &dyn QueryPlan) -> Result<TempTable, MatViewError> {
        plan.execute(self)
    }

    /// Run `plan` with the parameter slots temporarily set to `values`.
    ///
    /// The enclosing slots are restored before the result, successful or
    /// not, is returned.
    pub fn execute_with_params(
        &mut self,
        plan: &dyn QueryPlan,
        values: Vec<Value>,
    ) -> Result<TempTable, MatViewError> {
        trace!(params = values.len(), "executing plan with pushed parameter frame");
        let frame = self.params.push_frame(values);
        let result = plan.execute(self);
        self.params.pop_frame(frame);
        result
    }
}

/// Guard returned by [`ExecutorContext::delta_scope`].
pub struct DeltaScope<'c, 'a> {
    ctx: &'c mut ExecutorContext<'a>,
    previous: Option<TableId>,
}

impl<'a> Deref for DeltaScope<'_, 'a> {
    type Target = ExecutorContext<'a>;

    fn deref(&self) -> &ExecutorContext<'a> {
        &*self.ctx
    }
}

impl<'a> DerefMut for DeltaScope<'_, 'a> {
    fn deref_mut(&mut self) -> &mut ExecutorContext<'a> {
        &mut *self.ctx
    }
}

impl Drop for DeltaScope<'_, '_> {
    fn drop(&mut self) {
        self.ctx.delta_table = self.previous;
    }
}
