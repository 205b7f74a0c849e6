//! Shared fixtures for view maintenance unit tests.
//!
//! A [`Harness`] wires one source table, one view table and a handler into a
//! single store, and replays source mutations the way a site does: mutate,
//! capture the delta, fire the handler.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::MatViewError;
use crate::plan::{
    AggregateExpr, ExecutorContext, ExtremumKind, ExtremumPlan, GroupAggregatePlan,
    ParameterContainer, RowSource,
};
use crate::storage::{ColumnDef, TableDef, TableId, TableStore};
use crate::value::{ColumnType, Tuple, Value};
use crate::view::aggregate::ExpressionType;
use crate::view::{ViewDefinition, ViewHandler};

pub const SOURCE: TableId = TableId(1);
pub const VIEW: TableId = TableId(2);

// ── Table builders ──────────────────────────────────────────────────────

/// `(g BIGINT, v BIGINT)` without a primary key.
pub fn source_table() -> TableDef {
    TableDef::new(
        SOURCE,
        "src",
        vec![
            ColumnDef::new("g", ColumnType::BigInt),
            ColumnDef::new("v", ColumnType::BigInt),
        ],
    )
}

/// `(g, COUNT(*), SUM(v), MIN(v), MAX(v))` keyed on `g`.
pub fn grouped_view_table() -> TableDef {
    TableDef::new(
        VIEW,
        "v_by_group",
        vec![
            ColumnDef::new("g", ColumnType::BigInt),
            ColumnDef::new("cnt", ColumnType::BigInt).aggregate(ExpressionType::AggregateCountStar),
            ColumnDef::new("total", ColumnType::BigInt).aggregate(ExpressionType::AggregateSum),
            ColumnDef::new("lo", ColumnType::BigInt).aggregate(ExpressionType::AggregateMin),
            ColumnDef::new("hi", ColumnType::BigInt).aggregate(ExpressionType::AggregateMax),
        ],
    )
    .with_primary_key(&[0])
}

/// `(COUNT(*), SUM(v), MAX(v))` with no group-by columns.
pub fn total_view_table() -> TableDef {
    TableDef::new(
        VIEW,
        "v_total",
        vec![
            ColumnDef::new("cnt", ColumnType::BigInt).aggregate(ExpressionType::AggregateCountStar),
            ColumnDef::new("total", ColumnType::BigInt).aggregate(ExpressionType::AggregateSum),
            ColumnDef::new("hi", ColumnType::BigInt).aggregate(ExpressionType::AggregateMax),
        ],
    )
}

// ── View definitions ────────────────────────────────────────────────────

pub fn grouped_view() -> ViewDefinition {
    let create = GroupAggregatePlan::new(
        RowSource::scan(SOURCE),
        &[0],
        &[
            AggregateExpr::CountStar,
            AggregateExpr::Sum(1),
            AggregateExpr::Min(1),
            AggregateExpr::Max(1),
        ],
    );
    ViewDefinition::new("v_by_group", VIEW, &[SOURCE], 1, Arc::new(create))
        .with_fallback(
            0,
            Arc::new(ExtremumPlan::new(RowSource::scan(SOURCE), &[0], ExtremumKind::Min, 1)),
        )
        .with_fallback(
            1,
            Arc::new(ExtremumPlan::new(RowSource::scan(SOURCE), &[0], ExtremumKind::Max, 1)),
        )
}

pub fn total_view() -> ViewDefinition {
    let create = GroupAggregatePlan::new(
        RowSource::scan(SOURCE),
        &[],
        &[AggregateExpr::CountStar, AggregateExpr::Sum(1), AggregateExpr::Max(1)],
    );
    ViewDefinition::new("v_total", VIEW, &[SOURCE], 0, Arc::new(create)).with_fallback(
        0,
        Arc::new(ExtremumPlan::new(RowSource::scan(SOURCE), &[], ExtremumKind::Max, 1)),
    )
}

// ── Harness ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub tables: TableStore,
    pub params: ParameterContainer,
    pub config: EngineConfig,
    pub handler: ViewHandler,
}

impl Harness {
    /// Install `def` over an empty source, running catch-up when needed.
    pub fn new(view_table: TableDef, def: ViewDefinition) -> Self {
        let mut tables = TableStore::new();
        tables.create(source_table()).unwrap();
        tables.create(view_table).unwrap();
        let mut handler = ViewHandler::new(&def, tables.get(VIEW).unwrap(), 0).unwrap();
        handler.install(&def.sources, &mut tables, None).unwrap();

        let mut params = ParameterContainer::new();
        let config = EngineConfig::default();
        let mut ctx = ExecutorContext::new(0, &mut tables, None, &mut params, &config);
        if handler.needs_catch_up(&ctx).unwrap() {
            handler.catch_up_with_existing_data(&mut ctx).unwrap();
        }
        Harness {
            tables,
            params,
            config,
            handler,
        }
    }

    pub fn grouped() -> Self {
        Self::new(grouped_view_table(), grouped_view())
    }

    pub fn total() -> Self {
        Self::new(total_view_table(), total_view())
    }

    pub fn insert(&mut self, row: Tuple) -> Result<(), MatViewError> {
        let source = self.tables.get_mut(SOURCE)?;
        source.insert(row.clone())?;
        source.set_delta(vec![row]);
        let mut ctx =
            ExecutorContext::new(0, &mut self.tables, None, &mut self.params, &self.config);
        self.handler.handle_tuple_insert(&mut ctx, SOURCE)
    }

    pub fn delete(&mut self, row: Tuple) -> Result<(), MatViewError> {
        let source = self.tables.get_mut(SOURCE)?;
        let slot = source
            .find_row(&row)
            .ok_or_else(|| MatViewError::InvalidArgument(format!("no row {row}")))?;
        let removed = source.delete(slot)?;
        source.set_delta(vec![removed]);
        let mut ctx =
            ExecutorContext::new(0, &mut self.tables, None, &mut self.params, &self.config);
        self.handler.handle_tuple_delete(&mut ctx, SOURCE)
    }

    /// The view row of group `g` in a grouped view.
    pub fn view_row(&self, g: i64) -> Option<Tuple> {
        let view = self.tables.get(VIEW).unwrap();
        view.lookup_by_key(&[Value::BigInt(g)])
            .and_then(|row| view.get(row))
            .cloned()
    }

    pub fn view_rows(&self) -> Vec<Tuple> {
        let mut rows: Vec<Tuple> = self.tables.get(VIEW).unwrap().tuples().cloned().collect();
        rows.sort();
        rows
    }
}
