//! Reference grouping plans.
//!
//! [`GroupAggregatePlan`] is the create query of a view: it groups the rows
//! of a source by the group-by columns and emits one row per group with the
//! group values followed by the aggregates. Under a delta scope the same
//! plan computes the delta tuples of a mutation.
//!
//! [`ExtremumPlan`] is a MIN/MAX fallback query. It reads the group key from
//! parameters `0..G` and the removed extremum from parameter `G`, and
//! returns a single row holding the group's current extremum (or no row
//! when the group has no source rows left).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::MatViewError;
use crate::plan::{ExecutorContext, QueryPlan, TempTable};
use crate::storage::TableId;
use crate::value::{Tuple, Value};

// ── Row sources ─────────────────────────────────────────────────────────

/// Rows fed into a grouping plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RowSource {
    /// Every visible row of one table.
    Scan { table: TableId },
    /// Inner equi-join of `left` with table `right`. Joined rows are the
    /// left columns followed by the right columns. `on` pairs a left column
    /// with a right column.
    Join {
        left: Box<RowSource>,
        right: TableId,
        on: Vec<(usize, usize)>,
    },
}

impl RowSource {
    pub fn scan(table: TableId) -> Self {
        RowSource::Scan { table }
    }

    pub fn join(self, right: TableId, on: &[(usize, usize)]) -> Self {
        RowSource::Join {
            left: Box::new(self),
            right,
            on: on.to_vec(),
        }
    }

    /// Tables read by this source, leftmost first.
    pub fn tables(&self) -> Vec<TableId> {
        match self {
            RowSource::Scan { table } => vec![*table],
            RowSource::Join { left, right, .. } => {
                let mut tables = left.tables();
                tables.push(*right);
                tables
            }
        }
    }

    pub fn rows(&self, ctx: &ExecutorContext<'_>) -> Result<Vec<Tuple>, MatViewError> {
        match self {
            RowSource::Scan { table } => Ok(ctx.scan(*table)?.cloned().collect()),
            RowSource::Join { left, right, on } => {
                let left_rows = left.rows(ctx)?;
                let right_rows: Vec<&Tuple> = ctx.scan(*right)?.collect();
                let mut joined = Vec::new();
                for l in &left_rows {
                    for r in &right_rows {
                        if join_matches(l, r, on)? {
                            joined.push(l.concat(r));
                        }
                    }
                }
                Ok(joined)
            }
        }
    }
}

// Nulls never join.
fn join_matches(left: &Tuple, right: &Tuple, on: &[(usize, usize)]) -> Result<bool, MatViewError> {
    for &(lc, rc) in on {
        let (l, r) = (column(left, lc)?, column(right, rc)?);
        if l.is_null() || r.is_null() || l.compare(r)? != Ordering::Equal {
            return Ok(false);
        }
    }
    Ok(true)
}

fn column(tuple: &Tuple, index: usize) -> Result<&Value, MatViewError> {
    tuple.get(index).ok_or_else(|| {
        MatViewError::InvalidArgument(format!(
            "plan references column {index} of a {}-column row",
            tuple.len()
        ))
    })
}

fn project(tuple: &Tuple, columns: &[usize]) -> Result<Vec<Value>, MatViewError> {
    columns.iter().map(|&c| column(tuple, c).cloned()).collect()
}

// ── Group aggregate ─────────────────────────────────────────────────────

/// An aggregate over source row columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateExpr {
    CountStar,
    Count(usize),
    Sum(usize),
    Min(usize),
    Max(usize),
}

struct Accumulator {
    expr: AggregateExpr,
    count: i64,
    value: Value,
}

impl Accumulator {
    fn new(expr: AggregateExpr) -> Self {
        Accumulator {
            expr,
            count: 0,
            value: Value::Null,
        }
    }

    fn accumulate(&mut self, row: &Tuple) -> Result<(), MatViewError> {
        match self.expr {
            AggregateExpr::CountStar => self.count += 1,
            AggregateExpr::Count(c) => {
                if !column(row, c)?.is_null() {
                    self.count += 1;
                }
            }
            AggregateExpr::Sum(c) => {
                let v = column(row, c)?;
                if !v.is_null() {
                    self.value = if self.value.is_null() {
                        v.clone()
                    } else {
                        self.value.checked_add(v)?
                    };
                }
            }
            AggregateExpr::Min(c) => self.keep_extremum(column(row, c)?, Ordering::Less)?,
            AggregateExpr::Max(c) => self.keep_extremum(column(row, c)?, Ordering::Greater)?,
        }
        Ok(())
    }

    fn keep_extremum(&mut self, v: &Value, wanted: Ordering) -> Result<(), MatViewError> {
        if !v.is_null() && (self.value.is_null() || v.compare(&self.value)? == wanted) {
            self.value = v.clone();
        }
        Ok(())
    }

    fn finish(self) -> Value {
        match self.expr {
            AggregateExpr::CountStar | AggregateExpr::Count(_) => Value::BigInt(self.count),
            _ => self.value,
        }
    }
}

/// `SELECT group_by..., aggregates... FROM source GROUP BY group_by`.
///
/// Groups are emitted in key order. Without group-by columns the plan
/// always emits exactly one row, even over no input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupAggregatePlan {
    pub source: RowSource,
    #[serde(default)]
    pub group_by: Vec<usize>,
    pub aggregates: Vec<AggregateExpr>,
}

impl GroupAggregatePlan {
    pub fn new(source: RowSource, group_by: &[usize], aggregates: &[AggregateExpr]) -> Self {
        GroupAggregatePlan {
            source,
            group_by: group_by.to_vec(),
            aggregates: aggregates.to_vec(),
        }
    }

    /// Width of the produced rows.
    pub fn output_width(&self) -> usize {
        self.group_by.len() + self.aggregates.len()
    }

    fn fresh_accumulators(&self) -> Vec<Accumulator> {
        self.aggregates.iter().copied().map(Accumulator::new).collect()
    }
}

impl QueryPlan for GroupAggregatePlan {
    fn execute(&self, ctx: &ExecutorContext<'_>) -> Result<TempTable, MatViewError> {
        let mut groups: BTreeMap<Vec<Value>, Vec<Accumulator>> = BTreeMap::new();
        for row in self.source.rows(ctx)? {
            let key = project(&row, &self.group_by)?;
            let accumulators = groups
                .entry(key)
                .or_insert_with(|| self.fresh_accumulators());
            for acc in accumulators.iter_mut() {
                acc.accumulate(&row)?;
            }
        }
        if groups.is_empty() && self.group_by.is_empty() {
            groups.insert(Vec::new(), self.fresh_accumulators());
        }

        let mut out = ctx.temp_table();
        for (mut values, accumulators) in groups {
            values.extend(accumulators.into_iter().map(Accumulator::finish));
            out.push(Tuple::new(values))?;
        }
        Ok(out)
    }
}

// ── Extremum fallback ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtremumKind {
    Min,
    Max,
}

impl ExtremumKind {
    fn wanted(self) -> Ordering {
        match self {
            ExtremumKind::Min => Ordering::Less,
            ExtremumKind::Max => Ordering::Greater,
        }
    }
}

/// `SELECT MIN|MAX(column) FROM source WHERE group_by = ($0, ..)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtremumPlan {
    pub source: RowSource,
    #[serde(default)]
    pub group_by: Vec<usize>,
    pub kind: ExtremumKind,
    pub column: usize,
}

impl ExtremumPlan {
    pub fn new(source: RowSource, group_by: &[usize], kind: ExtremumKind, column: usize) -> Self {
        ExtremumPlan {
            source,
            group_by: group_by.to_vec(),
            kind,
            column,
        }
    }
}

impl QueryPlan for ExtremumPlan {
    fn execute(&self, ctx: &ExecutorContext<'_>) -> Result<TempTable, MatViewError> {
        let params = ctx.params().as_slice();
        let g = self.group_by.len();
        let key = params.get(..g).ok_or_else(|| {
            MatViewError::InvalidArgument(format!(
                "extremum plan needs {g} group parameters, {} bound",
                params.len()
            ))
        })?;
        // A remaining row holding the removed extremum keeps it current.
        let hint = params.get(g).filter(|v| !v.is_null());

        let mut found_group = false;
        let mut best = Value::Null;
        for row in self.source.rows(ctx)? {
            if project(&row, &self.group_by)?.as_slice() != key {
                continue;
            }
            found_group = true;
            let v = column(&row, self.column)?;
            if v.is_null() {
                continue;
            }
            if let Some(hint) = hint {
                if v.compare(hint)? == Ordering::Equal {
                    best = hint.clone();
                    break;
                }
            }
            if best.is_null() || v.compare(&best)? == self.kind.wanted() {
                best = v.clone();
            }
        }

        let mut out = ctx.temp_table();
        if found_group {
            out.push(Tuple::new(vec![best]))?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::plan::ParameterContainer;
    use crate::storage::{ColumnDef, TableDef, TableStore};
    use crate::tuple;
    use crate::value::ColumnType;

    const SALES: TableId = TableId(1);
    const REGIONS: TableId = TableId(2);

    fn store() -> TableStore {
        let mut store = TableStore::new();
        let sales = store
            .create(TableDef::new(
                SALES,
                "sales",
                vec![
                    ColumnDef::new("g", ColumnType::BigInt),
                    ColumnDef::new("v", ColumnType::BigInt),
                ],
            ))
            .unwrap();
        for row in [tuple![1, 5], tuple![1, 3], tuple![2, 10], tuple![2, None::<i64>]] {
            sales.insert(row).unwrap();
        }
        let regions = store
            .create(TableDef::new(
                REGIONS,
                "regions",
                vec![
                    ColumnDef::new("g", ColumnType::BigInt),
                    ColumnDef::new("name", ColumnType::Text),
                ],
            ))
            .unwrap();
        regions.insert(tuple![1, "east"]).unwrap();
        regions.insert(tuple![2, "west"]).unwrap();
        store
    }

    fn run(plan: &dyn QueryPlan, tables: &mut TableStore, params: Vec<Value>) -> Vec<Tuple> {
        let mut container = ParameterContainer::new();
        let config = EngineConfig::default();
        let mut ctx = ExecutorContext::new(0, tables, None, &mut container, &config);
        ctx.execute_with_params(plan, params)
            .unwrap()
            .into_iter()
            .collect()
    }

    fn all_aggregates() -> Vec<AggregateExpr> {
        vec![
            AggregateExpr::CountStar,
            AggregateExpr::Count(1),
            AggregateExpr::Sum(1),
            AggregateExpr::Min(1),
            AggregateExpr::Max(1),
        ]
    }

    #[test]
    fn test_group_aggregate_per_group() {
        let mut tables = store();
        let plan = GroupAggregatePlan::new(RowSource::scan(SALES), &[0], &all_aggregates());
        let rows = run(&plan, &mut tables, vec![]);
        assert_eq!(
            rows,
            vec![tuple![1, 2, 2, 8, 3, 5], tuple![2, 2, 1, 10, 10, 10]]
        );
    }

    #[test]
    fn test_group_aggregate_without_groups_over_empty_input() {
        let mut tables = store();
        let empty = TableDef::new(
            TableId(3),
            "empty",
            vec![ColumnDef::new("g", ColumnType::BigInt), ColumnDef::new("v", ColumnType::BigInt)],
        );
        tables.create(empty).unwrap();
        let plan = GroupAggregatePlan::new(RowSource::scan(TableId(3)), &[], &all_aggregates());
        let rows = run(&plan, &mut tables, vec![]);
        assert_eq!(
            rows,
            vec![tuple![0, 0, None::<i64>, None::<i64>, None::<i64>]]
        );
    }

    #[test]
    fn test_group_aggregate_under_delta_scope() {
        let mut tables = store();
        tables.get_mut(SALES).unwrap().set_delta(vec![tuple![1, 5]]);
        let plan = GroupAggregatePlan::new(RowSource::scan(SALES), &[0], &all_aggregates());
        let mut params = ParameterContainer::new();
        let config = EngineConfig::default();
        let mut ctx = ExecutorContext::new(0, &mut tables, None, &mut params, &config);
        let scope = ctx.delta_scope(SALES);
        let rows: Vec<Tuple> = plan.execute(&scope).unwrap().into_iter().collect();
        assert_eq!(rows, vec![tuple![1, 1, 1, 5, 5, 5]]);
    }

    #[test]
    fn test_join_source() {
        let mut tables = store();
        let source = RowSource::scan(SALES).join(REGIONS, &[(0, 0)]);
        assert_eq!(source.tables(), vec![SALES, REGIONS]);
        let plan = GroupAggregatePlan::new(source, &[3], &[AggregateExpr::CountStar, AggregateExpr::Sum(1)]);
        let rows = run(&plan, &mut tables, vec![]);
        assert_eq!(rows, vec![tuple!["east", 2, 8], tuple!["west", 2, 10]]);
    }

    #[test]
    fn test_extremum_recomputes_group() {
        let mut tables = store();
        let plan = ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Max, 1);
        let rows = run(&plan, &mut tables, vec![Value::from(1), Value::from(9)]);
        assert_eq!(rows, vec![tuple![5]]);
        let plan = ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Min, 1);
        let rows = run(&plan, &mut tables, vec![Value::from(1), Value::from(1)]);
        assert_eq!(rows, vec![tuple![3]]);
    }

    #[test]
    fn test_extremum_hint_short_circuits() {
        let mut tables = store();
        tables.get_mut(SALES).unwrap().insert(tuple![1, 3]).unwrap();
        let plan = ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Min, 1);
        let rows = run(&plan, &mut tables, vec![Value::from(1), Value::from(3)]);
        assert_eq!(rows, vec![tuple![3]]);
    }

    #[test]
    fn test_extremum_empty_group_yields_no_row() {
        let mut tables = store();
        let plan = ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Max, 1);
        assert!(run(&plan, &mut tables, vec![Value::from(7), Value::from(1)]).is_empty());
    }

    #[test]
    fn test_extremum_missing_parameters() {
        let mut tables = store();
        let plan = ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Max, 1);
        let mut params = ParameterContainer::new();
        let config = EngineConfig::default();
        let ctx = ExecutorContext::new(0, &mut tables, None, &mut params, &config);
        assert!(matches!(
            plan.execute(&ctx).unwrap_err(),
            MatViewError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_plan_json() {
        let plan: GroupAggregatePlan = serde_json::from_str(
            r#"{
                "source": {"kind": "join", "left": {"kind": "scan", "table": 1}, "right": 2, "on": [[0, 0]]},
                "group_by": [0],
                "aggregates": ["COUNT_STAR", {"SUM": 1}, {"MAX": 1}]
            }"#,
        )
        .unwrap();
        assert_eq!(plan.output_width(), 4);
        assert_eq!(plan.aggregates[1], AggregateExpr::Sum(1));
    }
}
