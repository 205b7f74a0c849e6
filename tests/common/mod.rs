//! Shared fixtures for integration tests.
//!
//! The standard schema is a sales ledger:
//!
//! - `sales(region, amount, product)`, partitioned on `region`
//! - `regions(region, name)`, replicated
//! - `sales_by_region(region, n, priced, total, lo, hi)`, partitioned on
//!   `region`, maintained from `sales`
//!
//! `sales_by_region` groups on the partition column, so every group lives
//! in exactly one partition and the union of all partitions equals a
//! from-scratch recomputation over all of `sales`.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use matview::plan::{
    AggregateExpr, ExecutorContext, ExtremumKind, ExtremumPlan, GroupAggregatePlan,
    ParameterContainer, RowSource,
};
use matview::storage::TableStore;
use matview::{
    Cluster, ColumnDef, ColumnType, EngineConfig, ExpressionType, QueryPlan, TableDef, TableId,
    Tuple, ViewDefinition,
};
use tracing_subscriber::EnvFilter;

pub const SALES: TableId = TableId(1);
pub const SALES_BY_REGION: TableId = TableId(2);
pub const REGIONS: TableId = TableId(3);
pub const REGION_TOTALS: TableId = TableId(4);
pub const GRAND_TOTAL: TableId = TableId(5);

static TRACING: Once = Once::new();

/// Install a fmt subscriber filtered by `RUST_LOG` (default `warn`).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn cluster(partitions: u32) -> Cluster {
    init_tracing();
    Cluster::new(EngineConfig::default().with_partition_count(partitions)).unwrap()
}

// ── Tables ──────────────────────────────────────────────────────────────

pub fn sales_table() -> TableDef {
    TableDef::new(
        SALES,
        "sales",
        vec![
            ColumnDef::new("region", ColumnType::BigInt).not_null(),
            ColumnDef::new("amount", ColumnType::BigInt),
            ColumnDef::new("product", ColumnType::Text),
        ],
    )
    .partitioned_on(0)
}

pub fn regions_table() -> TableDef {
    TableDef::new(
        REGIONS,
        "regions",
        vec![
            ColumnDef::new("region", ColumnType::BigInt).not_null(),
            ColumnDef::new("name", ColumnType::Text),
        ],
    )
    .with_primary_key(&[0])
}

/// `(region, COUNT(*), COUNT(amount), SUM(amount), MIN(amount), MAX(amount))`.
pub fn sales_by_region_table() -> TableDef {
    TableDef::new(
        SALES_BY_REGION,
        "sales_by_region",
        vec![
            ColumnDef::new("region", ColumnType::BigInt),
            ColumnDef::new("n", ColumnType::BigInt).aggregate(ExpressionType::AggregateCountStar),
            ColumnDef::new("priced", ColumnType::BigInt).aggregate(ExpressionType::AggregateCount),
            ColumnDef::new("total", ColumnType::BigInt).aggregate(ExpressionType::AggregateSum),
            ColumnDef::new("lo", ColumnType::BigInt).aggregate(ExpressionType::AggregateMin),
            ColumnDef::new("hi", ColumnType::BigInt).aggregate(ExpressionType::AggregateMax),
        ],
    )
    .partitioned_on(0)
    .with_primary_key(&[0])
}

// ── Views ───────────────────────────────────────────────────────────────

pub fn sales_by_region_plan() -> GroupAggregatePlan {
    GroupAggregatePlan::new(
        RowSource::scan(SALES),
        &[0],
        &[
            AggregateExpr::CountStar,
            AggregateExpr::Count(1),
            AggregateExpr::Sum(1),
            AggregateExpr::Min(1),
            AggregateExpr::Max(1),
        ],
    )
}

pub fn sales_by_region_view() -> ViewDefinition {
    ViewDefinition::new(
        "sales_by_region",
        SALES_BY_REGION,
        &[SALES],
        1,
        Arc::new(sales_by_region_plan()),
    )
    .with_fallback(
        0,
        Arc::new(ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Min, 1)),
    )
    .with_fallback(
        1,
        Arc::new(ExtremumPlan::new(RowSource::scan(SALES), &[0], ExtremumKind::Max, 1)),
    )
}

/// `(region, COUNT(*), SUM(amount))` over sales joined to known regions.
pub fn region_totals_table() -> TableDef {
    TableDef::new(
        REGION_TOTALS,
        "region_totals",
        vec![
            ColumnDef::new("region", ColumnType::BigInt),
            ColumnDef::new("n", ColumnType::BigInt).aggregate(ExpressionType::AggregateCountStar),
            ColumnDef::new("total", ColumnType::BigInt).aggregate(ExpressionType::AggregateSum),
        ],
    )
    .partitioned_on(0)
    .with_primary_key(&[0])
}

pub fn region_totals_plan() -> GroupAggregatePlan {
    GroupAggregatePlan::new(
        RowSource::scan(SALES).join(REGIONS, &[(0, 0)]),
        &[0],
        &[AggregateExpr::CountStar, AggregateExpr::Sum(1)],
    )
}

pub fn region_totals_view() -> ViewDefinition {
    ViewDefinition::new(
        "region_totals",
        REGION_TOTALS,
        &[SALES, REGIONS],
        1,
        Arc::new(region_totals_plan()),
    )
}

/// Assert the maintained `region_totals` equals a full recomputation.
pub fn assert_region_totals_consistent(cluster: &Cluster) {
    let tables = [
        (sales_table(), cluster.rows(SALES).unwrap()),
        (regions_table(), cluster.rows(REGIONS).unwrap()),
    ];
    let expected = recompute(&tables, &region_totals_plan());
    assert_eq!(sorted_rows(cluster, REGION_TOTALS), expected);
}

/// A cluster with `sales`, `regions` and an installed `sales_by_region`.
pub fn sales_cluster(partitions: u32) -> Cluster {
    let cluster = cluster(partitions);
    cluster.create_table(sales_table()).unwrap();
    cluster.create_table(regions_table()).unwrap();
    cluster.create_table(sales_by_region_table()).unwrap();
    cluster.install_view(&sales_by_region_view()).unwrap();
    cluster
}

pub fn sale(region: i64, amount: Option<i64>, product: &str) -> Tuple {
    Tuple::new(vec![region.into(), amount.map_or(matview::Value::Null, Into::into), product.into()])
}

// ── Checking ────────────────────────────────────────────────────────────

/// Run `plan` over a scratch store holding each `(definition, rows)` pair.
pub fn recompute(tables: &[(TableDef, Vec<Tuple>)], plan: &dyn QueryPlan) -> Vec<Tuple> {
    let mut store = TableStore::new();
    for (def, rows) in tables {
        let table = store.create(def.clone()).unwrap();
        for row in rows {
            table.insert(row.clone()).unwrap();
        }
    }
    let mut params = ParameterContainer::new();
    let config = EngineConfig::default();
    let ctx = ExecutorContext::new(0, &mut store, None, &mut params, &config);
    let mut out: Vec<Tuple> = ctx.execute(plan).unwrap().into_iter().collect();
    out.sort();
    out
}

pub fn sorted_rows(cluster: &Cluster, table: TableId) -> Vec<Tuple> {
    let mut rows = cluster.rows(table).unwrap();
    rows.sort();
    rows
}

/// Assert the maintained `sales_by_region` equals a full recomputation.
pub fn assert_sales_view_consistent(cluster: &Cluster) {
    let sales = cluster.rows(SALES).unwrap();
    let expected = recompute(&[(sales_table(), sales)], &sales_by_region_plan());
    assert_eq!(sorted_rows(cluster, SALES_BY_REGION), expected);
}
