//! End-to-end maintenance scenarios through the cluster API.
//!
//! Each scenario mutates source tables and checks the destination rows
//! against hand-computed aggregates, then against a full recomputation.

mod common;

use std::sync::Arc;

use common::*;
use matview::plan::{AggregateExpr, ExtremumKind, ExtremumPlan, GroupAggregatePlan, RowSource};
use matview::{tuple, ColumnDef, ColumnType, ExpressionType, TableDef, TableId, Value, ViewDefinition};

// ── Grouped view over a partitioned table ───────────────────────────────

#[test]
fn test_insert_merges_into_groups() {
    let cluster = sales_cluster(4);
    cluster.insert(SALES, sale(1, Some(10), "a")).unwrap();
    cluster.insert(SALES, sale(1, Some(30), "b")).unwrap();
    cluster.insert(SALES, sale(2, Some(5), "c")).unwrap();

    assert_eq!(
        sorted_rows(&cluster, SALES_BY_REGION),
        vec![tuple![1, 2, 2, 40, 10, 30], tuple![2, 1, 1, 5, 5, 5]]
    );
    assert_sales_view_consistent(&cluster);
}

#[test]
fn test_delete_recomputes_removed_extremum() {
    let cluster = sales_cluster(4);
    for amount in [10, 30, 20] {
        cluster.insert(SALES, sale(1, Some(amount), "a")).unwrap();
    }
    cluster.delete(SALES, &sale(1, Some(30), "a")).unwrap();
    assert_eq!(sorted_rows(&cluster, SALES_BY_REGION), vec![tuple![1, 2, 2, 30, 10, 20]]);

    cluster.delete(SALES, &sale(1, Some(10), "a")).unwrap();
    assert_eq!(sorted_rows(&cluster, SALES_BY_REGION), vec![tuple![1, 1, 1, 20, 20, 20]]);
    assert_sales_view_consistent(&cluster);
}

#[test]
fn test_delete_of_duplicate_extremum_keeps_it() {
    let cluster = sales_cluster(2);
    for amount in [7, 7, 3] {
        cluster.insert(SALES, sale(4, Some(amount), "p")).unwrap();
    }
    cluster.delete(SALES, &sale(4, Some(7), "p")).unwrap();
    assert_eq!(sorted_rows(&cluster, SALES_BY_REGION), vec![tuple![4, 2, 2, 10, 3, 7]]);
}

#[test]
fn test_last_delete_removes_group() {
    let cluster = sales_cluster(4);
    cluster.insert(SALES, sale(1, Some(10), "a")).unwrap();
    cluster.insert(SALES, sale(2, Some(5), "c")).unwrap();
    cluster.delete(SALES, &sale(2, Some(5), "c")).unwrap();
    assert_eq!(sorted_rows(&cluster, SALES_BY_REGION), vec![tuple![1, 1, 1, 10, 10, 10]]);

    // The group comes back fresh.
    cluster.insert(SALES, sale(2, Some(8), "c")).unwrap();
    assert_sales_view_consistent(&cluster);
}

#[test]
fn test_update_moves_row_between_groups() {
    let cluster = sales_cluster(4);
    cluster.insert(SALES, sale(1, Some(10), "a")).unwrap();
    cluster.insert(SALES, sale(1, Some(20), "b")).unwrap();
    let old = cluster
        .update(SALES, &sale(1, Some(20), "b"), sale(3, Some(25), "b"))
        .unwrap();
    assert_eq!(old, sale(1, Some(20), "b"));
    assert_eq!(
        sorted_rows(&cluster, SALES_BY_REGION),
        vec![tuple![1, 1, 1, 10, 10, 10], tuple![3, 1, 1, 25, 25, 25]]
    );
    assert_sales_view_consistent(&cluster);
}

// ── Nulls ───────────────────────────────────────────────────────────────

#[test]
fn test_null_inputs_count_only_in_count_star() {
    let cluster = sales_cluster(2);
    cluster.insert(SALES, sale(1, None, "x")).unwrap();
    assert_eq!(
        sorted_rows(&cluster, SALES_BY_REGION),
        vec![tuple![1, 1, 0, Value::Null, Value::Null, Value::Null]]
    );

    cluster.insert(SALES, sale(1, Some(7), "y")).unwrap();
    assert_eq!(sorted_rows(&cluster, SALES_BY_REGION), vec![tuple![1, 2, 1, 7, 7, 7]]);

    cluster.delete(SALES, &sale(1, None, "x")).unwrap();
    assert_eq!(sorted_rows(&cluster, SALES_BY_REGION), vec![tuple![1, 1, 1, 7, 7, 7]]);
    assert_sales_view_consistent(&cluster);
}

#[test]
fn test_sum_of_deleted_inputs_is_zero() {
    let cluster = sales_cluster(2);
    cluster.insert(SALES, sale(1, None, "x")).unwrap();
    cluster.insert(SALES, sale(1, Some(7), "y")).unwrap();
    cluster.delete(SALES, &sale(1, Some(7), "y")).unwrap();
    // SUM subtracts to zero; MIN/MAX recompute over only nulls.
    assert_eq!(
        sorted_rows(&cluster, SALES_BY_REGION),
        vec![tuple![1, 1, 0, 0, Value::Null, Value::Null]]
    );
}

// ── Views without group-by columns ──────────────────────────────────────

const FEES: TableId = TableId(6);

fn fees_cluster() -> matview::Cluster {
    let cluster = cluster(3);
    cluster
        .create_table(TableDef::new(
            FEES,
            "fees",
            vec![
                ColumnDef::new("id", ColumnType::BigInt),
                ColumnDef::new("amount", ColumnType::BigInt),
            ],
        ))
        .unwrap();
    cluster
        .create_table(TableDef::new(
            GRAND_TOTAL,
            "grand_total",
            vec![
                ColumnDef::new("n", ColumnType::BigInt).aggregate(ExpressionType::AggregateCountStar),
                ColumnDef::new("total", ColumnType::BigInt).aggregate(ExpressionType::AggregateSum),
                ColumnDef::new("hi", ColumnType::BigInt).aggregate(ExpressionType::AggregateMax),
            ],
        ))
        .unwrap();
    let create = GroupAggregatePlan::new(
        RowSource::scan(FEES),
        &[],
        &[AggregateExpr::CountStar, AggregateExpr::Sum(1), AggregateExpr::Max(1)],
    );
    let def = ViewDefinition::new("grand_total", GRAND_TOTAL, &[FEES], 0, Arc::new(create))
        .with_fallback(
            0,
            Arc::new(ExtremumPlan::new(RowSource::scan(FEES), &[], ExtremumKind::Max, 1)),
        );
    cluster.install_view(&def).unwrap();
    cluster
}

#[test]
fn test_ungrouped_view_keeps_single_row() {
    let cluster = fees_cluster();
    // Catch-up seeds the row over an empty source.
    assert_eq!(
        cluster.rows(GRAND_TOTAL).unwrap(),
        vec![tuple![0, Value::Null, Value::Null]]
    );

    cluster.insert(FEES, tuple![1, 10]).unwrap();
    cluster.insert(FEES, tuple![2, 20]).unwrap();
    assert_eq!(cluster.rows(GRAND_TOTAL).unwrap(), vec![tuple![2, 30, 20]]);

    cluster.delete(FEES, &tuple![2, 20]).unwrap();
    assert_eq!(cluster.rows(GRAND_TOTAL).unwrap(), vec![tuple![1, 10, 10]]);

    cluster.delete(FEES, &tuple![1, 10]).unwrap();
    assert_eq!(
        cluster.rows(GRAND_TOTAL).unwrap(),
        vec![tuple![0, Value::Null, Value::Null]]
    );
}

// ── Join views ──────────────────────────────────────────────────────────

#[test]
fn test_join_view_follows_both_sources() {
    let cluster = sales_cluster(4);
    cluster.create_table(region_totals_table()).unwrap();
    cluster.install_view(&region_totals_view()).unwrap();

    cluster.insert(REGIONS, tuple![1, "north"]).unwrap();
    cluster.insert(SALES, sale(1, Some(10), "a")).unwrap();
    cluster.insert(SALES, sale(1, Some(20), "b")).unwrap();
    cluster.insert(SALES, sale(2, Some(5), "c")).unwrap();
    assert_eq!(sorted_rows(&cluster, REGION_TOTALS), vec![tuple![1, 2, 30]]);

    // A replicated write reaches the partition holding region 2's sales.
    cluster.insert(REGIONS, tuple![2, "south"]).unwrap();
    assert_eq!(
        sorted_rows(&cluster, REGION_TOTALS),
        vec![tuple![1, 2, 30], tuple![2, 1, 5]]
    );

    cluster.delete(REGIONS, &tuple![1, "north"]).unwrap();
    assert_eq!(sorted_rows(&cluster, REGION_TOTALS), vec![tuple![2, 1, 5]]);
    assert_region_totals_consistent(&cluster);
    assert_sales_view_consistent(&cluster);
}
