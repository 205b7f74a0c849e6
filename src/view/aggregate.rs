//! Aggregate merge algebra.
//!
//! A view's aggregate columns each carry one [`AggregateKind`]. Merging a
//! delta row into the existing view row is a per-column combination whose
//! rule depends only on the kind and the direction of the change:
//!
//! | Kind                   | Insert                          | Delete                              |
//! |------------------------|---------------------------------|-------------------------------------|
//! | SUM, COUNT, COUNT(*)   | `existing + delta`              | `existing - delta`                  |
//! | MIN                    | `delta` if smaller, else keep   | recompute if `delta == existing`    |
//! | MAX                    | `delta` if larger, else keep    | recompute if `delta == existing`    |
//!
//! A null delta always keeps the existing value. The functions here are pure;
//! recomputation is requested through [`DeleteOutcome::Recompute`] and
//! carried out by the view handler with a fallback plan.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MatViewError;
use crate::value::Value;

/// Catalog expression tag attached to a view column.
///
/// The catalog can describe more aggregate expressions than incremental
/// maintenance supports; [`AggregateKind::try_from`] rejects the rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpressionType {
    AggregateSum,
    AggregateCount,
    AggregateCountStar,
    AggregateMin,
    AggregateMax,
    AggregateAvg,
    AggregateApproxCountDistinct,
    AggregateUserDefined(String),
}

impl fmt::Display for ExpressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionType::AggregateSum => write!(f, "AGGREGATE_SUM"),
            ExpressionType::AggregateCount => write!(f, "AGGREGATE_COUNT"),
            ExpressionType::AggregateCountStar => write!(f, "AGGREGATE_COUNT_STAR"),
            ExpressionType::AggregateMin => write!(f, "AGGREGATE_MIN"),
            ExpressionType::AggregateMax => write!(f, "AGGREGATE_MAX"),
            ExpressionType::AggregateAvg => write!(f, "AGGREGATE_AVG"),
            ExpressionType::AggregateApproxCountDistinct => {
                write!(f, "AGGREGATE_APPROX_COUNT_DISTINCT")
            }
            ExpressionType::AggregateUserDefined(name) => {
                write!(f, "AGGREGATE_USER_DEFINED({name})")
            }
        }
    }
}

/// Aggregates that can be maintained incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateKind {
    Sum,
    Count,
    CountStar,
    Min,
    Max,
}

impl TryFrom<&ExpressionType> for AggregateKind {
    type Error = ExpressionType;

    fn try_from(expression: &ExpressionType) -> Result<Self, Self::Error> {
        match expression {
            ExpressionType::AggregateSum => Ok(AggregateKind::Sum),
            ExpressionType::AggregateCount => Ok(AggregateKind::Count),
            ExpressionType::AggregateCountStar => Ok(AggregateKind::CountStar),
            ExpressionType::AggregateMin => Ok(AggregateKind::Min),
            ExpressionType::AggregateMax => Ok(AggregateKind::Max),
            other => Err(other.clone()),
        }
    }
}

/// Per-column result of merging a delete delta.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The column's new value.
    Value(Value),
    /// The removed value was the current extremum; the column must be
    /// recomputed from the remaining source rows.
    Recompute,
}

pub type InsertMerge = fn(&Value, &Value) -> Result<Value, MatViewError>;
pub type DeleteMerge = fn(&Value, &Value) -> Result<DeleteOutcome, MatViewError>;

impl AggregateKind {
    /// Combine `existing` with an inserted `delta`.
    pub fn insert_merge(self) -> InsertMerge {
        match self {
            AggregateKind::Sum | AggregateKind::Count | AggregateKind::CountStar => add_on_insert,
            AggregateKind::Min => min_on_insert,
            AggregateKind::Max => max_on_insert,
        }
    }

    /// Combine `existing` with a deleted `delta`.
    pub fn delete_merge(self) -> DeleteMerge {
        match self {
            AggregateKind::Sum | AggregateKind::Count | AggregateKind::CountStar => {
                subtract_on_delete
            }
            AggregateKind::Min | AggregateKind::Max => extremum_on_delete,
        }
    }

    /// Column value of a group with no rows left (only reachable for views
    /// without group-by columns, whose single row must persist).
    pub fn empty_group_value(self) -> Value {
        match self {
            AggregateKind::Count | AggregateKind::CountStar => Value::BigInt(0),
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => Value::Null,
        }
    }

    /// Whether the kind may need a fallback recomputation on delete.
    pub fn is_extremum(self) -> bool {
        matches!(self, AggregateKind::Min | AggregateKind::Max)
    }
}

fn add_on_insert(existing: &Value, delta: &Value) -> Result<Value, MatViewError> {
    if delta.is_null() {
        return Ok(existing.clone());
    }
    if existing.is_null() {
        return Ok(delta.clone());
    }
    existing.checked_add(delta)
}

fn min_on_insert(existing: &Value, delta: &Value) -> Result<Value, MatViewError> {
    extremum_on_insert(existing, delta, Ordering::Less)
}

fn max_on_insert(existing: &Value, delta: &Value) -> Result<Value, MatViewError> {
    extremum_on_insert(existing, delta, Ordering::Greater)
}

// Only a strict improvement replaces the existing extremum.
fn extremum_on_insert(
    existing: &Value,
    delta: &Value,
    improvement: Ordering,
) -> Result<Value, MatViewError> {
    if delta.is_null() {
        return Ok(existing.clone());
    }
    if existing.is_null() || delta.compare(existing)? == improvement {
        return Ok(delta.clone());
    }
    Ok(existing.clone())
}

fn subtract_on_delete(existing: &Value, delta: &Value) -> Result<DeleteOutcome, MatViewError> {
    if delta.is_null() || existing.is_null() {
        return Ok(DeleteOutcome::Value(existing.clone()));
    }
    existing.checked_sub(delta).map(DeleteOutcome::Value)
}

fn extremum_on_delete(existing: &Value, delta: &Value) -> Result<DeleteOutcome, MatViewError> {
    if delta.is_null() || existing.is_null() {
        return Ok(DeleteOutcome::Value(existing.clone()));
    }
    if existing.compare(delta)? == Ordering::Equal {
        return Ok(DeleteOutcome::Recompute);
    }
    Ok(DeleteOutcome::Value(existing.clone()))
}
