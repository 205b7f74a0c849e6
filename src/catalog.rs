//! JSON catalog loading.
//!
//! A catalog document lists table definitions and the views over them:
//!
//! ```json
//! {
//!   "tables": [
//!     {"id": 1, "name": "sales", "placement": {"kind": "partitioned", "column": 0},
//!      "columns": [{"name": "region", "column_type": "BIGINT"},
//!                  {"name": "amount", "column_type": "BIGINT"}]},
//!     {"id": 2, "name": "sales_by_region", "placement": {"kind": "partitioned", "column": 0},
//!      "primary_key": {"name": "sales_by_region_pkey", "columns": [0], "unique": true},
//!      "columns": [{"name": "region", "column_type": "BIGINT"},
//!                  {"name": "n", "column_type": "BIGINT", "aggregate": "AGGREGATE_COUNT_STAR"},
//!                  {"name": "top", "column_type": "BIGINT", "aggregate": "AGGREGATE_MAX"}]}
//!   ],
//!   "views": [
//!     {"name": "sales_by_region", "destination": 2,
//!      "create_query": {"source": {"kind": "scan", "table": 1}, "group_by": [0],
//!                       "aggregates": ["COUNT_STAR", {"MAX": 1}]},
//!      "fallback_queries": {"0": {"source": {"kind": "scan", "table": 1},
//!                                 "group_by": [0], "kind": "max", "column": 1}}}
//!   ]
//! }
//! ```
//!
//! Fallback query keys are decimal strings naming the MIN/MAX column
//! ordinal.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::Cluster;
use crate::error::MatViewError;
use crate::plan::{ExtremumPlan, GroupAggregatePlan};
use crate::storage::{TableDef, TableId};
use crate::view::ViewDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogSpec {
    #[serde(default)]
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub views: Vec<ViewSpec>,
}

/// Catalog entry of one materialized view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSpec {
    pub name: String,
    pub destination: TableId,
    /// Defaults to the tables read by `create_query`, in order.
    #[serde(default)]
    pub sources: Option<Vec<TableId>>,
    /// Defaults to the group-by width of `create_query`.
    #[serde(default)]
    pub group_by_count: Option<usize>,
    pub create_query: GroupAggregatePlan,
    #[serde(default)]
    pub fallback_queries: BTreeMap<String, ExtremumPlan>,
}

impl ViewSpec {
    pub fn to_definition(&self) -> Result<ViewDefinition, MatViewError> {
        let sources = match &self.sources {
            Some(sources) => sources.clone(),
            None => self.create_query.source.tables(),
        };
        let group_by_count = self
            .group_by_count
            .unwrap_or(self.create_query.group_by.len());
        let mut def = ViewDefinition::new(
            &self.name,
            self.destination,
            &sources,
            group_by_count,
            Arc::new(self.create_query.clone()),
        );
        for (key, plan) in &self.fallback_queries {
            let key: u32 = key.parse().map_err(|_| {
                MatViewError::invalid_view(
                    &self.name,
                    format!("fallback query key {key:?} is not a column ordinal"),
                )
            })?;
            def = def.with_fallback(key, Arc::new(plan.clone()));
        }
        Ok(def)
    }
}

impl CatalogSpec {
    pub fn from_json(json: &str) -> Result<Self, MatViewError> {
        serde_json::from_str(json)
            .map_err(|e| MatViewError::InvalidArgument(format!("catalog: {e}")))
    }

    pub fn view_definitions(&self) -> Result<Vec<ViewDefinition>, MatViewError> {
        self.views.iter().map(ViewSpec::to_definition).collect()
    }

    /// Create every table, then install every view, in document order.
    pub fn apply(&self, cluster: &Cluster) -> Result<(), MatViewError> {
        let views = self.view_definitions()?;
        for table in &self.tables {
            cluster.create_table(table.clone())?;
        }
        for view in &views {
            cluster.install_view(view)?;
        }
        info!(
            tables = self.tables.len(),
            views = views.len(),
            "applied catalog"
        );
        Ok(())
    }
}
