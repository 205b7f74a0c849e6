//! Materialized view maintenance.
//!
//! - [`aggregate`]: the per-kind merge algebra.
//! - [`handler`]: [`ViewHandler`], which keeps one destination table in sync
//!   with its source tables.
//! - [`placement`]: trigger registration and context switching when a view
//!   and its source disagree on placement.
//!
//! A [`ViewDefinition`] is what the catalog hands the engine: a destination
//! table, the tables feeding it, and the compiled create and fallback plans.
//! [`ViewHandlers`] owns the installed handlers of one execution context,
//! keyed by destination table.

pub mod aggregate;
pub mod handler;
pub mod placement;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::error::MatViewError;
use crate::plan::QueryPlan;
use crate::storage::{TableId, TableStore};

pub use aggregate::{AggregateKind, ExpressionType};
pub use handler::ViewHandler;
pub use placement::{PlacementWrapper, SharedTables, ViewTrigger};

/// Kind of source mutation a trigger reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Insert,
    Delete,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::Insert => write!(f, "INSERT"),
            Mutation::Delete => write!(f, "DELETE"),
        }
    }
}

/// Everything needed to install a view.
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub destination: TableId,
    /// Source tables; a table's position is its relative index in the view.
    pub sources: Vec<TableId>,
    pub group_by_count: usize,
    pub create_plan: Arc<dyn QueryPlan>,
    /// Fallback plans keyed by the ordinal of their MIN/MAX column.
    pub fallback_plans: BTreeMap<u32, Arc<dyn QueryPlan>>,
}

impl ViewDefinition {
    pub fn new(
        name: &str,
        destination: TableId,
        sources: &[TableId],
        group_by_count: usize,
        create_plan: Arc<dyn QueryPlan>,
    ) -> Self {
        ViewDefinition {
            name: name.to_string(),
            destination,
            sources: sources.to_vec(),
            group_by_count,
            create_plan,
            fallback_plans: BTreeMap::new(),
        }
    }

    pub fn with_fallback(mut self, key: u32, plan: Arc<dyn QueryPlan>) -> Self {
        self.fallback_plans.insert(key, plan);
        self
    }

    /// Checks that do not need the destination schema.
    pub fn validate(&self) -> Result<(), MatViewError> {
        if self.sources.is_empty() {
            return Err(MatViewError::invalid_view(&self.name, "view has no source tables"));
        }
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if *source == self.destination {
                return Err(MatViewError::invalid_view(
                    &self.name,
                    "a view cannot be its own source",
                ));
            }
            if !seen.insert(*source) {
                return Err(MatViewError::invalid_view(
                    &self.name,
                    format!("source table {source} is listed twice"),
                ));
            }
        }
        for (expected, key) in self.fallback_plans.keys().enumerate() {
            if *key as usize != expected {
                return Err(MatViewError::invalid_view(
                    &self.name,
                    format!("fallback plan keys must be 0..n, found key {key}"),
                ));
            }
        }
        Ok(())
    }
}

/// The installed handlers of one execution context.
#[derive(Debug, Default)]
pub struct ViewHandlers {
    handlers: BTreeMap<TableId, ViewHandler>,
}

impl ViewHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn get(&self, destination: TableId) -> Result<&ViewHandler, MatViewError> {
        self.handlers
            .get(&destination)
            .ok_or_else(|| MatViewError::ViewNotFound(destination.to_string()))
    }

    pub fn get_mut(&mut self, destination: TableId) -> Result<&mut ViewHandler, MatViewError> {
        self.handlers
            .get_mut(&destination)
            .ok_or_else(|| MatViewError::ViewNotFound(destination.to_string()))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ViewHandler> {
        self.handlers.values().find(|h| h.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ViewHandler> {
        self.handlers.values()
    }

    /// Install `handler` on its destination, replacing (and fully detaching)
    /// any handler already installed there, then attach it to `sources`.
    pub fn install(
        &mut self,
        mut handler: ViewHandler,
        sources: &[TableId],
        local: &mut TableStore,
        shared: Option<&SharedTables>,
    ) -> Result<&mut ViewHandler, MatViewError> {
        let destination = handler.destination();
        // The previous handler leaves the registry only once fully detached.
        if let Some(previous) = self.handlers.get_mut(&destination) {
            info!(view = previous.name(), "replacing installed view handler");
            previous.detach_all(local, shared)?;
            self.handlers.remove(&destination);
        }
        handler.install(sources, local, shared)?;
        Ok(self.handlers.entry(destination).or_insert(handler))
    }

    /// Detach and drop the handler of `destination`.
    pub fn remove(
        &mut self,
        destination: TableId,
        local: &mut TableStore,
        shared: Option<&SharedTables>,
    ) -> Result<ViewHandler, MatViewError> {
        self.get_mut(destination)?.detach_all(local, shared)?;
        self.handlers
            .remove(&destination)
            .ok_or_else(|| MatViewError::ViewNotFound(destination.to_string()))
    }
}
