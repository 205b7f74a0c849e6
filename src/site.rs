//! One partition's execution site.
//!
//! A [`Site`] owns the tables, installed view handlers and parameter
//! container of a single partition and runs everything for that partition
//! on one thread at a time. Source mutations enter through
//! [`insert_tuple`](Site::insert_tuple) and [`delete_tuple`](Site::delete_tuple),
//! which mutate the table, capture the delta and fire its view triggers
//! before returning.
//!
//! The replicated store is a `Site` as well, living behind the
//! cross-placement lock in [`SharedTables`].

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::MatViewError;
use crate::hash::PartitionId;
use crate::plan::{ExecutorContext, ParameterContainer};
use crate::storage::{TableDef, TableId, TableStore};
use crate::value::Tuple;
use crate::view::placement::{SharedTables, ViewTrigger};
use crate::view::{Mutation, ViewDefinition, ViewHandler, ViewHandlers};

#[derive(Debug)]
pub struct Site {
    partition_id: PartitionId,
    tables: TableStore,
    handlers: ViewHandlers,
    params: ParameterContainer,
    config: EngineConfig,
}

impl Site {
    pub fn new(partition_id: PartitionId, config: EngineConfig) -> Self {
        Site {
            partition_id,
            tables: TableStore::new(),
            handlers: ViewHandlers::new(),
            params: ParameterContainer::new(),
            config,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    pub fn tables_mut(&mut self) -> &mut TableStore {
        &mut self.tables
    }

    pub fn handlers(&self) -> &ViewHandlers {
        &self.handlers
    }

    pub fn create_table(&mut self, def: TableDef) -> Result<(), MatViewError> {
        self.tables.create(def).map(|_| ())
    }

    // ── View lifecycle ──────────────────────────────────────────────────

    /// Build, install and (when configured) populate the handler of `def`.
    /// Returns whether catch-up wrote the destination's contents.
    ///
    /// A failed catch-up uninstalls the handler again and empties the
    /// destination it started from. `shared` is the replicated store,
    /// absent when this site is the replicated store itself.
    pub fn install_view(
        &mut self,
        def: &ViewDefinition,
        shared: Option<&SharedTables>,
    ) -> Result<bool, MatViewError> {
        let destination = self.tables.get(def.destination)?;
        let was_empty = destination.is_empty();
        let handler = ViewHandler::new(def, destination, self.partition_id)?;
        self.handlers
            .install(handler, &def.sources, &mut self.tables, shared)?;
        if !self.config.catch_up_on_install {
            return Ok(false);
        }
        match self.catch_up(def.destination, shared) {
            Ok(rows) => Ok(rows.is_some()),
            Err(e) => {
                warn!(view = %def.name, partition = self.partition_id, error = %e, "catch-up failed");
                if let Err(undo) = self.uninstall_view(def.destination, was_empty, shared) {
                    warn!(view = %def.name, error = %undo, "failed to undo install");
                }
                Err(e)
            }
        }
    }

    /// Undo an install of `view`: detach and remove its handler and, when
    /// `clear` is set, discard the destination rows catch-up wrote.
    pub fn uninstall_view(
        &mut self,
        view: TableId,
        clear: bool,
        shared: Option<&SharedTables>,
    ) -> Result<(), MatViewError> {
        self.handlers.remove(view, &mut self.tables, shared)?;
        if clear {
            self.tables.get_mut(view)?.truncate();
        }
        warn!(view = %view, partition = self.partition_id, cleared = clear, "uninstalled view");
        Ok(())
    }

    /// Detach and remove the handler of view `view`.
    pub fn drop_view(
        &mut self,
        view: TableId,
        shared: Option<&SharedTables>,
    ) -> Result<ViewHandler, MatViewError> {
        let handler = self.handlers.remove(view, &mut self.tables, shared)?;
        info!(view = handler.name(), partition = self.partition_id, "dropped view handler");
        Ok(handler)
    }

    /// Turn maintenance of `view` on or off. Turning it back on discards
    /// the destination contents and rebuilds them from the sources.
    pub fn set_view_enabled(
        &mut self,
        view: TableId,
        enabled: bool,
        shared: Option<&SharedTables>,
    ) -> Result<(), MatViewError> {
        let handler = self.handlers.get_mut(view)?;
        let was_enabled = handler.is_enabled();
        handler.set_enabled(enabled);
        if enabled && !was_enabled {
            self.tables.get_mut(view)?.truncate();
            let rows = self.catch_up(view, shared)?.unwrap_or(0);
            info!(view = %view, partition = self.partition_id, rows, "view maintenance enabled");
        }
        Ok(())
    }

    /// Run catch-up for `view` if its destination needs it. Returns the
    /// number of rows written, or `None` when nothing had to be done.
    fn catch_up(
        &mut self,
        view: TableId,
        shared: Option<&SharedTables>,
    ) -> Result<Option<usize>, MatViewError> {
        let guard = shared.map(SharedTables::read);
        let replicated = guard.as_deref().map(Site::tables);
        let Site {
            partition_id,
            tables,
            handlers,
            params,
            config,
        } = self;
        let handler = handlers.get_mut(view)?;
        let mut ctx = ExecutorContext::new(*partition_id, tables, replicated, params, config);
        if handler.needs_catch_up(&ctx)? {
            handler.catch_up_with_existing_data(&mut ctx).map(Some)
        } else {
            Ok(None)
        }
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Insert `tuple` into `table` and capture it as the table's delta.
    /// Returns the triggers to fire.
    pub fn apply_insert(
        &mut self,
        table: TableId,
        tuple: Tuple,
    ) -> Result<Vec<ViewTrigger>, MatViewError> {
        let target = self.tables.get_mut(table)?;
        target.insert(tuple.clone())?;
        target.set_delta(vec![tuple]);
        Ok(target.view_triggers().to_vec())
    }

    /// Delete the row matching `tuple` (by primary key when the table has
    /// one) and capture it as the table's delta. Returns the removed row
    /// and the triggers to fire.
    pub fn apply_delete(
        &mut self,
        table: TableId,
        tuple: &Tuple,
    ) -> Result<(Tuple, Vec<ViewTrigger>), MatViewError> {
        let target = self.tables.get_mut(table)?;
        let row = target.locate(tuple)?.ok_or_else(|| {
            MatViewError::InvalidArgument(format!("no row {tuple} in table {}", target.name()))
        })?;
        let removed = target.delete(row)?;
        target.set_delta(vec![removed.clone()]);
        Ok((removed, target.view_triggers().to_vec()))
    }

    /// Leave delta-capture for `table`.
    pub fn finish_mutation(&mut self, table: TableId) {
        if let Ok(target) = self.tables.get_mut(table) {
            target.clear_delta();
        }
    }

    pub fn insert_tuple(
        &mut self,
        table: TableId,
        tuple: Tuple,
        replicated: Option<&TableStore>,
    ) -> Result<(), MatViewError> {
        let triggers = self.apply_insert(table, tuple)?;
        let result = self.fire_local_triggers(table, &triggers, replicated, Mutation::Insert);
        self.finish_mutation(table);
        result
    }

    pub fn delete_tuple(
        &mut self,
        table: TableId,
        tuple: &Tuple,
        replicated: Option<&TableStore>,
    ) -> Result<Tuple, MatViewError> {
        let (removed, triggers) = self.apply_delete(table, tuple)?;
        let result = self.fire_local_triggers(table, &triggers, replicated, Mutation::Delete);
        self.finish_mutation(table);
        result.map(|()| removed)
    }

    fn fire_local_triggers(
        &mut self,
        source: TableId,
        triggers: &[ViewTrigger],
        replicated: Option<&TableStore>,
        mutation: Mutation,
    ) -> Result<(), MatViewError> {
        debug!(
            table = %source,
            partition = self.partition_id,
            %mutation,
            triggers = triggers.len(),
            "firing view triggers"
        );
        for trigger in triggers {
            match trigger {
                ViewTrigger::Local { view } => {
                    self.fire_trigger(*view, source, replicated, mutation)?;
                }
                ViewTrigger::Bridged(wrapper) => {
                    return Err(MatViewError::InternalError(format!(
                        "table {source} in partition {} carries a bridged trigger for view {}",
                        self.partition_id, wrapper.view
                    )));
                }
            }
        }
        Ok(())
    }

    /// Invoke the handler of `view` for a mutation of `source` in this
    /// site's context. Disabled handlers are skipped.
    pub fn fire_trigger(
        &mut self,
        view: TableId,
        source: TableId,
        replicated: Option<&TableStore>,
        mutation: Mutation,
    ) -> Result<(), MatViewError> {
        let Site {
            partition_id,
            tables,
            handlers,
            params,
            config,
        } = self;
        let handler = handlers.get_mut(view)?;
        if !handler.is_enabled() {
            return Ok(());
        }
        let mut ctx = ExecutorContext::new(*partition_id, tables, replicated, params, config);
        handler.handle(&mut ctx, source, mutation)
    }
}
