//! The view handler.
//!
//! One [`ViewHandler`] maintains one materialized view. It is registered as
//! a trigger on every source table and, after each committed source
//! mutation, folds the mutation's delta into the destination table:
//!
//! 1. The create plan runs with the mutated source in delta-capture mode,
//!    producing one delta tuple per affected group.
//! 2. Each delta tuple is matched to the existing view row through the
//!    destination's primary key (or the single row when there are no
//!    group-by columns).
//! 3. The row is merged column by column with the [aggregate algebra],
//!    inserted when the group is new, or deleted when its COUNT(*) reaches
//!    zero.
//! 4. A MIN/MAX column whose extremum was deleted is recomputed with the
//!    column's fallback plan, outside delta-capture mode.
//!
//! The destination layout is `[group-by columns 0..G][aggregates G..G+A]`.
//! The primary key of a grouped view is exactly the group-by columns, so
//! merges never change it and only secondary indexes are refreshed.
//!
//! [aggregate algebra]: crate::view::aggregate

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use crate::error::MatViewError;
use crate::hash::PartitionId;
use crate::plan::{ExecutorContext, QueryPlan};
use crate::storage::{IndexId, PersistentTable, RowId, TableId, TableStore};
use crate::value::{Tuple, Value};
use crate::view::aggregate::{AggregateKind, DeleteOutcome};
use crate::view::placement::{PlacementWrapper, SharedTables, ViewTrigger};
use crate::view::{Mutation, ViewDefinition};

/// How the handler is attached to one source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceAttachment {
    relative_index: u32,
    trigger: ViewTrigger,
}

#[derive(Debug)]
pub struct ViewHandler {
    name: String,
    destination: TableId,
    partition_id: PartitionId,
    partitioned: bool,
    group_by_count: usize,
    agg_kinds: Vec<AggregateKind>,
    count_star_column: usize,
    /// Fallback plan key per aggregate column; `Some` for MIN/MAX only.
    fallback_keys: Vec<Option<usize>>,
    create_plan: Arc<dyn QueryPlan>,
    fallback_plans: Vec<Arc<dyn QueryPlan>>,
    updatable_indexes: Vec<IndexId>,
    sources: BTreeMap<TableId, SourceAttachment>,
    wrapper: Option<PlacementWrapper>,
    dirty: bool,
    enabled: bool,
    // Scratch rows reused across merges.
    existing: Tuple,
    updated: Tuple,
}

impl ViewHandler {
    /// Validate `def` against the destination schema and build a detached
    /// handler for partition `partition_id`.
    pub fn new(
        def: &ViewDefinition,
        destination: &PersistentTable,
        partition_id: PartitionId,
    ) -> Result<Self, MatViewError> {
        def.validate()?;
        if destination.id() != def.destination {
            return Err(MatViewError::InternalError(format!(
                "view {} built against table {} instead of {}",
                def.name,
                destination.id(),
                def.destination
            )));
        }

        let columns = &destination.def().columns;
        let width = columns.len();
        let g = def.group_by_count;
        if g > width {
            return Err(MatViewError::invalid_view(
                &def.name,
                format!("{g} group-by columns but the destination has {width} columns"),
            ));
        }

        let mut agg_kinds = Vec::with_capacity(width - g);
        let mut fallback_keys = Vec::with_capacity(width - g);
        let mut count_star_column = None;
        let mut extremum_count = 0;
        for (i, column) in columns.iter().enumerate() {
            if i < g {
                if column.aggregate.is_some() {
                    return Err(MatViewError::invalid_view(
                        &def.name,
                        format!("group-by column {} carries an aggregate", column.name),
                    ));
                }
                continue;
            }
            let expression = column.aggregate.as_ref().ok_or_else(|| {
                MatViewError::invalid_view(
                    &def.name,
                    format!("column {} has no aggregate expression", column.name),
                )
            })?;
            let kind = AggregateKind::try_from(expression).map_err(|unsupported| {
                MatViewError::UnsupportedAggregate {
                    view: def.name.clone(),
                    agg_index: i - g,
                    expression: unsupported.to_string(),
                }
            })?;
            if kind == AggregateKind::CountStar && count_star_column.is_none() {
                count_star_column = Some(i);
            }
            if kind.is_extremum() {
                fallback_keys.push(Some(extremum_count));
                extremum_count += 1;
            } else {
                fallback_keys.push(None);
            }
            agg_kinds.push(kind);
        }

        let count_star_column = count_star_column.ok_or_else(|| {
            MatViewError::invalid_view(&def.name, "view has no COUNT(*) column")
        })?;
        if def.fallback_plans.len() != extremum_count {
            return Err(MatViewError::invalid_view(
                &def.name,
                format!(
                    "{extremum_count} MIN/MAX columns but {} fallback plans",
                    def.fallback_plans.len()
                ),
            ));
        }
        if g > 0 {
            let expected: Vec<usize> = (0..g).collect();
            match destination.primary_key_index() {
                Some(pk) if pk.is_unique() && pk.columns() == expected.as_slice() => {}
                _ => {
                    return Err(MatViewError::invalid_view(
                        &def.name,
                        format!("primary key must be exactly the {g} group-by columns"),
                    ));
                }
            }
        }

        Ok(ViewHandler {
            name: def.name.clone(),
            destination: def.destination,
            partition_id,
            partitioned: destination.placement().is_partitioned(),
            group_by_count: g,
            agg_kinds,
            count_star_column,
            fallback_keys,
            create_plan: Arc::clone(&def.create_plan),
            fallback_plans: def.fallback_plans.values().cloned().collect(),
            updatable_indexes: Vec::new(),
            sources: BTreeMap::new(),
            wrapper: None,
            dirty: false,
            enabled: true,
            existing: Tuple::nulls(width),
            updated: Tuple::nulls(width),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn destination(&self) -> TableId {
        self.destination
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn group_by_count(&self) -> usize {
        self.group_by_count
    }

    pub fn aggregate_count(&self) -> usize {
        self.agg_kinds.len()
    }

    pub fn aggregate_kinds(&self) -> &[AggregateKind] {
        &self.agg_kinds
    }

    pub fn count_star_column(&self) -> usize {
        self.count_star_column
    }

    pub fn updatable_indexes(&self) -> &[IndexId] {
        &self.updatable_indexes
    }

    /// Attached sources with their relative index in the view definition.
    pub fn source_tables(&self) -> impl Iterator<Item = (TableId, u32)> + '_ {
        self.sources.iter().map(|(id, a)| (*id, a.relative_index))
    }

    pub fn is_attached(&self, source: TableId) -> bool {
        self.sources.contains_key(&source)
    }

    pub fn placement_wrapper(&self) -> Option<&PlacementWrapper> {
        self.wrapper.as_ref()
    }

    /// Whether the attachment topology changed since the last install.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled && !enabled {
            warn!(view = %self.name, partition = self.partition_id, "view maintenance disabled");
        }
        self.enabled = enabled;
    }

    // ── Attachment ──────────────────────────────────────────────────────

    /// Register this view as a trigger on `source`.
    ///
    /// Sources found in `local` get a direct trigger. A replicated source
    /// feeding a partitioned view lives in `shared`; it gets this handler's
    /// placement wrapper, registered under the cross-placement lock.
    pub fn add_source_table(
        &mut self,
        local: &mut TableStore,
        shared: Option<&SharedTables>,
        source: TableId,
        relative_index: u32,
    ) -> Result<(), MatViewError> {
        if self.sources.contains_key(&source) {
            return Err(MatViewError::SourceAlreadyAttached {
                view: self.name.clone(),
                source_table: source,
            });
        }

        let trigger = if local.contains(source) {
            let trigger = ViewTrigger::Local {
                view: self.destination,
            };
            local.get_mut(source)?.add_view_trigger(trigger);
            trigger
        } else {
            if !self.partitioned {
                return Err(MatViewError::invalid_view(
                    &self.name,
                    format!("replicated view cannot read partitioned table {source}"),
                ));
            }
            let shared = shared.ok_or(MatViewError::TableNotFound(source))?;
            let mut replicated = shared.write();
            let table = replicated.tables_mut().get_mut(source)?;
            let (partition, view) = (self.partition_id, self.destination);
            let wrapper = *self
                .wrapper
                .get_or_insert_with(|| PlacementWrapper::new(partition, view));
            let trigger = ViewTrigger::Bridged(wrapper);
            table.add_view_trigger(trigger);
            trigger
        };

        debug!(
            view = %self.name,
            source = %source,
            partition = self.partition_id,
            bridged = matches!(trigger, ViewTrigger::Bridged(_)),
            "attached source table"
        );
        self.sources.insert(
            source,
            SourceAttachment {
                relative_index,
                trigger,
            },
        );
        self.dirty = true;
        Ok(())
    }

    /// Unregister this view from `source`, under the same lock discipline
    /// as [`add_source_table`](Self::add_source_table).
    pub fn drop_source_table(
        &mut self,
        local: &mut TableStore,
        shared: Option<&SharedTables>,
        source: TableId,
    ) -> Result<(), MatViewError> {
        let attachment = self.sources.get(&source).copied().ok_or_else(|| {
            MatViewError::SourceNotAttached {
                view: self.name.clone(),
                source_table: source,
            }
        })?;
        let removed = match attachment.trigger {
            ViewTrigger::Local { .. } => local
                .get_mut(source)?
                .drop_view_trigger(&attachment.trigger),
            ViewTrigger::Bridged(_) => {
                let shared = shared.ok_or_else(|| {
                    MatViewError::InternalError(format!(
                        "view {} detaching bridged source {source} without the replicated store",
                        self.name
                    ))
                })?;
                let mut replicated = shared.write();
                replicated
                    .tables_mut()
                    .get_mut(source)?
                    .drop_view_trigger(&attachment.trigger)
            }
        };
        if !removed {
            warn!(view = %self.name, source = %source, "trigger was already unregistered");
        }
        debug!(view = %self.name, source = %source, partition = self.partition_id, "detached source table");
        self.sources.remove(&source);
        self.dirty = true;
        Ok(())
    }

    /// Drop every attachment, then release the placement wrapper.
    pub fn detach_all(
        &mut self,
        local: &mut TableStore,
        shared: Option<&SharedTables>,
    ) -> Result<(), MatViewError> {
        let sources: Vec<TableId> = self.sources.keys().copied().collect();
        for source in sources {
            self.drop_source_table(local, shared, source)?;
        }
        self.wrapper = None;
        Ok(())
    }

    /// Capture the destination's secondary indexes and attach to `sources`.
    ///
    /// On failure every attachment made so far is undone.
    pub fn install(
        &mut self,
        sources: &[TableId],
        local: &mut TableStore,
        shared: Option<&SharedTables>,
    ) -> Result<(), MatViewError> {
        let destination = local.get(self.destination)?;
        let primary = destination.primary_key_index().map(|pk| pk.id());
        self.updatable_indexes = destination
            .indexes()
            .iter()
            .map(|idx| idx.id())
            .filter(|id| Some(*id) != primary)
            .collect();

        for (position, source) in sources.iter().enumerate() {
            if let Err(e) = self.add_source_table(local, shared, *source, position as u32) {
                if let Err(undo) = self.detach_all(local, shared) {
                    warn!(view = %self.name, error = %undo, "failed to undo partial install");
                }
                return Err(e);
            }
        }
        self.dirty = false;
        info!(
            view = %self.name,
            partition = self.partition_id,
            sources = sources.len(),
            group_by = self.group_by_count,
            aggregates = self.agg_kinds.len(),
            "installed view handler"
        );
        Ok(())
    }

    // ── Catch-up ────────────────────────────────────────────────────────

    /// Whether a freshly installed view must be populated: its destination
    /// is empty and it either has no group-by columns or some source has
    /// rows.
    pub fn needs_catch_up(&self, ctx: &ExecutorContext<'_>) -> Result<bool, MatViewError> {
        if !ctx.table(self.destination)?.is_empty() {
            return Ok(false);
        }
        if self.group_by_count == 0 {
            return Ok(true);
        }
        for source in self.sources.keys() {
            if !ctx.table(*source)?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run the create plan over the full source contents and insert its
    /// rows directly. Returns the number of rows inserted.
    pub fn catch_up_with_existing_data(
        &mut self,
        ctx: &mut ExecutorContext<'_>,
    ) -> Result<usize, MatViewError> {
        let rows = ctx.execute(self.create_plan.as_ref())?;
        let destination = ctx.local_mut().get_mut(self.destination)?;
        let mut inserted = 0;
        for row in rows {
            self.check_width(&row)?;
            destination.insert(row)?;
            inserted += 1;
        }
        info!(
            view = %self.name,
            partition = self.partition_id,
            rows = inserted,
            "caught up with existing data"
        );
        Ok(inserted)
    }

    // ── Trigger entry points ────────────────────────────────────────────

    pub fn handle(
        &mut self,
        ctx: &mut ExecutorContext<'_>,
        source: TableId,
        mutation: Mutation,
    ) -> Result<(), MatViewError> {
        match mutation {
            Mutation::Insert => self.handle_tuple_insert(ctx, source),
            Mutation::Delete => self.handle_tuple_delete(ctx, source),
        }
    }

    /// Fold the rows just inserted into `source` into the view.
    pub fn handle_tuple_insert(
        &mut self,
        ctx: &mut ExecutorContext<'_>,
        source: TableId,
    ) -> Result<(), MatViewError> {
        self.ensure_attached(source)?;
        let mut scope = ctx.delta_scope(source);
        let deltas = scope.execute(self.create_plan.as_ref())?;

        for delta in deltas {
            self.check_width(&delta)?;
            match self.find_existing(&scope, &delta)? {
                Some(row) => {
                    self.merge_for_insert(&delta)?;
                    if scope.trace_merges() {
                        trace!(view = %self.name, delta = %delta, merged = %self.updated, "merged insert delta");
                    }
                    scope
                        .local_mut()
                        .get_mut(self.destination)?
                        .update_with_indexes(row, self.updated.clone(), &self.updatable_indexes)?;
                }
                None => {
                    if scope.trace_merges() {
                        trace!(view = %self.name, delta = %delta, "new group");
                    }
                    scope.local_mut().get_mut(self.destination)?.insert(delta)?;
                }
            }
        }
        Ok(())
    }

    /// Fold the rows just deleted from `source` out of the view.
    pub fn handle_tuple_delete(
        &mut self,
        ctx: &mut ExecutorContext<'_>,
        source: TableId,
    ) -> Result<(), MatViewError> {
        self.ensure_attached(source)?;
        let scope = ctx.delta_scope(source);
        let deltas = scope.execute(self.create_plan.as_ref())?;
        // Fallback plans must see the source as it is after the delete.
        drop(scope);

        let g = self.group_by_count;
        let cs = self.count_star_column;
        for delta in deltas {
            self.check_width(&delta)?;
            let Some(row) = self.find_existing(ctx, &delta)? else {
                let key = Tuple::new(delta[..g].to_vec()).to_string();
                error!(view = %self.name, key = %key, "deleted group has no view row");
                return Err(MatViewError::MissingViewRow {
                    view: self.name.clone(),
                    key,
                });
            };

            let group_emptied = self.existing.value(cs).compare(delta.value(cs))? == Ordering::Equal;
            if group_emptied && g > 0 {
                if ctx.trace_merges() {
                    trace!(view = %self.name, delta = %delta, "group emptied");
                }
                ctx.local_mut().get_mut(self.destination)?.delete(row)?;
                continue;
            }

            self.merge_for_delete(ctx, &delta)?;
            if ctx.trace_merges() {
                trace!(view = %self.name, delta = %delta, merged = %self.updated, "merged delete delta");
            }
            ctx.local_mut()
                .get_mut(self.destination)?
                .update_with_indexes(row, self.updated.clone(), &self.updatable_indexes)?;
        }
        Ok(())
    }

    // ── Merging ─────────────────────────────────────────────────────────

    /// Locate the view row for `delta`'s group and load it into the
    /// `existing` scratch row.
    fn find_existing(
        &mut self,
        ctx: &ExecutorContext<'_>,
        delta: &Tuple,
    ) -> Result<Option<RowId>, MatViewError> {
        let destination = ctx.local().get(self.destination)?;
        let row = if self.group_by_count == 0 {
            match destination.first_row() {
                Some(row) => Some(row),
                None => {
                    error!(view = %self.name, "view without group-by columns has no row");
                    return Err(MatViewError::MissingSingletonRow(self.name.clone()));
                }
            }
        } else {
            destination.lookup_by_key(&delta[..self.group_by_count])
        };
        if let Some(row) = row {
            let tuple = destination.get(row).ok_or_else(|| {
                MatViewError::InternalError(format!("index of {} points at a free slot", self.name))
            })?;
            self.existing.clone_from(tuple);
        }
        Ok(row)
    }

    /// Merge an insert delta into `existing`, writing `updated`.
    ///
    /// Group-by columns are taken from the existing row.
    pub fn merge_for_insert(&mut self, delta: &Tuple) -> Result<(), MatViewError> {
        self.updated.clone_from(&self.existing);
        for (i, kind) in self.agg_kinds.iter().enumerate() {
            let column = self.group_by_count + i;
            let merged = kind.insert_merge()(self.existing.value(column), delta.value(column))?;
            self.updated.set_value(column, merged);
        }
        Ok(())
    }

    /// Merge a delete delta into `existing`, writing `updated`. MIN/MAX
    /// columns whose extremum was removed are recomputed through `ctx`.
    pub fn merge_for_delete(
        &mut self,
        ctx: &mut ExecutorContext<'_>,
        delta: &Tuple,
    ) -> Result<(), MatViewError> {
        self.updated.clone_from(&self.existing);
        let cs = self.count_star_column;
        let remaining = self.existing.value(cs).checked_sub(delta.value(cs))?;
        if remaining.is_zero() {
            for (i, kind) in self.agg_kinds.iter().enumerate() {
                self.updated
                    .set_value(self.group_by_count + i, kind.empty_group_value());
            }
            return Ok(());
        }

        for i in 0..self.agg_kinds.len() {
            let kind = self.agg_kinds[i];
            let column = self.group_by_count + i;
            let merged = match kind.delete_merge()(self.existing.value(column), delta.value(column))? {
                DeleteOutcome::Value(v) => v,
                DeleteOutcome::Recompute => self.fallback_min_max_column(ctx, column, i)?,
            };
            self.updated.set_value(column, merged);
        }
        Ok(())
    }

    /// Recompute aggregate column `column` (aggregate index `agg_index`)
    /// for the group of the `existing` row with its fallback plan.
    fn fallback_min_max_column(
        &self,
        ctx: &mut ExecutorContext<'_>,
        column: usize,
        agg_index: usize,
    ) -> Result<Value, MatViewError> {
        let plan = self
            .fallback_keys
            .get(agg_index)
            .copied()
            .flatten()
            .and_then(|key| self.fallback_plans.get(key))
            .ok_or_else(|| {
                MatViewError::InternalError(format!(
                    "view {} has no fallback plan for column {column}",
                    self.name
                ))
            })?;
        let mut params = self.existing[..self.group_by_count].to_vec();
        params.push(self.existing.value(column).clone());

        let result = ctx.execute_with_params(plan.as_ref(), params)?;
        let value = result
            .first()
            .and_then(|row| row.first())
            .cloned()
            .unwrap_or_default();
        debug!(
            view = %self.name,
            column,
            removed = %self.existing.value(column),
            recomputed = %value,
            "recomputed extremum"
        );
        Ok(value)
    }

    fn ensure_attached(&self, source: TableId) -> Result<(), MatViewError> {
        if self.sources.contains_key(&source) {
            Ok(())
        } else {
            Err(MatViewError::SourceNotAttached {
                view: self.name.clone(),
                source_table: source,
            })
        }
    }

    fn check_width(&self, row: &Tuple) -> Result<(), MatViewError> {
        let width = self.group_by_count + self.agg_kinds.len();
        if row.len() == width {
            Ok(())
        } else {
            Err(MatViewError::invalid_view(
                &self.name,
                format!("create plan produced {} columns, view has {width}", row.len()),
            ))
        }
    }
}
