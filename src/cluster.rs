//! The engine front door: every partition's site plus the replicated store.
//!
//! [`Cluster`] routes each write by the placement of the table it touches:
//!
//! - a partitioned table's row goes to the site owning its partition key;
//!   that site's lock is held, then the replicated store is read-locked so
//!   joins and bridged sources can see replicated tables;
//! - a replicated table's row is written with every site locked and the
//!   cross-placement lock held. That is the single-threaded mode in which
//!   placement wrappers may switch into other partitions' contexts.
//!
//! Locks are always taken sites first (in partition order), then the
//! replicated store.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::MatViewError;
use crate::hash::{partition_for, PartitionId};
use crate::site::Site;
use crate::storage::{Placement, TableDef, TableId};
use crate::value::Tuple;
use crate::view::placement::{fire_replicated_triggers, SharedTables, SiteContexts};
use crate::view::{Mutation, ViewDefinition};

/// Where an installed view's handlers live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ViewLocation {
    destination: TableId,
    replicated: bool,
}

#[derive(Debug)]
pub struct Cluster {
    config: EngineConfig,
    sites: Vec<Mutex<Site>>,
    shared: SharedTables,
    placements: RwLock<BTreeMap<TableId, Placement>>,
}

impl Cluster {
    pub fn new(config: EngineConfig) -> Result<Self, MatViewError> {
        config.validate()?;
        let sites = (0..config.partition_count)
            .map(|p| Mutex::new(Site::new(p, config.clone())))
            .collect();
        info!(partitions = config.partition_count, "cluster started");
        Ok(Cluster {
            shared: SharedTables::new(config.clone()),
            config,
            sites,
            placements: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn partition_count(&self) -> u32 {
        self.config.partition_count
    }

    // ── Tables ──────────────────────────────────────────────────────────

    /// Create a table: once in the replicated store, or one copy per site
    /// for a partitioned table.
    pub fn create_table(&self, def: TableDef) -> Result<(), MatViewError> {
        def.validate()?;
        let mut placements = self.placements.write();
        if placements.contains_key(&def.id) {
            return Err(MatViewError::AlreadyExists(format!("table {}", def.id)));
        }
        let (id, placement) = (def.id, def.placement);
        match placement {
            Placement::Replicated => self.shared.write().create_table(def)?,
            Placement::Partitioned { .. } => {
                let mut contexts = SiteContexts::lock_all(&self.sites);
                for site in contexts.sites_mut() {
                    site.create_table(def.clone())?;
                }
            }
        }
        placements.insert(id, placement);
        debug!(table = %id, replicated = placement.is_replicated(), "created table");
        Ok(())
    }

    pub fn placement(&self, table: TableId) -> Result<Placement, MatViewError> {
        self.placements
            .read()
            .get(&table)
            .copied()
            .ok_or(MatViewError::TableNotFound(table))
    }

    /// Every row of `table` across all partitions, in partition order.
    pub fn rows(&self, table: TableId) -> Result<Vec<Tuple>, MatViewError> {
        match self.placement(table)? {
            Placement::Replicated => {
                Ok(self.shared.read().tables().get(table)?.tuples().cloned().collect())
            }
            Placement::Partitioned { .. } => {
                let mut rows = Vec::new();
                for p in 0..self.partition_count() {
                    rows.extend(self.partition_rows(table, p)?);
                }
                Ok(rows)
            }
        }
    }

    /// Rows of a partitioned `table` held by one partition.
    pub fn partition_rows(
        &self,
        table: TableId,
        partition: PartitionId,
    ) -> Result<Vec<Tuple>, MatViewError> {
        let site = self.site(partition)?.lock();
        Ok(site.tables().get(table)?.tuples().cloned().collect())
    }

    fn site(&self, partition: PartitionId) -> Result<&Mutex<Site>, MatViewError> {
        self.sites.get(partition as usize).ok_or_else(|| {
            MatViewError::InvalidArgument(format!("no partition {partition}"))
        })
    }

    // ── Views ───────────────────────────────────────────────────────────

    /// Install (or reinstall) a view in every context that owns a copy of
    /// its destination.
    pub fn install_view(&self, def: &ViewDefinition) -> Result<(), MatViewError> {
        def.validate()?;
        match self.placement(def.destination)? {
            Placement::Replicated => {
                for source in &def.sources {
                    if !self.placement(*source)?.is_replicated() {
                        return Err(MatViewError::invalid_view(
                            &def.name,
                            format!("replicated view cannot read partitioned table {source}"),
                        ));
                    }
                }
                self.shared.write().install_view(def, None).map(|_| ())
            }
            Placement::Partitioned { .. } => {
                for source in &def.sources {
                    self.placement(*source)?;
                }
                let mut contexts = SiteContexts::lock_all(&self.sites);
                let mut populated = Vec::with_capacity(contexts.len());
                let mut failure = None;
                for site in contexts.sites_mut() {
                    match site.install_view(def, Some(&self.shared)) {
                        Ok(caught_up) => populated.push(caught_up),
                        Err(e) => {
                            warn!(view = %def.name, partition = site.partition_id(), error = %e, "install failed");
                            failure = Some(e);
                            break;
                        }
                    }
                }
                let Some(e) = failure else {
                    return Ok(());
                };
                // Partitions must agree on which views exist. The failing
                // partition has already undone its own install.
                for (site, caught_up) in contexts.sites_mut().zip(populated) {
                    if let Err(undo) =
                        site.uninstall_view(def.destination, caught_up, Some(&self.shared))
                    {
                        warn!(view = %def.name, error = %undo, "failed to undo install");
                    }
                }
                Err(e)
            }
        }
    }

    pub fn drop_view(&self, name: &str) -> Result<(), MatViewError> {
        let location = self.locate_view(name)?;
        if location.replicated {
            self.shared.write().drop_view(location.destination, None)?;
        } else {
            let mut contexts = SiteContexts::lock_all(&self.sites);
            for site in contexts.sites_mut() {
                site.drop_view(location.destination, Some(&self.shared))?;
            }
        }
        Ok(())
    }

    /// Turn maintenance of a view on or off in every context.
    pub fn set_view_enabled(&self, name: &str, enabled: bool) -> Result<(), MatViewError> {
        let location = self.locate_view(name)?;
        if location.replicated {
            self.shared
                .write()
                .set_view_enabled(location.destination, enabled, None)
        } else {
            let mut contexts = SiteContexts::lock_all(&self.sites);
            for site in contexts.sites_mut() {
                site.set_view_enabled(location.destination, enabled, Some(&self.shared))?;
            }
            Ok(())
        }
    }

    pub fn is_view_enabled(&self, name: &str) -> Result<bool, MatViewError> {
        let location = self.locate_view(name)?;
        if location.replicated {
            Ok(self.shared.read().handlers().get(location.destination)?.is_enabled())
        } else {
            let site = self.site(0)?.lock();
            Ok(site.handlers().get(location.destination)?.is_enabled())
        }
    }

    /// Destination table of the view called `name`.
    pub fn view_table(&self, name: &str) -> Result<TableId, MatViewError> {
        self.locate_view(name).map(|location| location.destination)
    }

    fn locate_view(&self, name: &str) -> Result<ViewLocation, MatViewError> {
        if let Some(handler) = self.shared.read().handlers().find_by_name(name) {
            return Ok(ViewLocation {
                destination: handler.destination(),
                replicated: true,
            });
        }
        let site = self.site(0)?.lock();
        site.handlers()
            .find_by_name(name)
            .map(|handler| ViewLocation {
                destination: handler.destination(),
                replicated: false,
            })
            .ok_or_else(|| MatViewError::ViewNotFound(name.to_string()))
    }

    // ── Writes ──────────────────────────────────────────────────────────

    pub fn insert(&self, table: TableId, tuple: Tuple) -> Result<(), MatViewError> {
        match self.placement(table)? {
            Placement::Replicated => {
                let mut contexts = SiteContexts::lock_all(&self.sites);
                let mut replicated = self.shared.write();
                let triggers = replicated.apply_insert(table, tuple)?;
                let result = fire_replicated_triggers(
                    &mut contexts,
                    &mut replicated,
                    table,
                    &triggers,
                    Mutation::Insert,
                );
                replicated.finish_mutation(table);
                result
            }
            Placement::Partitioned { column } => {
                let partition = self.route(table, &tuple, column)?;
                let mut site = self.site(partition)?.lock();
                let replicated = self.shared.read();
                site.insert_tuple(table, tuple, Some(replicated.tables()))
            }
        }
    }

    /// Delete the row matching `tuple` and return it.
    pub fn delete(&self, table: TableId, tuple: &Tuple) -> Result<Tuple, MatViewError> {
        match self.placement(table)? {
            Placement::Replicated => {
                let mut contexts = SiteContexts::lock_all(&self.sites);
                let mut replicated = self.shared.write();
                let (removed, triggers) = replicated.apply_delete(table, tuple)?;
                let result = fire_replicated_triggers(
                    &mut contexts,
                    &mut replicated,
                    table,
                    &triggers,
                    Mutation::Delete,
                );
                replicated.finish_mutation(table);
                result.map(|()| removed)
            }
            Placement::Partitioned { column } => {
                let partition = self.route(table, tuple, column)?;
                let mut site = self.site(partition)?.lock();
                let replicated = self.shared.read();
                site.delete_tuple(table, tuple, Some(replicated.tables()))
            }
        }
    }

    /// Replace `old` with `new`: a delete then an insert, each seen by the
    /// table's views.
    pub fn update(&self, table: TableId, old: &Tuple, new: Tuple) -> Result<Tuple, MatViewError> {
        let removed = self.delete(table, old)?;
        self.insert(table, new)?;
        Ok(removed)
    }

    fn route(&self, table: TableId, tuple: &Tuple, column: usize) -> Result<PartitionId, MatViewError> {
        let key = tuple.get(column).ok_or_else(|| {
            MatViewError::InvalidArgument(format!(
                "tuple {tuple} has no partition column {column} for table {table}"
            ))
        })?;
        Ok(partition_for(key, self.partition_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ColumnDef;
    use crate::tuple;
    use crate::value::ColumnType;

    fn table(id: u32, placement: Option<usize>) -> TableDef {
        let def = TableDef::new(
            TableId(id),
            "t",
            vec![
                ColumnDef::new("k", ColumnType::BigInt),
                ColumnDef::new("v", ColumnType::BigInt),
            ],
        );
        match placement {
            Some(column) => def.partitioned_on(column),
            None => def,
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = EngineConfig::default().with_partition_count(0);
        assert!(matches!(
            Cluster::new(config),
            Err(MatViewError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rows_route_to_partitions() {
        let cluster = Cluster::new(EngineConfig::default().with_partition_count(4)).unwrap();
        cluster.create_table(table(1, Some(0))).unwrap();
        for k in 0..20 {
            cluster.insert(TableId(1), tuple![k, k * 10]).unwrap();
        }
        let mut total = 0;
        for p in 0..4 {
            let rows = cluster.partition_rows(TableId(1), p).unwrap();
            for row in &rows {
                assert_eq!(partition_for(row.value(0), 4), p);
            }
            total += rows.len();
        }
        assert_eq!(total, 20);
        assert_eq!(cluster.rows(TableId(1)).unwrap().len(), 20);
    }

    #[test]
    fn test_duplicate_table() {
        let cluster = Cluster::new(EngineConfig::default()).unwrap();
        cluster.create_table(table(1, None)).unwrap();
        assert!(matches!(
            cluster.create_table(table(1, Some(0))),
            Err(MatViewError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_update_is_delete_then_insert() {
        let cluster = Cluster::new(EngineConfig::default().with_partition_count(2)).unwrap();
        cluster.create_table(table(1, Some(0))).unwrap();
        cluster.insert(TableId(1), tuple![1, 10]).unwrap();
        let old = cluster
            .update(TableId(1), &tuple![1, 10], tuple![1, 11])
            .unwrap();
        assert_eq!(old, tuple![1, 10]);
        assert_eq!(cluster.rows(TableId(1)).unwrap(), vec![tuple![1, 11]]);
    }

    #[test]
    fn test_unknown_table() {
        let cluster = Cluster::new(EngineConfig::default()).unwrap();
        assert!(matches!(
            cluster.insert(TableId(9), tuple![1, 2]),
            Err(MatViewError::TableNotFound(TableId(9)))
        ));
    }
}
