//! Bridging between replicated and partitioned tables.
//!
//! Every partition is served by one [`Site`] that owns the partition's
//! tables and view handlers. Replicated tables live once, in
//! [`SharedTables`], whose write lock doubles as the cross-placement lock:
//! registering a trigger on a replicated table and writing to one both
//! require it.
//!
//! A partitioned view whose source is replicated cannot register its handler
//! on the source directly; the mutation runs in whichever context performs
//! the replicated write. Instead it registers a [`PlacementWrapper`] naming
//! the partition that owns the handler. When the trigger fires, the wrapper
//! switches into that partition's context through [`SiteContexts::enter`]
//! and invokes the handler there. The switch is only valid while every
//! site is held by the writer, which the wrapper checks before entering.

use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

use crate::config::EngineConfig;
use crate::error::MatViewError;
use crate::hash::PartitionId;
use crate::site::Site;
use crate::storage::{TableId, TableStore};
use crate::view::Mutation;

/// Partition whose context runs work on replicated tables.
pub const REPLICATED_CONTEXT: PartitionId = 0;

/// Entry in a table's view-trigger list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewTrigger {
    /// The handler lives in the same context as the table.
    Local { view: TableId },
    /// The handler lives in another partition's context.
    Bridged(PlacementWrapper),
}

impl ViewTrigger {
    pub fn view(&self) -> TableId {
        match self {
            ViewTrigger::Local { view } => *view,
            ViewTrigger::Bridged(wrapper) => wrapper.view,
        }
    }
}

/// Forwards trigger calls from a replicated source to the handler of a
/// partitioned view in partition `partition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementWrapper {
    pub partition: PartitionId,
    pub view: TableId,
}

impl PlacementWrapper {
    pub fn new(partition: PartitionId, view: TableId) -> Self {
        PlacementWrapper { partition, view }
    }

    /// Run the wrapped handler for a mutation of `source` inside the
    /// owning partition's context, restoring the caller's context after.
    pub fn fire(
        &self,
        contexts: &mut SiteContexts<'_>,
        shared: &TableStore,
        source: TableId,
        mutation: Mutation,
    ) -> Result<(), MatViewError> {
        if !contexts.is_single_threaded() {
            error!(
                view = %self.view,
                partition = self.partition,
                "replicated trigger fired outside single-threaded mode"
            );
            return Err(MatViewError::InternalError(format!(
                "cross-placement trigger for view {} requires every site to be held",
                self.view
            )));
        }
        let mut site = contexts.enter(self.partition)?;
        site.fire_trigger(self.view, source, Some(shared), mutation)
    }
}

// ── Shared (replicated) state ───────────────────────────────────────────

/// The replicated store behind the cross-placement lock.
///
/// Replicated tables, and the handlers of views over them, live in one
/// [`Site`] that runs in the [`REPLICATED_CONTEXT`] partition.
#[derive(Debug)]
pub struct SharedTables {
    site: RwLock<Site>,
}

impl SharedTables {
    pub fn new(config: EngineConfig) -> Self {
        SharedTables {
            site: RwLock::new(Site::new(REPLICATED_CONTEXT, config)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Site> {
        self.site.read()
    }

    /// Take the cross-placement lock.
    pub fn write(&self) -> RwLockWriteGuard<'_, Site> {
        self.site.write()
    }
}

/// Fire the triggers of a mutated replicated table.
///
/// Replicated views run in the replicated store itself; partitioned views
/// run through their placement wrapper in their own partition's context.
pub fn fire_replicated_triggers(
    contexts: &mut SiteContexts<'_>,
    replicated: &mut Site,
    source: TableId,
    triggers: &[ViewTrigger],
    mutation: Mutation,
) -> Result<(), MatViewError> {
    for trigger in triggers {
        match trigger {
            ViewTrigger::Local { view } => {
                replicated.fire_trigger(*view, source, None, mutation)?;
            }
            ViewTrigger::Bridged(wrapper) => {
                wrapper.fire(contexts, replicated.tables(), source, mutation)?;
            }
        }
    }
    Ok(())
}

// ── Context switching ───────────────────────────────────────────────────

/// Every site, held at once by the thread performing a replicated write.
///
/// Exactly one partition is current at a time. [`enter`](Self::enter)
/// switches to another partition for the lifetime of the returned scope.
pub struct SiteContexts<'a> {
    sites: Vec<MutexGuard<'a, Site>>,
    current: PartitionId,
}

impl<'a> SiteContexts<'a> {
    /// Lock every site in partition order.
    pub fn lock_all(sites: &'a [Mutex<Site>]) -> Self {
        SiteContexts {
            sites: sites.iter().map(|site| site.lock()).collect(),
            current: REPLICATED_CONTEXT,
        }
    }

    pub fn current(&self) -> PartitionId {
        self.current
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Whether every partition's site is held, in partition order.
    pub fn is_single_threaded(&self) -> bool {
        !self.sites.is_empty()
            && self
                .sites
                .iter()
                .enumerate()
                .all(|(i, site)| site.partition_id() as usize == i)
    }

    /// Switch to `partition` until the returned scope is dropped.
    pub fn enter(&mut self, partition: PartitionId) -> Result<ContextScope<'_, 'a>, MatViewError> {
        if partition as usize >= self.sites.len() {
            return Err(MatViewError::InternalError(format!(
                "no site for partition {partition}"
            )));
        }
        let previous = std::mem::replace(&mut self.current, partition);
        debug!(from = previous, to = partition, "entering site context");
        Ok(ContextScope {
            contexts: self,
            previous,
        })
    }

    pub fn sites_mut(&mut self) -> impl Iterator<Item = &mut Site> {
        self.sites.iter_mut().map(|guard| &mut **guard)
    }
}

/// Guard returned by [`SiteContexts::enter`]; dereferences to the entered
/// site and restores the previous partition when dropped.
pub struct ContextScope<'s, 'a> {
    contexts: &'s mut SiteContexts<'a>,
    previous: PartitionId,
}

impl Deref for ContextScope<'_, '_> {
    type Target = Site;

    fn deref(&self) -> &Site {
        &self.contexts.sites[self.contexts.current as usize]
    }
}

impl DerefMut for ContextScope<'_, '_> {
    fn deref_mut(&mut self) -> &mut Site {
        let current = self.contexts.current as usize;
        &mut self.contexts.sites[current]
    }
}

impl Drop for ContextScope<'_, '_> {
    fn drop(&mut self) {
        debug!(
            from = self.contexts.current,
            to = self.previous,
            "leaving site context"
        );
        self.contexts.current = self.previous;
    }
}
