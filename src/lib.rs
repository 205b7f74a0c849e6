//! matview — incremental materialized view maintenance.
//!
//! A materialized view is a destination table holding
//! `GROUP BY` aggregates (`COUNT(*)`, `COUNT`, `SUM`, `MIN`, `MAX`) over one
//! or more source tables. Instead of recomputing the view after every write,
//! each source mutation fires the view's handler, which runs the view's
//! query over just the mutated rows and merges the result into the stored
//! aggregate row for that group: adding on insert, subtracting on delete,
//! dropping groups whose count reaches zero and recomputing a MIN/MAX from
//! the source only when the deleted value was the current extremum.
//!
//! # Layout
//!
//! - [`storage`]: tables, indexes, delta capture and trigger lists.
//! - [`plan`]: the execution context and the plans a view runs.
//! - [`view`]: view handlers, the merge algebra and placement bridging.
//! - [`site`]: one partition's single-threaded execution context.
//! - [`cluster`]: all partitions plus the replicated store; the public
//!   install and write API.
//! - [`catalog`]: JSON loading of table and view definitions.
//!
//! # Theoretical Basis
//!
//! - **Gupta & Mumick (1995)**: "Maintenance of Materialized Views: Problems,
//!   Techniques, and Applications", IEEE Data Engineering Bulletin.
//! - **Counting algorithm**: Gupta, Mumick & Subrahmanian, "Maintaining Views
//!   Incrementally", SIGMOD 1993. The `COUNT(*)` column plays the role of the
//!   per-group derivation count.

pub mod catalog;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hash;
pub mod plan;
pub mod site;
pub mod storage;
pub mod value;
pub mod view;

pub use catalog::{CatalogSpec, ViewSpec};
pub use cluster::Cluster;
pub use config::EngineConfig;
pub use error::{ErrorKind, MatViewError};
pub use plan::{ExecutorContext, QueryPlan, TempTable};
pub use site::Site;
pub use storage::{ColumnDef, IndexDef, Placement, TableDef, TableId};
pub use value::{ColumnType, Tuple, Value};
pub use view::{AggregateKind, ExpressionType, Mutation, ViewDefinition, ViewHandler};
