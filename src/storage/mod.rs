//! Table storage: definitions, placement, and per-context table stores.
//!
//! Each partition's site owns a [`TableStore`] with its copy of every
//! partitioned table. Replicated tables live once, in the store shared by
//! all sites (see [`crate::view::placement::SharedTables`]).

pub mod index;
pub mod table;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MatViewError;
use crate::view::aggregate::ExpressionType;
use crate::value::ColumnType;

pub use index::{IndexDef, IndexId, RowId, TableIndex};
pub use table::PersistentTable;

/// Catalog identity of a table, the same in every partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub u32);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether a table has one copy per partition or one shared copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Placement {
    /// One independent copy per partition, rows routed by `column`.
    Partitioned { column: usize },
    /// One logical copy shared across all partitions.
    Replicated,
}

impl Placement {
    pub fn is_replicated(&self) -> bool {
        matches!(self, Placement::Replicated)
    }

    pub fn is_partitioned(&self) -> bool {
        !self.is_replicated()
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Aggregate computed into this column when the table is a view.
    #[serde(default)]
    pub aggregate: Option<ExpressionType>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        ColumnDef {
            name: name.to_string(),
            column_type,
            nullable: true,
            aggregate: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn aggregate(mut self, expression: ExpressionType) -> Self {
        self.aggregate = Some(expression);
        self
    }
}

/// Definition of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default = "default_placement")]
    pub placement: Placement,
    #[serde(default)]
    pub primary_key: Option<IndexDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
}

fn default_placement() -> Placement {
    Placement::Replicated
}

impl TableDef {
    /// A replicated table without indexes.
    pub fn new(id: TableId, name: &str, columns: Vec<ColumnDef>) -> Self {
        TableDef {
            id,
            name: name.to_string(),
            columns,
            placement: Placement::Replicated,
            primary_key: None,
            indexes: Vec::new(),
        }
    }

    pub fn partitioned_on(mut self, column: usize) -> Self {
        self.placement = Placement::Partitioned { column };
        self
    }

    pub fn with_primary_key(mut self, columns: &[usize]) -> Self {
        self.primary_key = Some(IndexDef::new(&format!("{}_pkey", self.name), columns, true));
        self
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn validate(&self) -> Result<(), MatViewError> {
        let width = self.columns.len();
        if width == 0 {
            return Err(MatViewError::InvalidArgument(format!(
                "table {} has no columns",
                self.name
            )));
        }
        if let Placement::Partitioned { column } = self.placement {
            if column >= width {
                return Err(MatViewError::InvalidArgument(format!(
                    "partition column {column} out of range for table {}",
                    self.name
                )));
            }
        }
        for idx in self.primary_key.iter().chain(&self.indexes) {
            if idx.columns.iter().any(|&c| c >= width) {
                return Err(MatViewError::InvalidArgument(format!(
                    "index {} references a column outside table {}",
                    idx.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// The tables visible to one execution context.
#[derive(Debug, Clone, Default)]
pub struct TableStore {
    tables: BTreeMap<TableId, PersistentTable>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, def: TableDef) -> Result<&mut PersistentTable, MatViewError> {
        if self.tables.contains_key(&def.id) {
            return Err(MatViewError::AlreadyExists(format!("table {} ({})", def.name, def.id)));
        }
        let id = def.id;
        let table = PersistentTable::new(def)?;
        Ok(self.tables.entry(id).or_insert(table))
    }

    pub fn drop_table(&mut self, id: TableId) -> Result<PersistentTable, MatViewError> {
        self.tables.remove(&id).ok_or(MatViewError::TableNotFound(id))
    }

    pub fn contains(&self, id: TableId) -> bool {
        self.tables.contains_key(&id)
    }

    pub fn get(&self, id: TableId) -> Result<&PersistentTable, MatViewError> {
        self.tables.get(&id).ok_or(MatViewError::TableNotFound(id))
    }

    pub fn get_mut(&mut self, id: TableId) -> Result<&mut PersistentTable, MatViewError> {
        self.tables.get_mut(&id).ok_or(MatViewError::TableNotFound(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PersistentTable> {
        self.tables.values().find(|t| t.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PersistentTable> {
        self.tables.values()
    }
}
