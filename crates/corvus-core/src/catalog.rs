//! Table catalog: schemas and table → storage-block bookkeeping.
//!
//! DDL is applied immediately under the catalog lock; it does not
//! participate in the version protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CatalogError;
use crate::value::ValueType;
use crate::types::Oid;

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub value_type: ValueType,
}

/// An ordered set of columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// Catalog entry for one table.
#[derive(Debug)]
pub struct TableInfo {
    pub oid: Oid,
    pub name: String,
    pub schema: Schema,
    /// Storage blocks holding this table's tuple versions, in allocation order.
    pub blocks: RwLock<Vec<u32>>,
}

impl TableInfo {
    fn new(oid: Oid, name: String, schema: Schema) -> Self {
        Self {
            oid,
            name,
            schema,
            blocks: RwLock::new(Vec::new()),
        }
    }
}

/// The process-wide table catalog.
#[derive(Debug, Default)]
pub struct Catalog {
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
    next_oid: AtomicU32,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_oid: AtomicU32::new(1),
        }
    }

    pub fn create_table(&self, name: &str, schema: Schema) -> Result<Arc<TableInfo>, CatalogError> {
        let mut seen: Vec<&str> = Vec::with_capacity(schema.len());
        for column in schema.columns() {
            if seen.contains(&column.name.as_str()) {
                return Err(CatalogError::DuplicateColumn(column.name.clone()));
            }
            seen.push(&column.name);
        }

        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(CatalogError::TableAlreadyExists(name.to_string()));
        }
        let oid = self.next_oid.fetch_add(1, Ordering::Relaxed);
        let info = Arc::new(TableInfo::new(oid, name.to_string(), schema));
        tables.insert(name.to_string(), Arc::clone(&info));
        Ok(info)
    }

    pub fn drop_table(&self, name: &str) -> Result<(), CatalogError> {
        match self.tables.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(CatalogError::TableNotFound(name.to_string())),
        }
    }

    pub fn table(&self, name: &str) -> Result<Arc<TableInfo>, CatalogError> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::TableNotFound(name.to_string()))
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }
}
