//! Structured view of a database schema, derived from extracted DDL.
mod cache;
mod ddl;

pub use cache::{SchemaCache, SchemaCacheEntry, SchemaSource};
pub use ddl::{parse_ddl, DdlDiagnostic, ParsedSchema};

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// Table name to ordered column/type pairs.
///
/// Lookups are case-insensitive; the original spelling of each name is kept
/// for display.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredSchema {
    tables: BTreeMap<String, TableSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
}

impl StructuredSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a table, replacing any earlier table with the same name.
    pub fn insert_table(&mut self, table: TableSchema) {
        self.tables.insert(table.name.to_lowercase(), table);
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableSchema> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column. A repeated name keeps its first position and takes
    /// the newer type.
    pub fn push_column(&mut self, name: impl Into<String>, data_type: impl Into<String>) {
        let name = name.into();
        let data_type = data_type.into();
        match self
            .columns
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(&name))
        {
            Some(existing) => existing.data_type = data_type,
            None => self.columns.push(ColumnSchema { name, data_type }),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

impl Serialize for StructuredSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.tables.len()))?;
        for table in self.tables.values() {
            map.serialize_entry(&table.name, table)?;
        }
        map.end()
    }
}

impl Serialize for TableSchema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for col in &self.columns {
            map.serialize_entry(&col.name, &col.data_type)?;
        }
        map.end()
    }
}
