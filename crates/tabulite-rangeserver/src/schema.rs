//! Table schemas, as far as recovery needs them.
//!
//! Recovery never interprets cell contents; a schema here is the handle
//! a phantom range carries so the eventual live range knows its column
//! families. Registries are populated out of band by the schema
//! subsystem.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tabulite_types::TableId;

/// Column-family layout of one table generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub table_id: String,
    pub generation: u32,
    pub column_families: Vec<String>,
}

impl Schema {
    pub fn new(table: &TableId, column_families: Vec<String>) -> Self {
        Self {
            table_id: table.id.clone(),
            generation: table.generation,
            column_families,
        }
    }
}

/// Thread-safe schema lookup by table id.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: Mutex<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, schema: Schema) {
        self.schemas
            .lock()
            .unwrap()
            .insert(schema.table_id.clone(), Arc::new(schema));
    }

    /// The registered schema, or a minimal default for tables the schema
    /// subsystem hasn't pushed yet.
    pub fn get_or_default(&self, table: &TableId) -> Arc<Schema> {
        self.schemas
            .lock()
            .unwrap()
            .entry(table.id.clone())
            .or_insert_with(|| Arc::new(Schema::new(table, vec!["default".to_string()])))
            .clone()
    }
}
