use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::fields::Field;
use crate::id::{DatabaseId, TableId};

/// Replica configuration for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableReplicaConfig {
    /// The name of the underlying database table.
    pub table_name: String,
    /// The ID column for this database table.
    #[serde(default)]
    pub id_column: Option<String>,
    /// The created-at column for this database table.
    #[serde(default)]
    pub created_at_column: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Configuration for a Landtable table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default = "crate::default_version")]
    pub version: u32,
    /// An immutable ID for this table (`ltb:…`).
    pub id: TableId,
    /// What Landtable will call this table.
    pub name: String,
    /// Whether this table is read only. Writes to this table will be rejected.
    #[serde(default)]
    pub read_only: bool,
    /// The fields of this table. More columns are allowed to exist in the
    /// underlying database, but Landtable will never touch them.
    pub exposed_fields: Vec<Field>,
    #[serde(default)]
    pub replica_config: HashMap<String, TableReplicaConfig>,
}

impl Table {
    /// Fetch the replica configuration for this table, defaulting the table
    /// name to the logical name when the replica has no entry.
    pub fn fetch_replica_config(&self, replica: &DatabaseId) -> TableReplicaConfig {
        if let Some(config) = self.replica_config.get(&replica.to_string()) {
            return config.clone();
        }

        TableReplicaConfig {
            table_name: self.name.clone(),
            id_column: None,
            created_at_column: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The exposed fields selected by `fields`, matched by name or by
    /// identifier string. `None` selects every exposed field.
    pub fn resolve_columns(&self, fields: Option<&HashSet<String>>) -> Vec<&Field> {
        match fields {
            None => self.exposed_fields.iter().collect(),
            Some(set) => self
                .exposed_fields
                .iter()
                .filter(|field| set.contains(&field.name) || set.contains(&field.id.to_string()))
                .collect(),
        }
    }

    /// Look up a single exposed field by name or identifier string.
    pub fn resolve_field(&self, key: &str) -> Option<&Field> {
        self.exposed_fields
            .iter()
            .find(|field| field.name == key || field.id.to_string() == key)
    }
}
