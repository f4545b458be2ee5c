use serde::{Deserialize, Serialize};

use crate::id::DatabaseId;

/// A database replica. Replicas are a closed set of configuration shapes,
/// discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Database {
    PostgresV0(PostgresV0Database),
    AirtableV0(AirtableV0Database),
}

impl Database {
    pub fn config_type(&self) -> &'static str {
        match self {
            Database::PostgresV0(_) => "postgres_v0",
            Database::AirtableV0(_) => "airtable_v0",
        }
    }

    pub fn id(&self) -> &DatabaseId {
        match self {
            Database::PostgresV0(config) => &config.id,
            Database::AirtableV0(config) => &config.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Database::PostgresV0(config) => &config.name,
            Database::AirtableV0(config) => &config.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresV0Database {
    #[serde(default = "crate::default_version")]
    pub version: u32,
    pub id: DatabaseId,
    pub name: String,
    pub connection_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirtableV0Database {
    #[serde(default = "crate::default_version")]
    pub version: u32,
    pub id: DatabaseId,
    pub name: String,
    #[serde(default = "default_airtable_api_url")]
    pub api_url: String,
    pub base_id: String,
    pub table_id: String,
}

fn default_airtable_api_url() -> String {
    "https://api.airtable.com/v0/".to_string()
}
