use std::collections::HashMap;

use formula::ConcreteType;
use serde::{Deserialize, Serialize};

use crate::id::{DatabaseId, FieldId};

/// The type of a field, like "attachment". Only a handful of these map onto
/// formula types; the rest cannot be referenced from formulae.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Attachment,
    Autonumber,
    Barcode,
    String,
    Boolean,
    Count,
    CreatedAt,
    CreatedBy,
    Currency,
    Datetime,
    Duration,
    Email,
    ModifiedBy,
    ModifiedTime,
    Linked,
    LongText,
    Lookup,
    MultiSelect,
    Number,
    Percentage,
    PhoneNumber,
    Rating,
    ShortText,
    Select,
    Url,
    User,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldType::Attachment => "attachment",
            FieldType::Autonumber => "autonumber",
            FieldType::Barcode => "barcode",
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Count => "count",
            FieldType::CreatedAt => "created_at",
            FieldType::CreatedBy => "created_by",
            FieldType::Currency => "currency",
            FieldType::Datetime => "datetime",
            FieldType::Duration => "duration",
            FieldType::Email => "email",
            FieldType::ModifiedBy => "modified_by",
            FieldType::ModifiedTime => "modified_time",
            FieldType::Linked => "linked",
            FieldType::LongText => "long_text",
            FieldType::Lookup => "lookup",
            FieldType::MultiSelect => "multi_select",
            FieldType::Number => "number",
            FieldType::Percentage => "percentage",
            FieldType::PhoneNumber => "phone_number",
            FieldType::Rating => "rating",
            FieldType::ShortText => "short_text",
            FieldType::Select => "select",
            FieldType::Url => "url",
            FieldType::User => "user",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unhandled type {0}")]
pub struct UnhandledFieldType(pub FieldType);

/// Database configuration for a field. Providers may attach extra keys; they
/// are carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReplicaConfig {
    /// The name of the underlying database column.
    pub column_name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A field in a table. A field has a certain type, like "attachment", and can
/// have configurable database options. Fields are frozen; their identity is
/// value-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(default = "crate::default_version")]
    pub version: u32,
    /// An immutable ID for this field (`lfd:…`).
    pub id: FieldId,
    /// What Landtable will call this field.
    pub name: String,
    pub r#type: FieldType,
    #[serde(default)]
    pub replica_config: HashMap<String, FieldReplicaConfig>,
}

impl Field {
    /// Fetch the replica configuration for this field, defaulting the column
    /// name to the field name when the replica has no entry.
    pub fn fetch_replica_config(&self, replica: &DatabaseId) -> FieldReplicaConfig {
        if let Some(config) = self.replica_config.get(&replica.to_string()) {
            return config.clone();
        }

        FieldReplicaConfig {
            column_name: self.name.clone(),
            extra: serde_json::Map::new(),
        }
    }

    /// The formula type of this field. Fields of any other type cannot be
    /// referenced by formulae.
    pub fn ast_type(&self) -> Result<ConcreteType, UnhandledFieldType> {
        match self.r#type {
            FieldType::Number => Ok(ConcreteType::Number),
            FieldType::ShortText | FieldType::LongText | FieldType::Email => {
                Ok(ConcreteType::String)
            }
            FieldType::Boolean => Ok(ConcreteType::Boolean),
            FieldType::Datetime => Ok(ConcreteType::DateTime),
            other => Err(UnhandledFieldType(other)),
        }
    }
}
