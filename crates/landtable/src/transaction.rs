//! Transaction operations: the typed records a `LandtableTransaction` is
//! made of, validated against a table before a backend executes them.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use formula::Formula;
use models::{RowId, Table};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// What rows an operation applies to: a single row by identifier, or every
/// row matching a formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    Row { id: RowId },
    Formula { formula: Formula },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailType {
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl FailType {
    /// Whether `affected` satisfies the required relation to `target`.
    pub fn matches(self, affected: i64, target: i64) -> bool {
        match self {
            FailType::Eq => affected == target,
            FailType::Neq => affected != target,
            FailType::Gt => affected > target,
            FailType::Ge => affected >= target,
            FailType::Lt => affected < target,
            FailType::Le => affected <= target,
        }
    }
}

impl std::fmt::Display for FailType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailType::Eq => "eq",
            FailType::Neq => "neq",
            FailType::Gt => "gt",
            FailType::Ge => "ge",
            FailType::Lt => "lt",
            FailType::Le => "le",
        })
    }
}

/// A post-condition on the number of rows an operation affected. When
/// `exec_target` is set, `fail_type` names the relation the affected-row
/// count must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_target: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Formula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_type: Option<FailType>,
}

/// The shared shape of `fetch` and `delete`: a target, a row limit, and an
/// optional sort and projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowQuery {
    pub target: Target,
    pub limit: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Formula>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_strategy: Option<FailureStrategy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Create {
    pub row: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub target: Target,
    pub row: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateByFormula {
    pub target: Target,
    pub exec_formula: HashMap<String, Formula>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    Fetch(RowQuery),
    Delete(RowQuery),
    Create(Create),
    Update(Update),
    UpdateByFormula(UpdateByFormula),
}

impl Operation {
    /// Validate this operation against the table it will run on. Runs before
    /// execution, so a backend only ever sees well-formed operations.
    pub fn validate(&self, table: &Table) -> Result<(), ApiError> {
        match self {
            Operation::Fetch(query) | Operation::Delete(query) => {
                validate_failure_strategy(query.failure_strategy.as_ref())
            }
            Operation::Create(op) => validate_row_keys(op.row.keys(), table),
            Operation::Update(op) => validate_row_keys(op.row.keys(), table),
            Operation::UpdateByFormula(op) => validate_row_keys(op.exec_formula.keys(), table),
        }
    }
}

fn validate_failure_strategy(strategy: Option<&FailureStrategy>) -> Result<(), ApiError> {
    if let Some(strategy) = strategy {
        if strategy.exec_target.is_some() && strategy.fail_type.is_none() {
            return Err(ApiError::bad_request(
                "failure_strategy.exec_target requires failure_strategy.fail_type",
            ));
        }
    }
    Ok(())
}

fn validate_row_keys<'a>(
    keys: impl Iterator<Item = &'a String>,
    table: &Table,
) -> Result<(), ApiError> {
    for key in keys {
        if table.resolve_field(key).is_none() {
            return Err(ApiError::bad_request(format!(
                "field {key} does not exist in table {}",
                table.name
            )));
        }
    }
    Ok(())
}

fn default_use_id() -> bool {
    true
}

/// An ordered batch of operations executed atomically against one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandtableTransaction {
    pub ops: Vec<Operation>,
    /// When true, result rows key field values by field identifier
    /// (`lfd:…`); when false, by field name.
    #[serde(default = "default_use_id")]
    pub use_id: bool,
}

impl LandtableTransaction {
    pub fn read_only(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, Operation::Fetch(_)))
    }
}

/// A row returned by an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub created_at: DateTime<Utc>,
    pub contents: serde_json::Map<String, serde_json::Value>,
}

/// The result of a fetch or delete operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OperationResult {
    Rows(RowResult),
    Row(Row),
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{Field, FieldId, FieldType, TableId};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn table() -> Table {
        Table {
            version: 1,
            id: TableId::new(Uuid::from_u128(1)),
            name: "people".to_string(),
            read_only: false,
            exposed_fields: vec![Field {
                version: 1,
                id: FieldId::new(Uuid::from_u128(2)),
                name: "age".to_string(),
                r#type: FieldType::Number,
                replica_config: HashMap::new(),
            }],
            replica_config: HashMap::new(),
        }
    }

    #[test]
    fn operations_deserialize_from_tagged_json() {
        let op: Operation = serde_json::from_str(
            r#"{
                "type": "fetch",
                "target": {"formula": "age >= 18"},
                "limit": 50
            }"#,
        )
        .unwrap();
        let Operation::Fetch(query) = &op else {
            panic!("expected a fetch");
        };
        assert_eq!(query.limit, 50);
        assert!(matches!(query.target, Target::Formula { .. }));

        let op: Operation = serde_json::from_str(
            r#"{
                "type": "updateByFormula",
                "target": {"id": "lrw:00000000000000000000000000000001"},
                "exec_formula": {"age": "age + 1"}
            }"#,
        )
        .unwrap();
        assert!(matches!(op, Operation::UpdateByFormula(_)));
    }

    #[test]
    fn transactions_of_fetches_are_read_only() {
        let fetch: Operation = serde_json::from_str(
            r#"{"type": "fetch", "target": {"formula": "age"}, "limit": 1}"#,
        )
        .unwrap();
        let delete: Operation = serde_json::from_str(
            r#"{"type": "delete", "target": {"formula": "age"}, "limit": 1}"#,
        )
        .unwrap();

        let transaction = LandtableTransaction {
            ops: vec![fetch.clone()],
            use_id: true,
        };
        assert!(transaction.read_only());

        let transaction = LandtableTransaction {
            ops: vec![fetch, delete],
            use_id: true,
        };
        assert!(!transaction.read_only());
    }

    #[test]
    fn use_id_defaults_to_true() {
        let transaction: LandtableTransaction =
            serde_json::from_str(r#"{"ops": []}"#).unwrap();
        assert!(transaction.use_id);
    }

    #[test]
    fn exec_target_requires_fail_type() {
        let op: Operation = serde_json::from_str(
            r#"{
                "type": "fetch",
                "target": {"formula": "age"},
                "limit": 1,
                "failure_strategy": {"exec_target": 1}
            }"#,
        )
        .unwrap();
        let err = op.validate(&table()).unwrap_err();
        assert_eq!(err.code, 400);

        let op: Operation = serde_json::from_str(
            r#"{
                "type": "fetch",
                "target": {"formula": "age"},
                "limit": 1,
                "failure_strategy": {"exec_target": 1, "fail_type": "eq"}
            }"#,
        )
        .unwrap();
        assert!(op.validate(&table()).is_ok());
    }

    #[test]
    fn write_bodies_must_name_exposed_fields() {
        let op: Operation = serde_json::from_str(
            r#"{"type": "create", "row": {"nonexistent_field": 1}}"#,
        )
        .unwrap();
        let err = op.validate(&table()).unwrap_err();
        assert_eq!(err.code, 400);
        assert_eq!(
            err.message,
            "field nonexistent_field does not exist in table people"
        );

        let op: Operation =
            serde_json::from_str(r#"{"type": "create", "row": {"age": 1}}"#).unwrap();
        assert!(op.validate(&table()).is_ok());

        // Identifier strings resolve too.
        let op: Operation = serde_json::from_str(
            r#"{"type": "create", "row": {"lfd:00000000000000000000000000000002": 1}}"#,
        )
        .unwrap();
        assert!(op.validate(&table()).is_ok());
    }

    #[test]
    fn fail_type_relations() {
        assert!(FailType::Eq.matches(1, 1));
        assert!(!FailType::Eq.matches(0, 1));
        assert!(FailType::Neq.matches(0, 1));
        assert!(FailType::Ge.matches(2, 1));
        assert!(!FailType::Lt.matches(1, 1));
        assert!(FailType::Le.matches(1, 1));
        assert!(FailType::Gt.matches(2, 1));
    }

    #[test]
    fn targets_deserialize_untagged() {
        let target: Target = serde_json::from_str(
            r#"{"id": "lrw:00000000000000000000000000000001"}"#,
        )
        .unwrap();
        assert!(matches!(target, Target::Row { .. }));

        let target: Target = serde_json::from_str(r#"{"formula": "age = 1"}"#).unwrap();
        assert!(matches!(target, Target::Formula { .. }));
    }
}
