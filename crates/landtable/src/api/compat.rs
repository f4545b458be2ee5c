//! The Airtable-compatibility surface. Each handler synthesizes a
//! `LandtableTransaction` for the core to execute and shapes the results
//! back to Airtable's JSON conventions; the legacy field stripping lives
//! here, never in the core.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use models::RowId;

use crate::api::App;
use crate::backends::Consistency;
use crate::error::ApiError;
use crate::transaction::{
    Create, FailType, FailureStrategy, LandtableTransaction, Operation, OperationResult, Row,
    RowQuery, Target, Update,
};

pub fn router() -> axum::Router<Arc<App>> {
    axum::Router::new()
        .route(
            "/v0/{workspace}/{table}/{row}",
            get(fetch_row).delete(delete_row).patch(update_row),
        )
        .route("/v0/{workspace}/{table}", post(create_row))
}

fn parse_row_id(raw: &str) -> Result<RowId, ApiError> {
    if raw.starts_with("rec") {
        return Err(ApiError::bad_request(
            "Airtable record identifiers are not supported (expected something like lrw:XXXX...)",
        ));
    }

    RowId::parse(raw)
        .map_err(|err| ApiError::bad_request(format!("invalid row identifier {raw}: {err}")))
}

async fn fetch_row(
    State(app): State<Arc<App>>,
    Path((workspace, table, row)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_row_id(&row)?;
    let transaction = LandtableTransaction {
        ops: vec![Operation::Fetch(RowQuery {
            target: Target::Row { id },
            limit: 1,
            sort: None,
            fields: None,
            failure_strategy: None,
        })],
        use_id: false,
    };

    let mut results = app
        .execute(&workspace, &table, &transaction, Consistency::Strict)
        .await?;
    let Some(OperationResult::Rows(result)) = results.pop() else {
        return Err(ApiError::internal("fetch produced no result"));
    };
    let record = result
        .rows
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::not_found(format!("row {row} does not exist")))?;

    Ok(Json(shape_record(record)))
}

async fn delete_row(
    State(app): State<Arc<App>>,
    Path((workspace, table, row)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_row_id(&row)?;
    let transaction = LandtableTransaction {
        ops: vec![Operation::Delete(RowQuery {
            target: Target::Row { id },
            limit: 1,
            sort: None,
            fields: None,
            // Exactly one row must go away, or the delete rolls back.
            failure_strategy: Some(FailureStrategy {
                exec_target: Some(1),
                order_by: None,
                fail_type: Some(FailType::Eq),
            }),
        })],
        use_id: false,
    };

    app.execute(&workspace, &table, &transaction, Consistency::Strict)
        .await?;

    Ok(Json(json!({"deleted": true, "id": row})))
}

#[derive(Debug, Deserialize)]
struct RecordBody {
    fields: serde_json::Map<String, serde_json::Value>,
}

async fn update_row(
    State(app): State<Arc<App>>,
    Path((workspace, table, row)): Path<(String, String, String)>,
    Json(body): Json<RecordBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = parse_row_id(&row)?;
    let transaction = LandtableTransaction {
        ops: vec![Operation::Update(Update {
            target: Target::Row { id },
            row: body.fields,
        })],
        use_id: false,
    };

    let mut results = app
        .execute(&workspace, &table, &transaction, Consistency::Strict)
        .await?;
    match results.pop() {
        Some(OperationResult::Row(record)) => Ok(Json(shape_record(record))),
        _ => Err(ApiError::internal("update produced no result")),
    }
}

async fn create_row(
    State(app): State<Arc<App>>,
    Path((workspace, table)): Path<(String, String)>,
    Json(body): Json<RecordBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let transaction = LandtableTransaction {
        ops: vec![Operation::Create(Create { row: body.fields })],
        use_id: false,
    };

    let mut results = app
        .execute(&workspace, &table, &transaction, Consistency::Strict)
        .await?;
    match results.pop() {
        Some(OperationResult::Row(record)) => Ok(Json(shape_record(record))),
        _ => Err(ApiError::internal("create produced no result")),
    }
}

fn shape_record(record: Row) -> serde_json::Value {
    json!({
        "id": record.id,
        "createdTime": record.created_at,
        "fields": strip_empty_fields(record.contents),
    })
}

/// Airtable's legacy convention: fields whose value is `0`, `false`, `null`,
/// or `[]` are stripped from outgoing records.
fn strip_empty_fields(
    contents: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    contents
        .into_iter()
        .filter(|(_, value)| !is_stripped(value))
        .collect()
}

fn is_stripped(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Bool(kept) => !*kept,
        serde_json::Value::Number(number) => number.as_f64() == Some(0.0),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
