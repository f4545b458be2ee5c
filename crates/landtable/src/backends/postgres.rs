//! The Postgres backend: one lazily-created connection pool per connection
//! URL, and transaction execution with the caller's requested isolation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use formula::{FunctionRegistry, Lowerer, Type, TypeEnvironment, Value};
use models::{Database, DatabaseId, FieldType, PostgresV0Database, RowId, Table};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row as _, Transaction};
use tracing::Instrument;

use crate::backends::{BackendInformation, Consistency, DatabaseBackend, TransactionGuarantee};
use crate::error::ApiError;
use crate::transaction::{
    FailureStrategy, LandtableTransaction, Operation, OperationResult, Row, RowQuery, RowResult,
    Target,
};

pub struct PostgresBackend {
    pools: Mutex<HashMap<String, PgPool>>,
    functions: FunctionRegistry,
}

impl PostgresBackend {
    pub fn new() -> Self {
        PostgresBackend {
            pools: Mutex::new(HashMap::new()),
            functions: FunctionRegistry::builtins(),
        }
    }

    async fn pool(&self, url: &str) -> Result<PgPool, ApiError> {
        if let Some(pool) = self.pools.lock().unwrap().get(url) {
            return Ok(pool.clone());
        }

        let pool = PgPoolOptions::new()
            .connect(url)
            .await
            .map_err(|err| ApiError::internal(format!("failed to connect to database: {err}")))?;

        // Two racing constructions are tolerated here; the first insert wins
        // and the loser's pool is dropped.
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.entry(url.to_string()).or_insert(pool).clone();
        Ok(pool)
    }

    async fn exec_operation(
        &self,
        operation: &Operation,
        transaction: &LandtableTransaction,
        table: &Table,
        config: &PostgresV0Database,
        txn: &mut Transaction<'_, Postgres>,
    ) -> Result<OperationResult, ApiError> {
        match operation {
            Operation::Fetch(query) => {
                self.exec_row_query(QueryKind::Fetch, query, transaction, table, config, txn)
                    .await
            }
            Operation::Delete(query) => {
                self.exec_row_query(QueryKind::Delete, query, transaction, table, config, txn)
                    .await
            }
            Operation::Create(_) => Err(ApiError::internal(
                "create operations are not implemented by the postgres backend",
            )),
            Operation::Update(_) => Err(ApiError::internal(
                "update operations are not implemented by the postgres backend",
            )),
            Operation::UpdateByFormula(_) => Err(ApiError::internal(
                "updateByFormula operations are not implemented by the postgres backend",
            )),
        }
    }

    async fn exec_row_query(
        &self,
        kind: QueryKind,
        query: &RowQuery,
        transaction: &LandtableTransaction,
        table: &Table,
        config: &PostgresV0Database,
        txn: &mut Transaction<'_, Postgres>,
    ) -> Result<OperationResult, ApiError> {
        let span = tracing::debug_span!("formula.parse", table = %table.name);
        let plan = span.in_scope(|| {
            plan_row_query(
                kind,
                query,
                transaction.use_id,
                table,
                &config.id,
                &self.functions,
            )
        })?;

        let span = tracing::debug_span!("db.execute", sql = %plan.sql);
        let mut prepared = sqlx::query(&plan.sql);
        for value in &plan.values {
            prepared = match value {
                Value::Number(number) => prepared.bind(*number),
                Value::Text(text) => prepared.bind(text.clone()),
                Value::Uuid(uuid) => prepared.bind(*uuid),
            };
        }
        let rows = prepared
            .fetch_all(&mut *txn)
            .instrument(span)
            .await
            .map_err(|err| {
                ApiError::internal(format!("query execution failed: {err}")).with_detail(
                    serde_json::json!({
                        "sql": &plan.sql,
                        "values": &plan.values,
                    }),
                )
            })?;

        if let Some(FailureStrategy {
            exec_target: Some(exec_target),
            fail_type: Some(fail_type),
            ..
        }) = &query.failure_strategy
        {
            let affected = rows.len() as i64;
            if !fail_type.matches(affected, *exec_target) {
                return Err(ApiError::not_found(format!(
                    "operation affected {affected} rows where {fail_type} {exec_target} was required"
                )));
            }
        }

        let mut result_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            result_rows.push(map_row(row, &plan)?);
        }
        Ok(OperationResult::Rows(RowResult { rows: result_rows }))
    }
}

impl Default for PostgresBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    fn information(&self) -> BackendInformation {
        BackendInformation {
            transaction_type: TransactionGuarantee::Strong,
            config_types: &["postgres_v0"],
        }
    }

    async fn setup(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn exec_transaction(
        &self,
        transaction: &LandtableTransaction,
        table: &Table,
        config: &Database,
        consistency: Consistency,
    ) -> Result<Vec<OperationResult>, ApiError> {
        let Database::PostgresV0(config) = config else {
            return Err(ApiError::internal(format!(
                "postgres backend cannot serve config type {}",
                config.config_type()
            )));
        };

        let span = tracing::debug_span!("db.connect", database = %config.name);
        let pool = self.pool(&config.connection_url).instrument(span).await?;

        let mut txn = pool.begin().await.map_err(|err| {
            ApiError::internal(format!("failed to open a transaction: {err}"))
        })?;
        sqlx::query(&transaction_mode_sql(consistency, transaction.read_only()))
            .execute(&mut txn)
            .await
            .map_err(|err| {
                ApiError::internal(format!("failed to set the transaction mode: {err}"))
            })?;

        // Operations run strictly in order on this one connection. Bailing
        // out partway (including on cancellation) drops the guard, which
        // rolls the physical transaction back.
        let mut results = Vec::with_capacity(transaction.ops.len());
        for operation in &transaction.ops {
            results.push(
                self.exec_operation(operation, transaction, table, config, &mut txn)
                    .await?,
            );
        }

        txn.commit()
            .await
            .map_err(|err| ApiError::internal(format!("failed to commit: {err}")))?;
        Ok(results)
    }
}

fn transaction_mode_sql(consistency: Consistency, read_only: bool) -> String {
    let isolation = match consistency {
        Consistency::Strict => "SERIALIZABLE",
        Consistency::Relaxed => "REPEATABLE READ",
        Consistency::None => "READ COMMITTED",
    };
    let access = if read_only { "READ ONLY" } else { "READ WRITE" };
    format!("SET TRANSACTION ISOLATION LEVEL {isolation}, {access}, DEFERRABLE")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryKind {
    Fetch,
    Delete,
}

#[derive(Debug)]
pub(crate) struct ColumnPlan {
    /// The result key: the field identifier when the transaction uses ids,
    /// else the field name.
    pub key: String,
    pub column: String,
    pub field_type: FieldType,
}

#[derive(Debug)]
pub(crate) struct PreparedQuery {
    pub sql: String,
    pub values: Vec<Value>,
    pub columns: Vec<ColumnPlan>,
    pub id_column: String,
    pub created_at_column: String,
}

/// Translate a fetch/delete into SQL against the table's replica layout:
/// build the type environment over physical column names, lower the target
/// (and sort, if any), and project the requested logical fields plus the id
/// and created-at columns.
pub(crate) fn plan_row_query(
    kind: QueryKind,
    query: &RowQuery,
    use_id: bool,
    table: &Table,
    replica: &DatabaseId,
    functions: &FunctionRegistry,
) -> Result<PreparedQuery, ApiError> {
    let table_config = table.fetch_replica_config(replica);
    let (Some(id_column), Some(created_at_column)) = (
        table_config.id_column.clone(),
        table_config.created_at_column.clone(),
    ) else {
        return Err(ApiError::internal(format!(
            "table {} is missing an id_column or created_at_column for replica {replica}",
            table.name
        )));
    };

    // Only fields with a formula type become variables; the rest can still
    // be projected but cannot be referenced by formulae.
    let mut variables = HashMap::new();
    for field in &table.exposed_fields {
        if let Ok(ast_type) = field.ast_type() {
            variables.insert(
                field.fetch_replica_config(replica).column_name,
                Type::Concrete(ast_type),
            );
        }
    }
    let env = TypeEnvironment {
        variables,
        functions,
        id_field: id_column.clone(),
        created_time_field: created_at_column.clone(),
    };
    let mut lowerer = Lowerer::new(&env);

    let predicate = match &query.target {
        Target::Row { id } => {
            let placeholder = lowerer.bind(Value::Uuid(id.uuid()));
            format!("{id_column} = {placeholder}")
        }
        Target::Formula { formula } => {
            let mut ast = formula.ast().clone();
            lowerer.predicate(&mut ast)?
        }
    };

    let sort = query.sort.as_ref().or_else(|| {
        query
            .failure_strategy
            .as_ref()
            .and_then(|strategy| strategy.order_by.as_ref())
    });
    let order_clause = match sort {
        Some(formula) => {
            let mut ast = formula.ast().clone();
            format!(" ORDER BY {}", lowerer.expression(&mut ast)?)
        }
        None => String::new(),
    };

    let columns: Vec<ColumnPlan> = table
        .resolve_columns(query.fields.as_ref())
        .into_iter()
        .map(|field| ColumnPlan {
            key: if use_id {
                field.id.to_string()
            } else {
                field.name.clone()
            },
            column: field.fetch_replica_config(replica).column_name,
            field_type: field.r#type,
        })
        .collect();

    let mut db_columns: Vec<&str> = columns.iter().map(|column| column.column.as_str()).collect();
    for required in [id_column.as_str(), created_at_column.as_str()] {
        if !db_columns.contains(&required) {
            db_columns.push(required);
        }
    }
    let select_list = db_columns.join(",");
    let table_name = &table_config.table_name;
    let limit = query.limit;

    let sql = match kind {
        QueryKind::Fetch => {
            format!("SELECT {select_list} FROM {table_name} WHERE {predicate}{order_clause} LIMIT {limit}")
        }
        // The inner SELECT applies the limit before the delete.
        QueryKind::Delete => format!(
            "DELETE FROM {table_name} WHERE ctid = ANY(ARRAY(SELECT ctid FROM {table_name} WHERE {predicate}{order_clause} LIMIT {limit})) RETURNING {select_list}"
        ),
    };

    Ok(PreparedQuery {
        sql,
        values: lowerer.into_values(),
        columns,
        id_column,
        created_at_column,
    })
}

fn map_row(row: &PgRow, plan: &PreparedQuery) -> Result<Row, ApiError> {
    let id: uuid::Uuid = row.try_get(plan.id_column.as_str()).map_err(|err| {
        ApiError::internal(format!(
            "failed to decode id column {}: {err}",
            plan.id_column
        ))
    })?;
    let created_at = decode_datetime(row, &plan.created_at_column)?.ok_or_else(|| {
        ApiError::internal(format!(
            "created-at column {} was null",
            plan.created_at_column
        ))
    })?;

    let mut contents = serde_json::Map::new();
    for column in &plan.columns {
        contents.insert(
            column.key.clone(),
            decode_cell(row, &column.column, column.field_type)?,
        );
    }

    Ok(Row {
        id: RowId::new(id),
        created_at,
        contents,
    })
}

fn decode_datetime(row: &PgRow, column: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(column) {
        return Ok(value);
    }
    row.try_get::<Option<NaiveDateTime>, _>(column)
        .map(|value| value.map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc)))
        .map_err(|err| ApiError::internal(format!("failed to decode column {column}: {err}")))
}

/// Decode one cell according to the logical field type.
fn decode_cell(
    row: &PgRow,
    column: &str,
    field_type: FieldType,
) -> Result<serde_json::Value, ApiError> {
    use serde_json::Value as Json;

    let decode_err =
        |err: sqlx::Error| ApiError::internal(format!("failed to decode column {column}: {err}"));

    let value = match field_type {
        FieldType::Number
        | FieldType::Currency
        | FieldType::Percentage
        | FieldType::Rating
        | FieldType::Duration
        | FieldType::Count
        | FieldType::Autonumber => {
            if let Ok(value) = row.try_get::<Option<f64>, _>(column) {
                value
                    .and_then(serde_json::Number::from_f64)
                    .map(Json::Number)
                    .unwrap_or(Json::Null)
            } else if let Ok(value) = row.try_get::<Option<i64>, _>(column) {
                value.map(|n| Json::Number(n.into())).unwrap_or(Json::Null)
            } else {
                let value = row.try_get::<Option<i32>, _>(column).map_err(decode_err)?;
                value.map(|n| Json::Number(n.into())).unwrap_or(Json::Null)
            }
        }
        FieldType::String
        | FieldType::ShortText
        | FieldType::LongText
        | FieldType::Email
        | FieldType::Url
        | FieldType::PhoneNumber
        | FieldType::Barcode
        | FieldType::Select => row
            .try_get::<Option<String>, _>(column)
            .map_err(decode_err)?
            .map(Json::String)
            .unwrap_or(Json::Null),
        FieldType::Boolean => row
            .try_get::<Option<bool>, _>(column)
            .map_err(decode_err)?
            .map(Json::Bool)
            .unwrap_or(Json::Null),
        FieldType::Datetime | FieldType::CreatedAt | FieldType::ModifiedTime => {
            decode_datetime(row, column)?
                .map(|datetime| Json::String(datetime.to_rfc3339()))
                .unwrap_or(Json::Null)
        }
        FieldType::Attachment
        | FieldType::Linked
        | FieldType::Lookup
        | FieldType::MultiSelect
        | FieldType::User
        | FieldType::CreatedBy
        | FieldType::ModifiedBy => row
            .try_get::<Option<Json>, _>(column)
            .map_err(decode_err)?
            .unwrap_or(Json::Null),
    };

    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{Field, FieldId, TableId, TableReplicaConfig};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn replica() -> DatabaseId {
        DatabaseId::new(Uuid::from_u128(0xdb))
    }

    fn field(n: u128, name: &str, r#type: FieldType) -> Field {
        Field {
            version: 1,
            id: FieldId::new(Uuid::from_u128(n)),
            name: name.to_string(),
            r#type,
            replica_config: HashMap::new(),
        }
    }

    fn table() -> Table {
        let mut replica_config = HashMap::new();
        replica_config.insert(
            replica().to_string(),
            TableReplicaConfig {
                table_name: "t".to_string(),
                id_column: Some("id".to_string()),
                created_at_column: Some("created".to_string()),
                extra: serde_json::Map::new(),
            },
        );
        Table {
            version: 1,
            id: TableId::new(Uuid::from_u128(1)),
            name: "people".to_string(),
            read_only: false,
            exposed_fields: vec![
                field(2, "age", FieldType::Number),
                field(3, "name", FieldType::ShortText),
            ],
            replica_config,
        }
    }

    fn formula_query(code: &str, limit: i64) -> RowQuery {
        RowQuery {
            target: Target::Formula {
                formula: code.parse().unwrap(),
            },
            limit,
            sort: None,
            fields: None,
            failure_strategy: None,
        }
    }

    #[test]
    fn fetch_by_row_id() {
        let query = RowQuery {
            target: Target::Row {
                id: RowId::new(Uuid::from_u128(0xab)),
            },
            limit: 1,
            sort: None,
            fields: None,
            failure_strategy: None,
        };
        let functions = FunctionRegistry::builtins();
        let plan =
            plan_row_query(QueryKind::Fetch, &query, true, &table(), &replica(), &functions)
                .unwrap();

        assert_eq!(
            plan.sql,
            "SELECT age,name,id,created FROM t WHERE id = $1 LIMIT 1"
        );
        assert_eq!(plan.values, vec![Value::Uuid(Uuid::from_u128(0xab))]);
        // Contents key by field identifier when the transaction asks for ids.
        assert_eq!(
            plan.columns[0].key,
            FieldId::new(Uuid::from_u128(2)).to_string()
        );
    }

    #[test]
    fn fetch_by_formula() {
        let functions = FunctionRegistry::builtins();
        let plan = plan_row_query(
            QueryKind::Fetch,
            &formula_query("age >= 18", 50),
            false,
            &table(),
            &replica(),
            &functions,
        )
        .unwrap();

        assert_eq!(
            plan.sql,
            "SELECT age,name,id,created FROM t WHERE (age <= $1) LIMIT 50"
        );
        assert_eq!(plan.values, vec![Value::Number(18.0)]);
        assert_eq!(plan.columns[0].key, "age");
    }

    #[test]
    fn delete_limits_inside_the_ctid_subquery() {
        let functions = FunctionRegistry::builtins();
        let plan = plan_row_query(
            QueryKind::Delete,
            &formula_query("age >= 18", 10),
            true,
            &table(),
            &replica(),
            &functions,
        )
        .unwrap();

        assert_eq!(
            plan.sql,
            "DELETE FROM t WHERE ctid = ANY(ARRAY(SELECT ctid FROM t WHERE (age <= $1) LIMIT 10)) RETURNING age,name,id,created"
        );
        assert_eq!(plan.values, vec![Value::Number(18.0)]);
    }

    #[test]
    fn sort_formulae_order_the_selection() {
        let mut query = formula_query("age >= 18", 50);
        query.sort = Some("age".parse().unwrap());
        let functions = FunctionRegistry::builtins();
        let plan =
            plan_row_query(QueryKind::Fetch, &query, true, &table(), &replica(), &functions)
                .unwrap();

        assert_eq!(
            plan.sql,
            "SELECT age,name,id,created FROM t WHERE (age <= $1) ORDER BY age LIMIT 50"
        );
    }

    #[test]
    fn projections_always_include_id_and_created_at() {
        let mut query = formula_query("age >= 18", 50);
        query.fields = Some(["age".to_string()].into_iter().collect());
        let functions = FunctionRegistry::builtins();
        let plan =
            plan_row_query(QueryKind::Fetch, &query, true, &table(), &replica(), &functions)
                .unwrap();

        assert_eq!(
            plan.sql,
            "SELECT age,id,created FROM t WHERE (age <= $1) LIMIT 50"
        );
        assert_eq!(plan.columns.len(), 1);
    }

    #[test]
    fn missing_replica_columns_are_an_internal_error() {
        let mut table = table();
        table.replica_config.clear();
        let functions = FunctionRegistry::builtins();
        let err = plan_row_query(
            QueryKind::Fetch,
            &formula_query("age >= 18", 1),
            true,
            &table,
            &replica(),
            &functions,
        )
        .unwrap_err();

        assert_eq!(err.code, 500);
        assert!(err.message.contains("missing an id_column"));
    }

    #[test]
    fn formulae_cannot_reference_unexposed_or_untyped_fields() {
        let mut table = table();
        table
            .exposed_fields
            .push(field(4, "files", FieldType::Attachment));
        let functions = FunctionRegistry::builtins();

        // The attachment field is still projectable...
        let plan = plan_row_query(
            QueryKind::Fetch,
            &formula_query("age >= 18", 1),
            false,
            &table,
            &replica(),
            &functions,
        )
        .unwrap();
        assert!(plan.columns.iter().any(|column| column.key == "files"));

        // ...but referencing it from a formula is a bad request.
        let err = plan_row_query(
            QueryKind::Fetch,
            &formula_query("files = 1", 1),
            false,
            &table,
            &replica(),
            &functions,
        )
        .unwrap_err();
        assert_eq!(err.code, 400);
        assert_eq!(err.message, "variable files does not exist");
    }

    #[test]
    fn transaction_modes() {
        assert_eq!(
            transaction_mode_sql(Consistency::Strict, true),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE"
        );
        assert_eq!(
            transaction_mode_sql(Consistency::Relaxed, false),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ WRITE, DEFERRABLE"
        );
        assert_eq!(
            transaction_mode_sql(Consistency::None, false),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED, READ WRITE, DEFERRABLE"
        );
    }
}
