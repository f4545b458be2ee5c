//! The transaction API: `POST /execute` plus the Airtable compatibility
//! router, served over a shared [`App`].

pub mod compat;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use serde::Deserialize;

use state::LandtableState;

use crate::backends::{BackendResolver, Consistency};
use crate::error::ApiError;
use crate::transaction::{LandtableTransaction, OperationResult};

pub struct App {
    pub state: LandtableState,
    pub backends: BackendResolver,
}

impl App {
    /// Resolve the workspace, table and primary replica, validate every
    /// operation, and run the transaction on the replica's backend.
    pub async fn execute(
        &self,
        workspace_handle: &str,
        table_handle: &str,
        transaction: &LandtableTransaction,
        consistency: Consistency,
    ) -> Result<Vec<OperationResult>, ApiError> {
        let workspace = self.state.fetch_workspace(workspace_handle).await?;
        let table = self.state.fetch_table(&workspace.id, table_handle).await?;
        let database = self
            .state
            .fetch_database(&workspace.primary_replica)
            .await?;

        if table.read_only && !transaction.read_only() {
            return Err(ApiError::not_allowed(format!(
                "table {} is read only",
                table.name
            )));
        }

        for operation in &transaction.ops {
            operation.validate(&table)?;
        }

        let backend = self.backends.for_config_type(database.config_type())?;
        backend
            .exec_transaction(transaction, &table, &database, consistency)
            .await
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub transaction: LandtableTransaction,
    pub table: String,
    pub workspace: String,
    pub consistency: Consistency,
}

pub fn build_router(app: Arc<App>) -> axum::Router {
    axum::Router::new()
        .route("/execute", post(execute_transaction))
        .nest("/compat", compat::router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

async fn execute_transaction(
    State(app): State<Arc<App>>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<Vec<OperationResult>>, ApiError> {
    let results = app
        .execute(
            &request.workspace,
            &request.table,
            &request.transaction,
            request.consistency,
        )
        .await?;
    Ok(Json(results))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn router_builds() {
        let store = Arc::new(state::MemoryStore::new());
        let state = LandtableState::new(store);
        let mut backends = BackendResolver::new();
        backends.initialise().await.unwrap();

        let app = Arc::new(App { state, backends });
        let _router = build_router(app);
    }

    #[test]
    fn execute_requests_deserialize() {
        let request: ExecuteRequest = serde_json::from_str(
            r#"{
                "transaction": {
                    "ops": [{"type": "fetch", "target": {"formula": "age >= 18"}, "limit": 1}],
                    "use_id": true
                },
                "table": "people",
                "workspace": "myws",
                "consistency": "STRICT"
            }"#,
        )
        .unwrap();
        assert_eq!(request.consistency, Consistency::Strict);
        assert_eq!(request.transaction.ops.len(), 1);
    }
}
