//! Database backends. A backend executes a transaction against one family of
//! physical databases; the resolver maps a database config type to the
//! backend that claims it.

pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use models::{Database, Table};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::transaction::{LandtableTransaction, OperationResult};

pub use postgres::PostgresBackend;

/// The consistency a caller requests for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consistency {
    Strict,
    Relaxed,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionGuarantee {
    /// The backend supports atomic, isolated and durable transactions.
    Strong,
    /// The backend emulates atomic transactions.
    Emulated,
}

#[derive(Debug, Clone)]
pub struct BackendInformation {
    pub transaction_type: TransactionGuarantee,
    /// The database config types this backend can serve.
    pub config_types: &'static [&'static str],
}

#[async_trait]
pub trait DatabaseBackend: Send + Sync {
    fn information(&self) -> BackendInformation;

    /// Initialise this database backend.
    async fn setup(&self) -> Result<(), ApiError>;

    /// Execute a transaction and return each operation's result, in order.
    /// If an error is returned, no changes have been applied.
    async fn exec_transaction(
        &self,
        transaction: &LandtableTransaction,
        table: &Table,
        config: &Database,
        consistency: Consistency,
    ) -> Result<Vec<OperationResult>, ApiError>;
}

/// The set of known backends, initialised once at startup and then used to
/// route each transaction by its database's config type.
pub struct BackendResolver {
    backends: Vec<Arc<dyn DatabaseBackend>>,
    by_config_type: HashMap<&'static str, Arc<dyn DatabaseBackend>>,
    initialised: bool,
}

impl BackendResolver {
    pub fn new() -> Self {
        Self::with_backends(vec![Arc::new(PostgresBackend::new())])
    }

    pub fn with_backends(backends: Vec<Arc<dyn DatabaseBackend>>) -> Self {
        let mut by_config_type: HashMap<&'static str, Arc<dyn DatabaseBackend>> = HashMap::new();
        for backend in &backends {
            let information = backend.information();
            tracing::debug!(
                config_types = ?information.config_types,
                "discovered backend"
            );
            for config_type in information.config_types {
                by_config_type.insert(*config_type, backend.clone());
            }
        }

        BackendResolver {
            backends,
            by_config_type,
            initialised: false,
        }
    }

    pub async fn initialise(&mut self) -> Result<(), ApiError> {
        for backend in &self.backends {
            backend.setup().await?;
        }
        self.initialised = true;
        Ok(())
    }

    pub fn for_config_type(&self, config_type: &str) -> Result<Arc<dyn DatabaseBackend>, ApiError> {
        if !self.initialised {
            return Err(ApiError::internal("backends are not initialised"));
        }

        self.by_config_type.get(config_type).cloned().ok_or_else(|| {
            ApiError::internal(format!(
                "no backend is registered for config type {config_type}"
            ))
        })
    }
}

impl Default for BackendResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consistency_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&Consistency::Strict).unwrap(),
            "\"STRICT\""
        );
        assert_eq!(
            serde_json::from_str::<Consistency>("\"NONE\"").unwrap(),
            Consistency::None
        );
    }

    #[tokio::test]
    async fn resolver_requires_initialisation() {
        let resolver = BackendResolver::new();
        assert!(resolver.for_config_type("postgres_v0").is_err());

        let mut resolver = BackendResolver::new();
        resolver.initialise().await.unwrap();
        assert!(resolver.for_config_type("postgres_v0").is_ok());
        assert!(resolver.for_config_type("airtable_v0").is_err());
    }
}
