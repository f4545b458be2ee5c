// The Landtable gateway service: database backends, the transaction API,
// and the Airtable compatibility surface.

pub mod api;
pub mod backends;
pub mod error;
pub mod transaction;

pub use api::{build_router, App};
pub use backends::{BackendResolver, Consistency, DatabaseBackend, PostgresBackend};
pub use error::{ApiError, ErrorKind};
pub use transaction::{LandtableTransaction, Operation, OperationResult};
