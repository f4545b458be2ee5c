use serde::{Deserialize, Serialize};

use crate::id::{DatabaseId, WorkspaceId};

/// Gateway-wide metadata stored at `/landtable/meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandtableMeta {
    #[serde(default = "crate::default_version")]
    pub version: u32,
}

/// A workspace. Immutable once published; mutated only by configuration
/// pushes observed through the watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    #[serde(default = "crate::default_version")]
    pub version: u32,
    /// An immutable ID for this workspace (`lwk:…`).
    pub id: WorkspaceId,
    /// What Landtable will call this workspace.
    pub name: String,
    /// The primary replica for this workspace.
    pub primary_replica: DatabaseId,
}
