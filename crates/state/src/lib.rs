// Landtable's metadata plane: a TTL cache over the key-value store, kept
// warm by a background watch on the `/landtable` prefix. The gateway only
// ever mutates its cache; the store itself is written by external
// configuration pushes.

pub mod kv;
pub mod mem;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use models::{Database, DatabaseId, LandtableMeta, Table, Workspace, WorkspaceId};

pub use kv::{EtcdStore, KvEvent, KvStore};
pub use mem::MemoryStore;

const CACHE_EXPIRY: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("key-value store error: {0}")]
    Kv(#[source] anyhow::Error),
    #[error("invalid metadata at {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

struct CachedEntry<T> {
    created_at: Instant,
    inner: Arc<T>,
}

impl<T> Clone for CachedEntry<T> {
    fn clone(&self) -> Self {
        CachedEntry {
            created_at: self.created_at,
            inner: self.inner.clone(),
        }
    }
}

impl<T> CachedEntry<T> {
    fn new(inner: Arc<T>) -> Self {
        CachedEntry {
            created_at: Instant::now(),
            inner,
        }
    }
}

type Cache<T> = Mutex<HashMap<String, CachedEntry<T>>>;

fn fresh<T>(cache: &Cache<T>, key: &str) -> Option<Arc<T>> {
    let cache = cache.lock().unwrap();
    let entry = cache.get(key)?;
    (entry.created_at.elapsed() < CACHE_EXPIRY).then(|| entry.inner.clone())
}

fn insert_entry<T>(cache: &Cache<T>, keys: impl IntoIterator<Item = String>, value: Arc<T>) {
    let entry = CachedEntry::new(value);
    let mut cache = cache.lock().unwrap();
    for key in keys {
        cache.insert(key, entry.clone());
    }
}

fn decode<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StateError> {
    serde_json::from_slice(bytes).map_err(|source| StateError::Decode {
        key: key.to_string(),
        source,
    })
}

struct StateInner {
    kv: Arc<dyn KvStore>,
    meta: Mutex<Option<CachedEntry<LandtableMeta>>>,
    workspaces: Cache<Workspace>,
    tables: Cache<Table>,
    databases: Cache<Database>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

/// The process-wide metadata state, shared by reference across request
/// handlers and the background watcher.
#[derive(Clone)]
pub struct LandtableState {
    inner: Arc<StateInner>,
}

impl LandtableState {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        LandtableState {
            inner: Arc::new(StateInner {
                kv,
                meta: Mutex::new(None),
                workspaces: Mutex::new(HashMap::new()),
                tables: Mutex::new(HashMap::new()),
                databases: Mutex::new(HashMap::new()),
                watch_task: Mutex::new(None),
            }),
        }
    }

    /// Load the gateway metadata and start the background watcher.
    pub async fn connect(&self) -> Result<(), StateError> {
        let key = "/landtable/meta";
        let bytes = self
            .get(key)
            .await?
            .ok_or_else(|| StateError::NotFound("gateway metadata (/landtable/meta)".to_string()))?;
        let meta: LandtableMeta = decode(key, &bytes)?;
        tracing::info!(version = meta.version, "loaded gateway metadata");
        *self.inner.meta.lock().unwrap() = Some(CachedEntry::new(Arc::new(meta)));

        let stream = self
            .inner
            .kv
            .watch_prefix("/landtable")
            .await
            .map_err(StateError::Kv)?;
        let inner = self.inner.clone();
        let task = tokio::spawn(watch_loop(inner, stream));
        *self.inner.watch_task.lock().unwrap() = Some(task);

        Ok(())
    }

    /// Stop the background watcher. The watcher is fully terminated by the
    /// time this returns, so the store client may be closed afterwards.
    pub async fn shutdown(&self) {
        let task = self.inner.watch_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn meta(&self) -> Option<Arc<LandtableMeta>> {
        self.inner
            .meta
            .lock()
            .unwrap()
            .as_ref()
            .map(|entry| entry.inner.clone())
    }

    /// Fetch a workspace by id or name.
    pub async fn fetch_workspace(&self, handle: &str) -> Result<Arc<Workspace>, StateError> {
        if let Some(workspace) = fresh(&self.inner.workspaces, handle) {
            tracing::trace!(handle, "workspace cache hit");
            return Ok(workspace);
        }

        let span = tracing::debug_span!("config.fetch", entity = "workspace", handle);
        async {
            let id = if handle.starts_with("lwk:") {
                handle.to_string()
            } else {
                let alias_key = format!("/landtable/workspaceAliases/{handle}");
                let alias = self
                    .get(&alias_key)
                    .await?
                    .ok_or_else(|| StateError::NotFound(format!("workspace {handle}")))?;
                String::from_utf8_lossy(&alias).into_owned()
            };

            let key = format!("/landtable/workspaces/{id}/meta");
            let bytes = self
                .get(&key)
                .await?
                .ok_or_else(|| StateError::NotFound(format!("workspace {handle}")))?;
            let workspace: Arc<Workspace> = Arc::new(decode(&key, &bytes)?);

            insert_entry(
                &self.inner.workspaces,
                [workspace.id.to_string(), workspace.name.clone()],
                workspace.clone(),
            );
            Ok(workspace)
        }
        .instrument(span)
        .await
    }

    /// Fetch a table by id or name, scoped to a workspace.
    pub async fn fetch_table(
        &self,
        workspace: &WorkspaceId,
        handle: &str,
    ) -> Result<Arc<Table>, StateError> {
        if let Some(table) = fresh(&self.inner.tables, handle) {
            tracing::trace!(handle, "table cache hit");
            return Ok(table);
        }

        let span = tracing::debug_span!("config.fetch", entity = "table", %workspace, handle);
        async {
            let id = if handle.starts_with("ltb:") {
                handle.to_string()
            } else {
                let alias_key = format!("/landtable/workspaces/{workspace}/tableAliases/{handle}");
                let alias = self.get(&alias_key).await?.ok_or_else(|| {
                    StateError::NotFound(format!("table {workspace}/{handle}"))
                })?;
                String::from_utf8_lossy(&alias).into_owned()
            };

            let key = format!("/landtable/workspaces/{workspace}/tables/{id}");
            let bytes = self
                .get(&key)
                .await?
                .ok_or_else(|| StateError::NotFound(format!("table {workspace}/{handle}")))?;
            let table: Arc<Table> = Arc::new(decode(&key, &bytes)?);

            insert_entry(
                &self.inner.tables,
                [table.id.to_string(), table.name.clone()],
                table.clone(),
            );
            Ok(table)
        }
        .instrument(span)
        .await
    }

    /// Fetch a database config by id. Databases have no aliases.
    pub async fn fetch_database(&self, id: &DatabaseId) -> Result<Arc<Database>, StateError> {
        let handle = id.to_string();
        if let Some(database) = fresh(&self.inner.databases, &handle) {
            tracing::trace!(%id, "database cache hit");
            return Ok(database);
        }

        let span = tracing::debug_span!("config.fetch", entity = "database", %id);
        async {
            let key = format!("/landtable/databases/{id}");
            let bytes = self
                .get(&key)
                .await?
                .ok_or_else(|| StateError::NotFound(format!("database {id}")))?;
            let database: Arc<Database> = Arc::new(decode(&key, &bytes)?);

            insert_entry(&self.inner.databases, [handle], database.clone());
            Ok(database)
        }
        .instrument(span)
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        self.inner.kv.get(key).await.map_err(StateError::Kv)
    }
}

async fn watch_loop(inner: Arc<StateInner>, mut stream: BoxStream<'static, anyhow::Result<KvEvent>>) {
    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => apply_event(&inner, event),
            Err(error) => tracing::warn!(%error, "metadata watch error"),
        }
    }
    tracing::debug!("metadata watch stream ended");
}

fn apply_event(inner: &StateInner, event: KvEvent) {
    let Some(path) = event.key.strip_prefix("/landtable/") else {
        tracing::warn!(key = %event.key, "received unknown metadata update event");
        return;
    };

    let segments: Vec<&str> = path.split('/').collect();
    match segments.as_slice() {
        ["meta"] => match decode::<LandtableMeta>(&event.key, &event.value) {
            Ok(meta) => {
                *inner.meta.lock().unwrap() = Some(CachedEntry::new(Arc::new(meta)));
            }
            Err(error) => tracing::warn!(key = %event.key, %error, "ignoring metadata update"),
        },
        ["workspaces", _, "meta"] => match decode::<Workspace>(&event.key, &event.value) {
            Ok(workspace) => {
                let workspace = Arc::new(workspace);
                insert_entry(
                    &inner.workspaces,
                    [workspace.id.to_string(), workspace.name.clone()],
                    workspace,
                );
            }
            Err(error) => tracing::warn!(key = %event.key, %error, "ignoring metadata update"),
        },
        ["workspaces", _, "tables", _] => match decode::<Table>(&event.key, &event.value) {
            Ok(table) => {
                let table = Arc::new(table);
                insert_entry(
                    &inner.tables,
                    [table.id.to_string(), table.name.clone()],
                    table,
                );
            }
            Err(error) => tracing::warn!(key = %event.key, %error, "ignoring metadata update"),
        },
        ["databases", _] => match decode::<Database>(&event.key, &event.value) {
            Ok(database) => {
                let database = Arc::new(database);
                insert_entry(&inner.databases, [database.id().to_string()], database);
            }
            Err(error) => tracing::warn!(key = %event.key, %error, "ignoring metadata update"),
        },
        // Aliases are resolved on cache miss and never cached.
        ["workspaceAliases", _] | ["workspaces", _, "tableAliases", _] => {}
        _ => tracing::warn!(key = %event.key, "received unknown metadata update event"),
    }
}
