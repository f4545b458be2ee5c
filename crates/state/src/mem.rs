use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::kv::{KvEvent, KvStore};

/// An in-memory [`KvStore`] for tests and local development. `put` delivers
/// events to any live prefix watchers.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    watchers: Mutex<Vec<(String, mpsc::UnboundedSender<KvEvent>)>>,
    gets: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) {
        let value = value.into();
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        self.watchers.lock().unwrap().retain(|(prefix, sender)| {
            if !key.starts_with(prefix.as_str()) {
                return true;
            }
            sender
                .send(KvEvent {
                    key: key.to_string(),
                    value: value.clone(),
                })
                .is_ok()
        });
    }

    /// How many point reads have been served; lets tests assert cache hits.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<KvEvent>>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .unwrap()
            .push((prefix.to_string(), sender));
        Ok(UnboundedReceiverStream::new(receiver).map(Ok).boxed())
    }
}
