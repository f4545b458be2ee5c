use async_trait::async_trait;
use etcd_client::{EventType, WatchOptions};
use futures::stream::BoxStream;
use futures::StreamExt;

/// A key that changed, with its new value.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEvent {
    pub key: String,
    pub value: Vec<u8>,
}

/// The narrow contract the gateway has with its configuration store: point
/// reads and a prefix watch. The gateway never writes.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<KvEvent>>>;
}

/// The production store, backed by etcd.
pub struct EtcdStore {
    client: etcd_client::Client,
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> anyhow::Result<Self> {
        let client = etcd_client::Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut kv = self.client.kv_client();
        let response = kv.get(key, None).await?;
        Ok(response.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<KvEvent>>> {
        let mut watch = self.client.watch_client();
        let (watcher, stream) = watch
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await?;

        // The watcher handle cancels the watch when dropped, so it rides
        // along inside the stream closure.
        let stream = stream
            .flat_map(move |response| {
                let _keep_alive = &watcher;
                let events: Vec<anyhow::Result<KvEvent>> = match response {
                    Ok(response) => response
                        .events()
                        .iter()
                        .filter(|event| event.event_type() == EventType::Put)
                        .filter_map(|event| event.kv())
                        .map(|kv| {
                            Ok(KvEvent {
                                key: String::from_utf8_lossy(kv.key()).into_owned(),
                                value: kv.value().to_vec(),
                            })
                        })
                        .collect(),
                    Err(err) => vec![Err(err.into())],
                };
                futures::stream::iter(events)
            })
            .boxed();

        Ok(stream)
    }
}
