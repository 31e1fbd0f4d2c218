use async_trait::async_trait;
use pkg_constants::state::{ENDPOINTS_PREFIX, ORDINALS_PREFIX};
use pkg_state::client::StateStore;
use pkg_types::endpoint::Endpoints;
use pkg_types::statefulset::OrdinalStatus;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Destination for published endpoint sets and ordinal status.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish_endpoints(&self, endpoints: &Endpoints) -> anyhow::Result<()>;
    async fn remove_endpoints(&self, namespace: &str, service: &str) -> anyhow::Result<()>;
    async fn publish_ordinals(&self, status: &OrdinalStatus) -> anyhow::Result<()>;
}

/// Persists published state as JSON in the SlateDB store.
#[derive(Clone)]
pub struct StorePublisher {
    store: StateStore,
}

impl StorePublisher {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Every endpoint record in the store, including those left by an
    /// earlier run.
    pub async fn list_endpoints(&self) -> anyhow::Result<Vec<Endpoints>> {
        self.store.list_json(ENDPOINTS_PREFIX).await
    }
}

#[async_trait]
impl StatusSink for StorePublisher {
    async fn publish_endpoints(&self, endpoints: &Endpoints) -> anyhow::Result<()> {
        let key = format!("{}{}", ENDPOINTS_PREFIX, endpoints.key());
        self.store.put_json(&key, endpoints).await
    }

    async fn remove_endpoints(&self, namespace: &str, service: &str) -> anyhow::Result<()> {
        let key = format!("{}{}/{}", ENDPOINTS_PREFIX, namespace, service);
        self.store.delete(&key).await
    }

    async fn publish_ordinals(&self, status: &OrdinalStatus) -> anyhow::Result<()> {
        let key = format!("{}{}", ORDINALS_PREFIX, status.key());
        self.store.put_json(&key, status).await
    }
}

/// Keeps the latest published state in memory.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    inner: Arc<RwLock<MemoryPublisherInner>>,
}

#[derive(Default)]
struct MemoryPublisherInner {
    endpoints: BTreeMap<String, Endpoints>,
    ordinals: BTreeMap<String, OrdinalStatus>,
    endpoint_publications: usize,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn endpoints(&self, key: &str) -> Option<Endpoints> {
        self.inner.read().await.endpoints.get(key).cloned()
    }

    pub async fn ordinals(&self, key: &str) -> Option<OrdinalStatus> {
        self.inner.read().await.ordinals.get(key).cloned()
    }

    /// Number of endpoint publications so far.
    pub async fn endpoint_publications(&self) -> usize {
        self.inner.read().await.endpoint_publications
    }
}

#[async_trait]
impl StatusSink for MemoryPublisher {
    async fn publish_endpoints(&self, endpoints: &Endpoints) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        inner.endpoint_publications += 1;
        inner.endpoints.insert(endpoints.key(), endpoints.clone());
        Ok(())
    }

    async fn remove_endpoints(&self, namespace: &str, service: &str) -> anyhow::Result<()> {
        let key = format!("{}/{}", namespace, service);
        self.inner.write().await.endpoints.remove(&key);
        Ok(())
    }

    async fn publish_ordinals(&self, status: &OrdinalStatus) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .ordinals
            .insert(status.key(), status.clone());
        Ok(())
    }
}
