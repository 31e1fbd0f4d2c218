use async_trait::async_trait;
use chrono::Utc;
use pkg_constants::controller::{LOCAL_POD_SUBNET, POD_NAME_LABEL};
use pkg_state::watch::PodEventLog;
use pkg_types::pod::{Pod, PodPhase, pod_key};
use pkg_types::statefulset::StatefulSet;
use pkg_types::volume::{ClaimId, PersistentVolumeClaim};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::provider::{PodLifecycle, PodObservation, StorageProvisioner};

/// In-process pod lifecycle and storage provisioner.
///
/// Pods are created Running and ready, with an address from a local pool,
/// and written into the [`PodEventLog`] the endpoint controller watches.
/// Claims live in memory.
#[derive(Clone)]
pub struct LocalCluster {
    events: PodEventLog,
    inner: Arc<Mutex<LocalClusterInner>>,
}

#[derive(Default)]
struct LocalClusterInner {
    claims: BTreeMap<ClaimId, PersistentVolumeClaim>,
    /// Pod key -> address; kept across relaunches
    addresses: HashMap<String, String>,
    next_host: u32,
}

impl LocalCluster {
    pub fn new(events: PodEventLog) -> Self {
        Self {
            events,
            inner: Arc::new(Mutex::new(LocalClusterInner {
                next_host: 2,
                ..Default::default()
            })),
        }
    }

    pub async fn claims(&self) -> Vec<PersistentVolumeClaim> {
        self.inner.lock().await.claims.values().cloned().collect()
    }

    /// Flip the readiness of a pod, as a failing or recovering health check
    /// would. Returns false for unknown pods.
    pub async fn set_ready(&self, pod_id: &str, ready: bool) -> bool {
        let Some(mut pod) = self.events.get(pod_id).await else {
            return false;
        };
        if pod.ready != ready {
            pod.ready = ready;
            self.events.apply(pod).await;
        }
        true
    }

    fn allocate(inner: &mut LocalClusterInner, pod_id: &str) -> String {
        if let Some(ip) = inner.addresses.get(pod_id) {
            return ip.clone();
        }
        let host = inner.next_host;
        inner.next_host += 1;
        let ip = format!("{}.{}", LOCAL_POD_SUBNET, host);
        inner.addresses.insert(pod_id.to_string(), ip.clone());
        ip
    }
}

#[async_trait]
impl StorageProvisioner for LocalCluster {
    async fn create_claim(&self, set: &StatefulSet, ordinal: u32) -> anyhow::Result<ClaimId> {
        let mut inner = self.inner.lock().await;
        let owner = set.key();
        if let Some(existing) = inner
            .claims
            .values()
            .find(|c| c.owner == owner && c.ordinal == ordinal)
        {
            return Ok(existing.id.clone());
        }

        let claim = PersistentVolumeClaim {
            id: Uuid::new_v4().to_string(),
            name: set.claim_name(ordinal),
            namespace: set.namespace.clone(),
            owner,
            ordinal,
            created_at: Utc::now(),
        };
        info!("Claim {}/{} bound ({})", claim.namespace, claim.name, claim.id);
        let id = claim.id.clone();
        inner.claims.insert(id.clone(), claim);
        Ok(id)
    }

    async fn delete_claim(&self, claim: &ClaimId) -> anyhow::Result<()> {
        if let Some(removed) = self.inner.lock().await.claims.remove(claim) {
            info!("Claim {}/{} deleted", removed.namespace, removed.name);
        }
        Ok(())
    }
}

#[async_trait]
impl PodLifecycle for LocalCluster {
    async fn create_pod(
        &self,
        set: &StatefulSet,
        ordinal: u32,
        claim: &ClaimId,
    ) -> anyhow::Result<()> {
        if !self.inner.lock().await.claims.contains_key(claim) {
            anyhow::bail!("claim {} does not exist", claim);
        }

        let name = set.pod_name(ordinal);
        let id = pod_key(&set.namespace, &name);
        if self
            .events
            .get(&id)
            .await
            .is_some_and(|p| p.phase == PodPhase::Running)
        {
            return Ok(());
        }

        let mut pod = Pod::new(&set.namespace, &name);
        pod.labels = set.spec.labels.clone();
        pod.labels.insert(POD_NAME_LABEL.to_string(), name.clone());
        pod.phase = PodPhase::Running;
        pod.ready = true;
        pod.ip = Some(Self::allocate(&mut *self.inner.lock().await, &id));
        pod.ports = set.spec.ports.clone();
        pod.owner_ref = Some(set.key());
        pod.ordinal = Some(ordinal);
        self.events.apply(pod).await;
        Ok(())
    }

    async fn delete_pod(&self, set: &StatefulSet, ordinal: u32) -> anyhow::Result<()> {
        let id = pod_key(&set.namespace, &set.pod_name(ordinal));
        self.events.delete(&id).await;
        Ok(())
    }

    async fn probe(&self, set: &StatefulSet, ordinal: u32) -> anyhow::Result<PodObservation> {
        let id = pod_key(&set.namespace, &set.pod_name(ordinal));
        Ok(match self.events.get(&id).await {
            Some(pod) if pod.phase == PodPhase::Running => PodObservation {
                exists: true,
                ready: pod.ready,
            },
            Some(_) => PodObservation::NOT_READY,
            None => PodObservation::GONE,
        })
    }
}
