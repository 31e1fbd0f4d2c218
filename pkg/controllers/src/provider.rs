use async_trait::async_trait;
use pkg_types::statefulset::StatefulSet;
use pkg_types::volume::ClaimId;

/// What the health probe reports about one ordinal's pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodObservation {
    pub exists: bool,
    pub ready: bool,
}

impl PodObservation {
    pub const GONE: PodObservation = PodObservation {
        exists: false,
        ready: false,
    };
    pub const READY: PodObservation = PodObservation {
        exists: true,
        ready: true,
    };
    pub const NOT_READY: PodObservation = PodObservation {
        exists: true,
        ready: false,
    };
}

/// External storage provisioner consumed by the ordinal assigner.
#[async_trait]
pub trait StorageProvisioner: Send + Sync {
    async fn create_claim(&self, set: &StatefulSet, ordinal: u32) -> anyhow::Result<ClaimId>;
    async fn delete_claim(&self, claim: &ClaimId) -> anyhow::Result<()>;
}

/// External pod lifecycle: creation, deletion and the readiness probe.
///
/// `create_pod` and `delete_pod` must be idempotent; the assigner calls them
/// again after failures and when relaunching a vanished pod.
#[async_trait]
pub trait PodLifecycle: Send + Sync {
    async fn create_pod(
        &self,
        set: &StatefulSet,
        ordinal: u32,
        claim: &ClaimId,
    ) -> anyhow::Result<()>;
    async fn delete_pod(&self, set: &StatefulSet, ordinal: u32) -> anyhow::Result<()>;
    async fn probe(&self, set: &StatefulSet, ordinal: u32) -> anyhow::Result<PodObservation>;
}
