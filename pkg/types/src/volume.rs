use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier handed out by the storage provisioner.
pub type ClaimId = String;

/// Storage claim bound to one ordinal of a replica set from provisioning
/// until it is deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistentVolumeClaim {
    pub id: ClaimId,
    /// Stable name, see [`crate::statefulset::StatefulSet::claim_name`]
    pub name: String,
    pub namespace: String,
    /// Key of the owning replica set
    pub owner: String,
    pub ordinal: u32,
    pub created_at: DateTime<Utc>,
}
