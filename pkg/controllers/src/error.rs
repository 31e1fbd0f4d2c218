/// Per-pod problem found while projecting a Service onto its pods. The pod
/// is left out of the endpoint set; the reconciliation itself succeeds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("service {service}: pod {pod} declares no container port named '{port}'")]
    PortNameNotFound {
        service: String,
        pod: String,
        port: String,
    },
}

impl EndpointError {
    pub fn pod(&self) -> &str {
        match self {
            EndpointError::PortNameNotFound { pod, .. } => pod,
        }
    }
}

/// Failures of the ordinal state machine and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrdinalError {
    /// Blocks the ordinal; retried with backoff until it succeeds.
    #[error("statefulset {set}: provisioning claim for ordinal {ordinal} failed: {reason}")]
    ClaimProvisionFailed {
        set: String,
        ordinal: u32,
        reason: String,
    },
    /// Blocks the ordinal; retried with backoff until it succeeds.
    #[error("statefulset {set}: creating pod for ordinal {ordinal} failed: {reason}")]
    PodCreateFailed {
        set: String,
        ordinal: u32,
        reason: String,
    },
    /// Internal invariant breach. Stops the replica-set loop.
    #[error("statefulset {set}: ordering violation: {detail}")]
    OrderingViolationDetected { set: String, detail: String },
}
