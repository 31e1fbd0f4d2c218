use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::labels::LabelSet;

// --- Container ports ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerPort {
    /// Name a Service `target_port` can refer to
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "containerPort")]
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

pub(crate) fn default_protocol() -> String {
    "TCP".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

// --- Pod phase ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Terminating,
    Gone,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Terminating => write!(f, "Terminating"),
            PodPhase::Gone => write!(f, "Gone"),
        }
    }
}

// --- Pod ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Labels for selector-based matching
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub phase: PodPhase,
    /// Readiness as reported by the health probe
    #[serde(default)]
    pub ready: bool,
    /// Pod IP, assigned once the pod is running
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    /// Owner reference (replica set key that created this pod)
    #[serde(default)]
    pub owner_ref: Option<String>,
    /// Stable ordinal for pods owned by an identity-aware replica set
    #[serde(default)]
    pub ordinal: Option<u32>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Pod {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: LabelSet::new(),
            phase: PodPhase::Pending,
            ready: false,
            ip: None,
            ports: Vec::new(),
            owner_ref: None,
            ordinal: None,
            created_at: Utc::now(),
        }
    }

    /// Unique identity, `namespace/name`.
    pub fn key(&self) -> String {
        pod_key(&self.namespace, &self.name)
    }

    /// Running and ready: the only pods allowed to back an endpoint.
    pub fn is_serving(&self) -> bool {
        self.phase == PodPhase::Running && self.ready
    }

    pub fn named_port(&self, name: &str) -> Option<&ContainerPort> {
        self.ports.iter().find(|p| p.name.as_deref() == Some(name))
    }
}

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serving_requires_running_and_ready() {
        let mut pod = Pod::new("default", "web-0");
        pod.ready = true;
        assert!(!pod.is_serving());
        pod.phase = PodPhase::Running;
        assert!(pod.is_serving());
        pod.ready = false;
        assert!(!pod.is_serving());
        pod.ready = true;
        pod.phase = PodPhase::Terminating;
        assert!(!pod.is_serving());
    }

    #[test]
    fn deserializes_with_defaults() {
        let pod: Pod = serde_yaml::from_str(
            "name: web-0\nlabels: {app: web}\nports:\n  - name: http\n    containerPort: 8080\n",
        )
        .unwrap();
        assert_eq!(pod.key(), "default/web-0");
        assert_eq!(pod.phase, PodPhase::Pending);
        assert_eq!(pod.named_port("http").map(|p| p.container_port), Some(8080));
        assert_eq!(pod.ports[0].protocol, "TCP");
        assert!(pod.named_port("metrics").is_none());
    }
}
