use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::pod::default_protocol;
use crate::selector::Selector;

/// Where a service port forwards to on the backing pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum TargetPort {
    Number(u16),
    /// Named container port, resolved per pod
    Name(String),
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Number(n) => write!(f, "{}", n),
            TargetPort::Name(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    /// Defaults to `port` when unset
    #[serde(default, alias = "targetPort")]
    pub target_port: Option<TargetPort>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

impl ServicePort {
    pub fn target(&self) -> TargetPort {
        self.target_port
            .clone()
            .unwrap_or(TargetPort::Number(self.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Single selector term; an empty selector manages no endpoints
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Service {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
