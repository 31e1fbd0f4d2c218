use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pod::Pod;
use crate::service::Service;
use crate::statefulset::StatefulSet;
use crate::validate::{validate_labels, validate_name, validate_statefulset_name};

/// Workload manifest (YAML) loaded by the daemon at startup.
///
/// Example `workloads.yaml`:
/// ```yaml
/// services:
///   - name: web
///     selector: "app=web,tier in (frontend,edge)"
///     ports:
///       - { name: http, port: 80, targetPort: http }
/// statefulsets:
///   - name: web
///     spec:
///       replicas: 3
///       labels: { app: web, tier: frontend }
///       ports:
///         - { name: http, containerPort: 8080 }
/// pods: []
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub statefulsets: Vec<StatefulSet>,
    /// Standalone pods not owned by any replica set
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl Manifest {
    /// Check names and labels of every object in the manifest.
    pub fn validate(&self) -> Result<()> {
        for svc in &self.services {
            validate_name(&svc.name).with_context(|| format!("service {}", svc.key()))?;
        }
        for set in &self.statefulsets {
            validate_statefulset_name(&set.name)
                .with_context(|| format!("statefulset {}", set.key()))?;
            validate_labels(&set.spec.labels)
                .with_context(|| format!("statefulset {}", set.key()))?;
        }
        for pod in &self.pods {
            validate_name(&pod.name).with_context(|| format!("pod {}", pod.key()))?;
            validate_labels(&pod.labels).with_context(|| format!("pod {}", pod.key()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_validates_example() {
        let manifest: Manifest = serde_yaml::from_str(
            r#"
services:
  - name: web
    selector: "app=web,tier in (frontend,edge)"
    ports:
      - { name: http, port: 80, targetPort: http }
statefulsets:
  - name: web
    spec:
      replicas: 3
      labels: { app: web, tier: frontend }
      ports:
        - { name: http, containerPort: 8080 }
pods:
  - name: static-1
    labels: { app: web, tier: edge }
    phase: Running
    ready: true
    ip: 10.0.0.9
"#,
        )
        .unwrap();
        assert_eq!(manifest.services.len(), 1);
        assert_eq!(manifest.statefulsets[0].spec.replicas, 3);
        assert!(manifest.pods[0].is_serving());
        manifest.validate().unwrap();
    }

    #[test]
    fn rejects_bad_names() {
        let manifest: Manifest =
            serde_yaml::from_str("pods:\n  - name: Bad_Name\n").unwrap();
        assert!(manifest.validate().is_err());
    }
}
