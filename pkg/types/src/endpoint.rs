use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A port exposed by a backend pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointPort {
    pub name: String,
    pub port: u16,
    pub protocol: String,
}

/// The address of a backend pod serving a Service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointAddress {
    pub ip: String,
    pub ports: Vec<EndpointPort>,
    pub ready: bool,
}

/// Backend addresses of one Service keyed by pod identity.
///
/// Built in one piece from an iterator and never mutated afterwards; a
/// reconciliation produces a fresh set that replaces the previous one.
/// Iteration order is the canonical sort by pod identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EndpointSet {
    entries: BTreeMap<String, EndpointAddress>,
}

impl EndpointSet {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pod: &str) -> Option<&EndpointAddress> {
        self.entries.get(pod)
    }

    pub fn contains(&self, pod: &str) -> bool {
        self.entries.contains_key(pod)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EndpointAddress)> {
        self.entries.iter()
    }

    /// Pod identities in canonical order.
    pub fn identities(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Flattened `(pod, ip, port)` triples in canonical order.
    pub fn sorted_pairs(&self) -> Vec<(String, String, u16)> {
        self.entries
            .iter()
            .flat_map(|(pod, addr)| {
                addr.ports
                    .iter()
                    .map(move |p| (pod.clone(), addr.ip.clone(), p.port))
            })
            .collect()
    }

    /// Changes that turn `previous` into `self`.
    pub fn diff(&self, previous: &EndpointSet) -> EndpointDiff {
        let mut diff = EndpointDiff::default();
        for (pod, addr) in &self.entries {
            match previous.entries.get(pod) {
                None => diff.added.push(pod.clone()),
                Some(old) if old != addr => diff.changed.push(pod.clone()),
                Some(_) => {}
            }
        }
        diff.removed = previous
            .entries
            .keys()
            .filter(|pod| !self.entries.contains_key(*pod))
            .cloned()
            .collect();
        diff
    }
}

impl FromIterator<(String, EndpointAddress)> for EndpointSet {
    fn from_iter<I: IntoIterator<Item = (String, EndpointAddress)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Pod identities that entered, left, or changed between two endpoint sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl EndpointDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl fmt::Display for EndpointDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "+{} -{} ~{}",
            self.added.len(),
            self.removed.len(),
            self.changed.len()
        )
    }
}

/// Published endpoint record for a Service.
/// Equivalent to an Endpoints object in Kubernetes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoints {
    pub service_name: String,
    pub namespace: String,
    pub endpoints: EndpointSet,
    pub updated_at: DateTime<Utc>,
}

impl Endpoints {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.service_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ports: vec![EndpointPort {
                name: "http".to_string(),
                port,
                protocol: "TCP".to_string(),
            }],
            ready: true,
        }
    }

    #[test]
    fn diff_reports_added_removed_changed() {
        let previous: EndpointSet = [
            ("default/a".to_string(), addr("10.0.0.1", 80)),
            ("default/b".to_string(), addr("10.0.0.2", 80)),
        ]
        .into_iter()
        .collect();
        let current: EndpointSet = [
            ("default/b".to_string(), addr("10.0.0.2", 8080)),
            ("default/c".to_string(), addr("10.0.0.3", 80)),
        ]
        .into_iter()
        .collect();

        let diff = current.diff(&previous);
        assert_eq!(diff.added, vec!["default/c"]);
        assert_eq!(diff.removed, vec!["default/a"]);
        assert_eq!(diff.changed, vec!["default/b"]);
        assert_eq!(diff.to_string(), "+1 -1 ~1");
        assert!(current.diff(&current).is_empty());
    }

    #[test]
    fn iteration_is_sorted_by_identity() {
        let set: EndpointSet = [
            ("default/web-2".to_string(), addr("10.0.0.3", 80)),
            ("default/web-0".to_string(), addr("10.0.0.1", 80)),
            ("default/web-1".to_string(), addr("10.0.0.2", 80)),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            set.identities(),
            vec!["default/web-0", "default/web-1", "default/web-2"]
        );
        assert_eq!(
            set.sorted_pairs()[0],
            ("default/web-0".to_string(), "10.0.0.1".to_string(), 80)
        );
    }
}
