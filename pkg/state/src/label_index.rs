use pkg_types::labels::LabelSet;
use pkg_types::pod::Pod;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Current snapshot of every known pod, keyed by `namespace/name`.
///
/// Cloning yields another handle to the same index. Any number of readers may
/// scan concurrently; writes are serialized, and the last write for a pod wins.
#[derive(Clone, Default)]
pub struct LabelIndex {
    inner: Arc<RwLock<HashMap<String, Arc<Pod>>>>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Pod>>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Pod>>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace a pod. Returns the snapshot it replaced.
    pub fn upsert(&self, pod: Pod) -> Option<Arc<Pod>> {
        let key = pod.key();
        self.write().insert(key, Arc::new(pod))
    }

    /// Remove a pod. Returns its last snapshot.
    pub fn remove(&self, pod_id: &str) -> Option<Arc<Pod>> {
        self.write().remove(pod_id)
    }

    /// Current labels of a pod.
    pub fn get(&self, pod_id: &str) -> Option<LabelSet> {
        self.read().get(pod_id).map(|p| p.labels.clone())
    }

    pub fn get_pod(&self, pod_id: &str) -> Option<Arc<Pod>> {
        self.read().get(pod_id).cloned()
    }

    /// Point query: does the pod currently carry `key=value`?
    pub fn has_label(&self, pod_id: &str, key: &str, value: &str) -> bool {
        self.read()
            .get(pod_id)
            .and_then(|p| p.labels.get(key))
            .is_some_and(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Consistent snapshot of the pods in one namespace, taken under a single
    /// read lock.
    pub fn pods_in_namespace(&self, namespace: &str) -> Vec<Arc<Pod>> {
        self.read()
            .values()
            .filter(|p| p.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Rebuild the index from a full listing, dropping everything not in it.
    pub fn replace_all(&self, pods: impl IntoIterator<Item = Pod>) {
        let rebuilt: HashMap<String, Arc<Pod>> =
            pods.into_iter().map(|p| (p.key(), Arc::new(p))).collect();
        *self.write() = rebuilt;
    }
}
