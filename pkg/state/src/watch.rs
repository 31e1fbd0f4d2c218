use pkg_constants::controller::POD_EVENT_LOG_CAPACITY;
use pkg_types::pod::{Pod, PodPhase};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

/// Kind of pod lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodEventKind {
    Created,
    Updated,
    Deleted,
}

/// A single pod lifecycle event. `Deleted` events carry the last snapshot
/// with phase `Gone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEvent {
    pub seq: u64,
    pub kind: PodEventKind,
    pub pod: Pod,
}

/// In-memory pod event source with monotonic sequence numbers.
///
/// Holds the authoritative pod list (for re-listing after a disconnect), a
/// ring buffer of recent events for replay, and a broadcast channel for live
/// subscribers.
#[derive(Clone)]
pub struct PodEventLog {
    inner: Arc<RwLock<PodEventLogInner>>,
    sender: broadcast::Sender<PodEvent>,
}

struct PodEventLogInner {
    seq: u64,
    /// Ring buffer of recent events (capped)
    events: VecDeque<PodEvent>,
    max_events: usize,
    pods: BTreeMap<String, Pod>,
}

impl PodEventLog {
    /// Create a new event log with the given capacity for recent events.
    pub fn new(max_events: usize) -> Self {
        let (sender, _) = broadcast::channel(max_events.max(1));
        Self {
            inner: Arc::new(RwLock::new(PodEventLogInner {
                seq: 0,
                events: VecDeque::with_capacity(max_events),
                max_events: max_events.max(1),
                pods: BTreeMap::new(),
            })),
            sender,
        }
    }

    /// Record a created or updated pod.
    pub async fn apply(&self, pod: Pod) -> PodEvent {
        let mut inner = self.inner.write().await;
        let kind = if inner.pods.contains_key(&pod.key()) {
            PodEventKind::Updated
        } else {
            PodEventKind::Created
        };
        inner.pods.insert(pod.key(), pod.clone());
        Self::record(&mut inner, &self.sender, kind, pod)
    }

    /// Record a pod deletion. Returns `None` if the pod was unknown.
    pub async fn delete(&self, pod_id: &str) -> Option<PodEvent> {
        let mut inner = self.inner.write().await;
        let mut pod = inner.pods.remove(pod_id)?;
        pod.phase = PodPhase::Gone;
        pod.ready = false;
        Some(Self::record(&mut inner, &self.sender, PodEventKind::Deleted, pod))
    }

    fn record(
        inner: &mut PodEventLogInner,
        sender: &broadcast::Sender<PodEvent>,
        kind: PodEventKind,
        pod: Pod,
    ) -> PodEvent {
        inner.seq += 1;
        let event = PodEvent {
            seq: inner.seq,
            kind,
            pod,
        };
        if inner.events.len() >= inner.max_events {
            inner.events.pop_front();
        }
        inner.events.push_back(event.clone());
        // Broadcast to subscribers (ignore errors if no receivers)
        let _ = sender.send(event.clone());
        event
    }

    /// Get the current sequence number.
    pub async fn current_seq(&self) -> u64 {
        self.inner.read().await.seq
    }

    pub async fn get(&self, pod_id: &str) -> Option<Pod> {
        self.inner.read().await.pods.get(pod_id).cloned()
    }

    /// Full listing of live pods together with the sequence number it reflects.
    pub async fn list(&self) -> (u64, Vec<Pod>) {
        let inner = self.inner.read().await;
        (inner.seq, inner.pods.values().cloned().collect())
    }

    /// Events after `from_seq`, or `None` when some of them have already been
    /// dropped from the ring buffer and the caller must re-list.
    pub async fn events_since(&self, from_seq: u64) -> Option<Vec<PodEvent>> {
        let inner = self.inner.read().await;
        if from_seq >= inner.seq {
            return Some(Vec::new());
        }
        let oldest = inner.events.front().map(|e| e.seq)?;
        if from_seq + 1 < oldest {
            return None;
        }
        Some(
            inner
                .events
                .iter()
                .filter(|e| e.seq > from_seq)
                .cloned()
                .collect(),
        )
    }

    /// Subscribe to receive new events as they are emitted.
    pub fn subscribe(&self) -> broadcast::Receiver<PodEvent> {
        self.sender.subscribe()
    }
}

impl Default for PodEventLog {
    fn default() -> Self {
        Self::new(POD_EVENT_LOG_CAPACITY)
    }
}
