use chrono::Utc;
use pkg_types::config::RetryConfig;
use pkg_types::statefulset::{
    Condition, ConditionType, OrdinalState, OrdinalStatus, OrdinalTransition, RetentionAction,
    StatefulSet, StatefulSetSpec,
};
use pkg_types::volume::ClaimId;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::error::OrdinalError;
use crate::ordinal::{Action, OrdinalSet};
use crate::provider::{PodLifecycle, StorageProvisioner};
use crate::publish::StatusSink;

/// Timing knobs of the ordinal assigner.
#[derive(Debug, Clone)]
pub struct StatefulSetConfig {
    /// Pause between probes while waiting on an ordinal
    pub probe_interval: Duration,
    /// How long a pod must stay ready before its ordinal counts as `Ready`
    pub min_ready: Duration,
    pub retry: RetryConfig,
}

impl Default for StatefulSetConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(
                pkg_constants::controller::DEFAULT_PROBE_INTERVAL_MS,
            ),
            min_ready: Duration::from_millis(pkg_constants::controller::DEFAULT_MIN_READY_MS),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    replicas: u32,
    deleting: bool,
}

struct SetHandle {
    /// Spec the loop was started with
    spec: StatefulSetSpec,
    target: watch::Sender<Target>,
    cancel: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    status: Arc<RwLock<OrdinalStatus>>,
    /// Worker left behind by a loop that was stopped, ready to resume
    parked: Arc<Mutex<Option<SetWorker>>>,
}

impl SetHandle {
    fn finished(&self) -> bool {
        *self.done.borrow()
    }

    fn deleting(&self) -> bool {
        self.target.borrow().deleting
    }

    /// Restart a loop frozen by a stop. Returns false when there is nothing
    /// to resume because the loop ended on an ordering violation.
    async fn resume(&mut self) -> bool {
        let Some(worker) = self.parked.lock().await.take() else {
            return false;
        };
        self.cancel.send_replace(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.done = done_rx;
        tokio::spawn(worker.run(done_tx, self.parked.clone()));
        true
    }
}

/// Only the replica count of a managed set may change.
fn same_template(a: &StatefulSetSpec, b: &StatefulSetSpec) -> bool {
    a.labels == b.labels
        && a.ports == b.ports
        && a.claim_template == b.claim_template
        && a.claim_retention == b.claim_retention
}

/// Controller that assigns stable ordinals to the pods of replica sets.
///
/// Each replica set gets one loop that executes a single ordinal
/// transition at a time, so creation runs strictly upward and termination
/// strictly downward. Loops of different sets run concurrently.
#[derive(Clone)]
pub struct StatefulSetController {
    storage: Arc<dyn StorageProvisioner>,
    pods: Arc<dyn PodLifecycle>,
    sink: Arc<dyn StatusSink>,
    config: StatefulSetConfig,
    sets: Arc<RwLock<HashMap<String, SetHandle>>>,
    transitions: broadcast::Sender<OrdinalTransition>,
}

impl StatefulSetController {
    pub fn new(
        storage: Arc<dyn StorageProvisioner>,
        pods: Arc<dyn PodLifecycle>,
        sink: Arc<dyn StatusSink>,
        config: StatefulSetConfig,
    ) -> Self {
        let (transitions, _) =
            broadcast::channel(pkg_constants::controller::TRANSITION_CHANNEL_CAPACITY);
        Self {
            storage,
            pods,
            sink,
            config,
            sets: Arc::new(RwLock::new(HashMap::new())),
            transitions,
        }
    }

    /// Every ordinal transition of every replica set, in execution order.
    pub fn subscribe(&self) -> broadcast::Receiver<OrdinalTransition> {
        self.transitions.subscribe()
    }

    /// Start managing a replica set.
    ///
    /// Applying a set that is already managed updates its desired replica
    /// count and resumes its loop if it was stopped. Any other change to the
    /// spec is rejected. A set whose loop ended on an ordering violation is
    /// started over from scratch with the given spec.
    pub async fn add(&self, set: StatefulSet) -> anyhow::Result<()> {
        let key = set.key();
        let mut sets = self.sets.write().await;
        if let Some(handle) = sets.get_mut(&key) {
            if handle.deleting() {
                anyhow::bail!("statefulset {} is being deleted", key);
            }
            let failed = handle.finished() && handle.parked.lock().await.is_none();
            if !failed {
                if !same_template(&handle.spec, &set.spec) {
                    anyhow::bail!(
                        "statefulset {}: only spec.replicas may change on a managed set",
                        key
                    );
                }
                let changed = handle.target.send_if_modified(|t| {
                    let changed = t.replicas != set.spec.replicas;
                    t.replicas = set.spec.replicas;
                    changed
                });
                if changed {
                    info!("StatefulSet {}: desired replicas -> {}", key, set.spec.replicas);
                }
                if handle.finished() && handle.resume().await {
                    info!("StatefulSet {}: resumed", key);
                }
                return Ok(());
            }
            warn!("StatefulSet {}: restarting a loop that failed", key);
        }

        let machine = OrdinalSet::new(key.clone(), set.spec.replicas, self.config.min_ready);
        let handle = self.spawn(set, machine);
        sets.insert(key, handle);
        Ok(())
    }

    /// Start the loop of a set around `machine`.
    fn spawn(&self, set: StatefulSet, machine: OrdinalSet) -> SetHandle {
        info!(
            "StatefulSet {}: managing {} replicas (claims whenScaled={:?}, whenDeleted={:?})",
            set.key(),
            set.spec.replicas,
            set.spec.claim_retention.when_scaled,
            set.spec.claim_retention.when_deleted
        );
        let (target_tx, target_rx) = watch::channel(Target {
            replicas: set.spec.replicas,
            deleting: false,
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let status = Arc::new(RwLock::new(OrdinalStatus {
            set: set.name.clone(),
            namespace: set.namespace.clone(),
            desired_replicas: set.spec.replicas,
            ready_replicas: 0,
            ordinals: BTreeMap::new(),
            conditions: Vec::new(),
            updated_at: Utc::now(),
        }));
        let parked = Arc::new(Mutex::new(None));
        let spec = set.spec.clone();

        let worker = SetWorker {
            set,
            machine,
            conditions: Vec::new(),
            deleting: false,
            storage: self.storage.clone(),
            pods: self.pods.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
            target: target_rx,
            cancel: cancel_rx,
            status: status.clone(),
            transitions: self.transitions.clone(),
        };
        tokio::spawn(worker.run(done_tx, parked.clone()));

        SetHandle {
            spec,
            target: target_tx,
            cancel: cancel_tx,
            done: done_rx,
            status,
            parked,
        }
    }

    /// Change the desired replica count of a managed set.
    pub async fn set_desired_replicas(&self, set_id: &str, replicas: u32) -> anyhow::Result<()> {
        let sets = self.sets.read().await;
        let handle = sets
            .get(set_id)
            .ok_or_else(|| anyhow::anyhow!("statefulset {} not found", set_id))?;
        if handle.finished() {
            anyhow::bail!("statefulset {} is stopped", set_id);
        }
        if handle.deleting() {
            anyhow::bail!("statefulset {} is being deleted", set_id);
        }
        let changed = handle.target.send_if_modified(|t| {
            let changed = t.replicas != replicas;
            t.replicas = replicas;
            changed
        });
        if changed {
            info!("StatefulSet {}: desired replicas -> {}", set_id, replicas);
        }
        Ok(())
    }

    /// Current state of every non-`Absent` ordinal of a set.
    pub async fn get_ordinal_state(&self, set_id: &str) -> Option<BTreeMap<u32, OrdinalState>> {
        let status = self.sets.read().await.get(set_id)?.status.clone();
        let ordinals = status.read().await.ordinals.clone();
        Some(ordinals)
    }

    pub async fn status(&self, set_id: &str) -> Option<OrdinalStatus> {
        let status = self.sets.read().await.get(set_id)?.status.clone();
        let snapshot = status.read().await.clone();
        Some(snapshot)
    }

    /// Scale a set to zero in order, apply its deletion claim policy, and
    /// forget it. Returns once the set's loop has finished.
    ///
    /// A stopped set is resumed to run its teardown. `stop` is refused while
    /// a delete is in progress. A set whose loop ended on an ordering
    /// violation is forgotten with its pods and claims left in place.
    pub async fn delete(&self, set_id: &str) -> anyhow::Result<()> {
        let mut done = {
            let mut sets = self.sets.write().await;
            let handle = sets
                .get_mut(set_id)
                .ok_or_else(|| anyhow::anyhow!("statefulset {} not found", set_id))?;
            handle.target.send_modify(|t| t.deleting = true);
            if handle.finished() && !handle.resume().await {
                let left = handle.status.read().await.ordinals.clone();
                warn!(
                    "StatefulSet {}: loop had failed, forgetting it with ordinals {:?} in place",
                    set_id, left
                );
                sets.remove(set_id);
                return Ok(());
            }
            handle.done.clone()
        };
        info!("StatefulSet {}: deleting", set_id);
        let _ = done.wait_for(|finished| *finished).await;

        let mut sets = self.sets.write().await;
        if let Some(handle) = sets.get(set_id)
            && handle.parked.lock().await.is_some()
        {
            anyhow::bail!("statefulset {} was shut down while deleting", set_id);
        }
        sets.remove(set_id);
        info!("StatefulSet {}: deleted", set_id);
        Ok(())
    }

    /// Freeze a set's loop where it stands. Its last status stays readable
    /// and no further transitions happen until it is added again.
    pub async fn stop(&self, set_id: &str) -> anyhow::Result<()> {
        let mut done = {
            let sets = self.sets.read().await;
            let handle = sets
                .get(set_id)
                .ok_or_else(|| anyhow::anyhow!("statefulset {} not found", set_id))?;
            if handle.deleting() {
                anyhow::bail!("statefulset {} is being deleted", set_id);
            }
            handle.cancel.send_replace(true);
            handle.done.clone()
        };
        let _ = done.wait_for(|finished| *finished).await;
        Ok(())
    }

    /// Stop every loop, including those in the middle of a delete.
    pub async fn shutdown(&self) {
        let pending: Vec<watch::Receiver<bool>> = {
            let sets = self.sets.read().await;
            sets.values()
                .map(|handle| {
                    handle.cancel.send_replace(true);
                    handle.done.clone()
                })
                .collect()
        };
        for mut done in pending {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

/// How a replica-set loop ended without error.
enum Exit {
    Stopped,
    Deleted,
}

/// The loop of one replica set. Owns the state machine.
struct SetWorker {
    set: StatefulSet,
    machine: OrdinalSet,
    conditions: Vec<Condition>,
    deleting: bool,
    storage: Arc<dyn StorageProvisioner>,
    pods: Arc<dyn PodLifecycle>,
    sink: Arc<dyn StatusSink>,
    config: StatefulSetConfig,
    target: watch::Receiver<Target>,
    cancel: watch::Receiver<bool>,
    status: Arc<RwLock<OrdinalStatus>>,
    transitions: broadcast::Sender<OrdinalTransition>,
}

impl SetWorker {
    async fn run(mut self, done: watch::Sender<bool>, parked: Arc<Mutex<Option<SetWorker>>>) {
        self.publish().await;
        match self.reconcile_loop().await {
            Ok(Exit::Stopped) => *parked.lock().await = Some(self),
            Ok(Exit::Deleted) => {}
            Err(e) => {
                error!("{}", e);
                self.raise(ConditionType::OrderingViolationDetected, None, e.to_string());
                self.publish().await;
            }
        }
        done.send_replace(true);
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow() || self.cancel.has_changed().is_err()
    }

    async fn reconcile_loop(&mut self) -> Result<Exit, OrdinalError> {
        let key = self.set.key();
        loop {
            if self.cancelled() {
                info!("StatefulSet {}: stopped at {:?}", key, self.machine.states());
                return Ok(Exit::Stopped);
            }

            let target = *self.target.borrow_and_update();
            self.deleting = target.deleting;
            let desired = if target.deleting { 0 } else { target.replicas };
            if desired != self.machine.desired() {
                self.machine.set_desired(desired);
                self.publish().await;
            }

            self.probe_all().await;
            self.machine.verify()?;

            let action = self.machine.plan();
            debug!("StatefulSet {}: {:?}", key, action);
            match action {
                Action::Create(k) => self.create(k).await?,
                Action::Terminate(k) => {
                    let t = self.machine.begin_terminate(k)?;
                    self.record(t).await;
                    self.delete_pod(k).await;
                }
                Action::AwaitAbsent(k) => {
                    self.pause(self.config.probe_interval).await;
                    // Deletion is idempotent; repeat it while the pod lingers.
                    if self.machine.state(k) == OrdinalState::Terminating {
                        self.delete_pod(k).await;
                    }
                }
                Action::Relaunch(k) => self.relaunch(k).await,
                Action::AwaitReady(_) | Action::Blocked(_) => {
                    self.pause(self.config.probe_interval).await;
                }
                Action::Idle if self.deleting => {
                    self.release_remaining_claims().await;
                    if self.cancelled() {
                        continue;
                    }
                    return Ok(Exit::Deleted);
                }
                Action::Idle => self.pause(self.config.probe_interval).await,
            }
        }
    }

    async fn probe_all(&mut self) {
        for k in self.machine.probe_targets() {
            let observation = match self.pods.probe(&self.set, k).await {
                Ok(o) => o,
                Err(e) => {
                    warn!(
                        "StatefulSet {}: probe of ordinal {} failed: {}",
                        self.set.key(),
                        k,
                        e
                    );
                    continue;
                }
            };
            if let Some(t) = self.machine.observe(k, observation, Instant::now()) {
                let absent = t.to == OrdinalState::Absent;
                self.record(t).await;
                if absent {
                    self.on_absent(k).await;
                }
            }
        }
    }

    async fn create(&mut self, k: u32) -> Result<(), OrdinalError> {
        if self.machine.state(k) == OrdinalState::Absent {
            let t = self.machine.begin_create(k)?;
            self.record(t).await;
        }

        let claim = match self.machine.claim(k).cloned() {
            Some(claim) => claim,
            None => match self.storage.create_claim(&self.set, k).await {
                Ok(claim) => {
                    info!(
                        "StatefulSet {}: ordinal {} bound to claim {}",
                        self.set.key(),
                        k,
                        claim
                    );
                    self.machine.bind_claim(k, claim.clone());
                    if self.clear(ConditionType::ClaimProvisionFailed, k) {
                        self.publish().await;
                    }
                    claim
                }
                Err(e) => {
                    let err = OrdinalError::ClaimProvisionFailed {
                        set: self.set.key(),
                        ordinal: k,
                        reason: e.to_string(),
                    };
                    self.fail(ConditionType::ClaimProvisionFailed, k, err).await;
                    return Ok(());
                }
            },
        };

        self.launch(k, &claim).await;
        Ok(())
    }

    async fn relaunch(&mut self, k: u32) {
        let Some(claim) = self.machine.claim(k).cloned() else {
            warn!(
                "StatefulSet {}: ordinal {} has no claim to relaunch on",
                self.set.key(),
                k
            );
            self.pause(self.config.probe_interval).await;
            return;
        };
        info!(
            "StatefulSet {}: pod {} vanished, relaunching on claim {}",
            self.set.key(),
            self.set.pod_name(k),
            claim
        );
        self.launch(k, &claim).await;
    }

    async fn launch(&mut self, k: u32, claim: &ClaimId) {
        match self.pods.create_pod(&self.set, k, claim).await {
            Ok(()) => {
                self.machine.mark_launched(k);
                if self.clear(ConditionType::PodCreateFailed, k) {
                    self.publish().await;
                }
            }
            Err(e) => {
                let err = OrdinalError::PodCreateFailed {
                    set: self.set.key(),
                    ordinal: k,
                    reason: e.to_string(),
                };
                self.fail(ConditionType::PodCreateFailed, k, err).await;
            }
        }
    }

    async fn delete_pod(&mut self, k: u32) {
        if let Err(e) = self.pods.delete_pod(&self.set, k).await {
            warn!(
                "StatefulSet {}: deleting pod {} failed: {}",
                self.set.key(),
                self.set.pod_name(k),
                e
            );
        }
    }

    async fn on_absent(&mut self, k: u32) {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.ordinal != Some(k));
        if self.conditions.len() != before {
            self.publish().await;
        }

        let policy = if self.deleting {
            self.set.spec.claim_retention.when_deleted
        } else {
            self.set.spec.claim_retention.when_scaled
        };
        if policy == RetentionAction::Delete {
            self.delete_claim(k).await;
        }
    }

    async fn release_remaining_claims(&mut self) {
        if self.set.spec.claim_retention.when_deleted != RetentionAction::Delete {
            return;
        }
        let ordinals: Vec<u32> = self.machine.claims().map(|(k, _)| k).collect();
        for k in ordinals {
            self.delete_claim(k).await;
        }
    }

    /// Delete the claim bound to an `Absent` ordinal, retrying until it
    /// succeeds or the loop is stopped.
    async fn delete_claim(&mut self, k: u32) {
        let mut attempt = 0;
        while let Some(claim) = self.machine.claim(k).cloned() {
            match self.storage.delete_claim(&claim).await {
                Ok(()) => {
                    self.machine.release_claim(k);
                    info!(
                        "StatefulSet {}: deleted claim {} of ordinal {}",
                        self.set.key(),
                        claim,
                        k
                    );
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    warn!(
                        "StatefulSet {}: deleting claim {} failed (attempt {}): {}",
                        self.set.key(),
                        claim,
                        attempt,
                        e
                    );
                    self.pause(self.config.retry.delay_for(attempt)).await;
                    if self.cancelled() {
                        return;
                    }
                }
            }
        }
    }

    /// Surface a failed step as a condition and back off before the retry.
    async fn fail(&mut self, condition_type: ConditionType, k: u32, err: OrdinalError) {
        let attempts = self.raise(condition_type, Some(k), err.to_string());
        warn!("{} (attempt {})", err, attempts);
        self.publish().await;
        self.pause(self.config.retry.delay_for(attempts)).await;
    }

    fn raise(&mut self, condition_type: ConditionType, ordinal: Option<u32>, message: String) -> u32 {
        if let Some(c) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type && c.ordinal == ordinal)
        {
            c.attempts += 1;
            c.message = message;
            return c.attempts;
        }
        self.conditions.push(Condition {
            condition_type,
            ordinal,
            message,
            attempts: 1,
            since: Utc::now(),
        });
        1
    }

    fn clear(&mut self, condition_type: ConditionType, k: u32) -> bool {
        let before = self.conditions.len();
        self.conditions
            .retain(|c| !(c.condition_type == condition_type && c.ordinal == Some(k)));
        self.conditions.len() != before
    }

    /// Sleep, waking early on a new target or a stop request.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.target.changed() => {}
            _ = self.cancel.changed() => {}
        }
    }

    async fn record(&mut self, transition: OrdinalTransition) {
        info!(
            "StatefulSet {}: ordinal {} {} -> {}",
            self.set.key(),
            transition.ordinal,
            transition.from,
            transition.to
        );
        let _ = self.transitions.send(transition);
        self.publish().await;
    }

    async fn publish(&self) {
        let snapshot = OrdinalStatus {
            set: self.set.name.clone(),
            namespace: self.set.namespace.clone(),
            desired_replicas: self.machine.desired(),
            ready_replicas: self.machine.ready_count(),
            ordinals: self.machine.states(),
            conditions: self.conditions.clone(),
            updated_at: Utc::now(),
        };
        *self.status.write().await = snapshot.clone();
        if let Err(e) = self.sink.publish_ordinals(&snapshot).await {
            warn!(
                "StatefulSet {}: failed to publish status: {}",
                self.set.key(),
                e
            );
        }
    }
}
