use chrono::Utc;
use pkg_types::statefulset::{OrdinalState, OrdinalTransition};
use pkg_types::volume::ClaimId;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::OrdinalError;
use crate::provider::PodObservation;

/// The single next step the driver should execute for a replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Provision the claim of this ordinal if needed, then launch its pod.
    Create(u32),
    /// The ordinal is `Creating` with a launched pod; keep probing.
    AwaitReady(u32),
    /// Move this ordinal to `Terminating` and delete its pod.
    Terminate(u32),
    /// The ordinal is `Terminating`; keep probing until the pod is gone.
    AwaitAbsent(u32),
    /// A `Ready` ordinal lost its pod; launch it again on the same claim.
    Relaunch(u32),
    /// A `Ready` ordinal reports not-ready. Nothing above it is created
    /// until it recovers.
    Blocked(u32),
    /// Every ordinal below the desired count is `Ready` and nothing else exists.
    Idle,
}

#[derive(Debug, Clone)]
struct Slot {
    state: OrdinalState,
    /// Pod creation succeeded for the current `Creating` phase
    launched: bool,
    /// Start of the current uninterrupted ready streak while `Creating`
    ready_since: Option<Instant>,
    /// Last probe of a `Ready` ordinal: pod present
    present: bool,
    /// Last probe of a `Ready` ordinal: pod present and ready
    healthy: bool,
}

impl Slot {
    fn creating() -> Self {
        Self {
            state: OrdinalState::Creating,
            launched: false,
            ready_since: None,
            present: false,
            healthy: false,
        }
    }
}

/// Ordered ordinal state machine of one replica set.
///
/// Holds only data: the driver asks [`OrdinalSet::plan`] for the next step,
/// performs it against the collaborators, and reports back through
/// [`OrdinalSet::begin_create`], [`OrdinalSet::mark_launched`],
/// [`OrdinalSet::begin_terminate`] and [`OrdinalSet::observe`]. Every state
/// change is returned as an [`OrdinalTransition`].
///
/// Ordinals not tracked are `Absent`. The tracked ordinals always form a
/// contiguous prefix `0..n`, and at most one of them is in transit
/// (`Creating` or `Terminating`).
#[derive(Debug, Clone)]
pub struct OrdinalSet {
    set: String,
    desired: u32,
    min_ready: Duration,
    slots: BTreeMap<u32, Slot>,
    claims: BTreeMap<u32, ClaimId>,
}

impl OrdinalSet {
    pub fn new(set: impl Into<String>, desired: u32, min_ready: Duration) -> Self {
        Self {
            set: set.into(),
            desired,
            min_ready,
            slots: BTreeMap::new(),
            claims: BTreeMap::new(),
        }
    }

    pub fn set(&self) -> &str {
        &self.set
    }

    pub fn desired(&self) -> u32 {
        self.desired
    }

    /// Change the target replica count. Takes effect at the next `plan`.
    pub fn set_desired(&mut self, replicas: u32) {
        self.desired = replicas;
    }

    pub fn state(&self, ordinal: u32) -> OrdinalState {
        self.slots
            .get(&ordinal)
            .map(|s| s.state)
            .unwrap_or(OrdinalState::Absent)
    }

    /// States of every ordinal that is not `Absent`.
    pub fn states(&self) -> BTreeMap<u32, OrdinalState> {
        self.slots.iter().map(|(k, s)| (*k, s.state)).collect()
    }

    pub fn ready_count(&self) -> u32 {
        self.slots
            .values()
            .filter(|s| s.state == OrdinalState::Ready)
            .count() as u32
    }

    /// Ordinals whose pod should be probed: launched `Creating`, `Ready`
    /// and `Terminating` ones.
    pub fn probe_targets(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|(_, s)| s.state != OrdinalState::Creating || s.launched)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn plan(&self) -> Action {
        if let Some((k, _)) = self
            .slots
            .iter()
            .find(|(_, s)| s.state == OrdinalState::Terminating)
        {
            return Action::AwaitAbsent(*k);
        }

        // Scale down from the top, one ordinal at a time.
        if let Some((&k, _)) = self.slots.iter().next_back()
            && k >= self.desired
        {
            return Action::Terminate(k);
        }

        for k in 0..self.desired {
            let Some(slot) = self.slots.get(&k) else {
                return Action::Create(k);
            };
            match slot.state {
                OrdinalState::Creating if slot.launched => return Action::AwaitReady(k),
                OrdinalState::Creating => return Action::Create(k),
                OrdinalState::Ready if !slot.present => return Action::Relaunch(k),
                OrdinalState::Ready if !slot.healthy => return Action::Blocked(k),
                OrdinalState::Ready | OrdinalState::Absent | OrdinalState::Terminating => {}
            }
        }
        Action::Idle
    }

    /// `Absent -> Creating` for `ordinal`. Every lower ordinal must be
    /// `Ready` and the ordinal must be below the desired count.
    pub fn begin_create(&mut self, ordinal: u32) -> Result<OrdinalTransition, OrdinalError> {
        if ordinal >= self.desired {
            return Err(self.violation(format!(
                "create of ordinal {} at desired {}",
                ordinal, self.desired
            )));
        }
        if self.state(ordinal) != OrdinalState::Absent {
            return Err(self.violation(format!(
                "create of ordinal {} in state {}",
                ordinal,
                self.state(ordinal)
            )));
        }
        if let Some(lower) = (0..ordinal).find(|j| self.state(*j) != OrdinalState::Ready) {
            return Err(self.violation(format!(
                "create of ordinal {} while ordinal {} is {}",
                ordinal,
                lower,
                self.state(lower)
            )));
        }
        self.slots.insert(ordinal, Slot::creating());
        Ok(self.transition(ordinal, OrdinalState::Absent, OrdinalState::Creating))
    }

    /// Record the claim provisioned for `ordinal`. Bindings survive the
    /// ordinal going `Absent` until released.
    pub fn bind_claim(&mut self, ordinal: u32, claim: ClaimId) {
        self.claims.insert(ordinal, claim);
    }

    pub fn claim(&self, ordinal: u32) -> Option<&ClaimId> {
        self.claims.get(&ordinal)
    }

    pub fn claims(&self) -> impl Iterator<Item = (u32, &ClaimId)> {
        self.claims.iter().map(|(k, c)| (*k, c))
    }

    /// Forget the claim of an `Absent` ordinal after it was deleted.
    pub fn release_claim(&mut self, ordinal: u32) -> Option<ClaimId> {
        if self.slots.contains_key(&ordinal) {
            return None;
        }
        self.claims.remove(&ordinal)
    }

    /// The pod of a `Creating` ordinal was created, or the pod of a `Ready`
    /// ordinal was relaunched.
    pub fn mark_launched(&mut self, ordinal: u32) {
        if let Some(slot) = self.slots.get_mut(&ordinal) {
            match slot.state {
                OrdinalState::Creating => slot.launched = true,
                OrdinalState::Ready => slot.present = true,
                OrdinalState::Absent | OrdinalState::Terminating => {}
            }
        }
    }

    /// `Creating | Ready -> Terminating` for `ordinal`. Every higher ordinal
    /// must be `Absent` and the ordinal must be at or above the desired count.
    pub fn begin_terminate(&mut self, ordinal: u32) -> Result<OrdinalTransition, OrdinalError> {
        if ordinal < self.desired {
            return Err(self.violation(format!(
                "terminate of ordinal {} at desired {}",
                ordinal, self.desired
            )));
        }
        if let Some((&higher, _)) = self.slots.range(ordinal + 1..).next() {
            return Err(self.violation(format!(
                "terminate of ordinal {} while ordinal {} is {}",
                ordinal,
                higher,
                self.state(higher)
            )));
        }
        let from = self.state(ordinal);
        let Some(slot) = self
            .slots
            .get_mut(&ordinal)
            .filter(|s| matches!(s.state, OrdinalState::Creating | OrdinalState::Ready))
        else {
            return Err(self.violation(format!(
                "terminate of ordinal {} in state {}",
                ordinal, from
            )));
        };
        slot.state = OrdinalState::Terminating;
        Ok(self.transition(ordinal, from, OrdinalState::Terminating))
    }

    /// Feed one probe result back into the machine.
    pub fn observe(
        &mut self,
        ordinal: u32,
        observation: PodObservation,
        now: Instant,
    ) -> Option<OrdinalTransition> {
        let min_ready = self.min_ready;
        let slot = self.slots.get_mut(&ordinal)?;
        match slot.state {
            OrdinalState::Creating if slot.launched => {
                if !observation.exists {
                    // Launch again before waiting any longer.
                    slot.launched = false;
                    slot.ready_since = None;
                    return None;
                }
                if !observation.ready {
                    slot.ready_since = None;
                    return None;
                }
                let since = *slot.ready_since.get_or_insert(now);
                if now.saturating_duration_since(since) < min_ready {
                    return None;
                }
                slot.state = OrdinalState::Ready;
                slot.present = true;
                slot.healthy = true;
                slot.ready_since = None;
                Some(self.transition(ordinal, OrdinalState::Creating, OrdinalState::Ready))
            }
            OrdinalState::Ready => {
                slot.present = observation.exists;
                slot.healthy = observation.exists && observation.ready;
                None
            }
            OrdinalState::Terminating if !observation.exists => {
                self.slots.remove(&ordinal);
                Some(self.transition(ordinal, OrdinalState::Terminating, OrdinalState::Absent))
            }
            _ => None,
        }
    }

    /// Check the structural invariants of the tracked ordinals.
    pub fn verify(&self) -> Result<(), OrdinalError> {
        let mut in_transit = Vec::new();
        for (position, (&k, slot)) in self.slots.iter().enumerate() {
            if k != position as u32 {
                return Err(self.violation(format!(
                    "ordinal {} is {} while ordinal {} is Absent",
                    k, slot.state, position
                )));
            }
            match slot.state {
                OrdinalState::Creating | OrdinalState::Terminating => in_transit.push(k),
                OrdinalState::Ready | OrdinalState::Absent => {}
            }
        }
        if in_transit.len() > 1 {
            return Err(self.violation(format!(
                "ordinals {:?} are in transit at once",
                in_transit
            )));
        }
        if let Some(&k) = in_transit.first()
            && self.state(k) == OrdinalState::Creating
            && self.slots.range(k + 1..).next().is_some()
        {
            return Err(self.violation(format!(
                "ordinal {} is Creating below a live ordinal",
                k
            )));
        }
        Ok(())
    }

    /// Drop an ordinal's slot without a transition, breaking the invariants
    /// `verify` checks.
    #[cfg(test)]
    pub(crate) fn forget(&mut self, ordinal: u32) {
        self.slots.remove(&ordinal);
    }

    fn transition(&self, ordinal: u32, from: OrdinalState, to: OrdinalState) -> OrdinalTransition {
        OrdinalTransition {
            set: self.set.clone(),
            ordinal,
            from,
            to,
            at: Utc::now(),
        }
    }

    fn violation(&self, detail: String) -> OrdinalError {
        OrdinalError::OrderingViolationDetected {
            set: self.set.clone(),
            detail,
        }
    }
}
