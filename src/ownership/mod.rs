//! Cluster-wide ownership election per device.
//!
//! Every node registers as a candidate for each configured device. The
//! service grants ownership to one candidate at a time: a displaced owner's
//! `lose_ownership` completes before the next candidate's `become_owner`
//! starts, and every grant carries a fresh, strictly increasing epoch.

mod context;

pub use context::DeviceContext;

use crate::device::DeviceId;
use crate::error::OwnershipError;
use crate::PinFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Owner { epoch: u64 },
    Follower,
}

impl Role {
    pub fn is_owner(&self) -> bool {
        matches!(self, Role::Owner { .. })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Owner { epoch } => write!(f, "owner#{epoch}"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

pub trait OwnershipListener: Send + Sync {
    fn become_owner(&self, epoch: u64) -> PinFuture<()>;
    fn lose_ownership(&self) -> PinFuture<()>;
}

pub trait OwnershipService: Send + Sync {
    fn register_candidate(
        &self,
        device: &DeviceId,
        candidate: &str,
        listener: Arc<dyn OwnershipListener>,
    ) -> Result<(), OwnershipError>;
    /// Removes the candidate. A withdrawn owner is told it lost ownership.
    fn withdraw_candidate(&self, device: &DeviceId, candidate: &str);
    fn owner_of(&self, device: &DeviceId) -> Option<(String, u64)>;
}

struct Grant {
    candidate: String,
    epoch: u64,
    listener: Arc<dyn OwnershipListener>,
    // The owner's process is gone; nobody is left to notify.
    crashed: bool,
}

struct Election {
    candidates: Vec<(String, Arc<dyn OwnershipListener>)>,
    owner: Option<Grant>,
    // Kept after the last candidate leaves so epochs never repeat.
    epoch: u64,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Election {
    fn new() -> Self {
        Self {
            candidates: Vec::new(),
            owner: None,
            epoch: 0,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

enum Change {
    Revoke(Grant),
    Grant(String, u64, Arc<dyn OwnershipListener>),
}

/// In-process election broker shared by every node of a simulated cluster.
#[derive(Clone, Default)]
pub struct LocalOwnershipService {
    inner: Arc<ServiceInner>,
}

#[derive(Default)]
struct ServiceInner {
    elections: Mutex<HashMap<DeviceId, Election>>,
    injected_failures: Mutex<HashMap<DeviceId, usize>>,
}

impl LocalOwnershipService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` registrations for `device` fail.
    pub fn fail_registrations(&self, device: &DeviceId, count: usize) {
        self.inner
            .injected_failures
            .lock()
            .insert(device.clone(), count);
    }

    /// Drops every candidacy of a crashed node without notifying it.
    pub fn node_failed(&self, candidate: &str) {
        let mut affected = Vec::new();
        {
            let mut elections = self.inner.elections.lock();
            for (device, election) in elections.iter_mut() {
                let before = election.candidates.len();
                election.candidates.retain(|(name, _)| name != candidate);
                let mut touched = before != election.candidates.len();
                if let Some(owner) = election.owner.as_mut() {
                    if owner.candidate == candidate {
                        owner.crashed = true;
                        touched = true;
                    }
                }
                if touched {
                    affected.push(device.clone());
                }
            }
        }
        warn!(
            "event=ownership_node_failed candidate={} devices={}",
            candidate,
            affected.len()
        );
        for device in affected {
            self.spawn_reconcile(device);
        }
    }

    pub fn candidates(&self, device: &DeviceId) -> Vec<String> {
        self.inner
            .elections
            .lock()
            .get(device)
            .map(|election| {
                election
                    .candidates
                    .iter()
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn spawn_reconcile(&self, device: DeviceId) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.reconcile(device).await });
    }
}

impl ServiceInner {
    async fn reconcile(&self, device: DeviceId) {
        let gate = match self.elections.lock().get(&device) {
            Some(election) => Arc::clone(&election.gate),
            None => return,
        };
        let _serialized = gate.lock().await;
        loop {
            let change = {
                let mut elections = self.elections.lock();
                let Some(election) = elections.get_mut(&device) else {
                    return;
                };
                let first = election.candidates.first().cloned();
                let current = election.owner.as_ref().map(|owner| owner.candidate.clone());
                match (current, first) {
                    (Some(owner), Some((name, _))) if owner == name => None,
                    (None, None) => None,
                    (Some(_), _) => election.owner.take().map(Change::Revoke),
                    (None, Some((name, listener))) => {
                        election.epoch += 1;
                        election.owner = Some(Grant {
                            candidate: name.clone(),
                            epoch: election.epoch,
                            listener: Arc::clone(&listener),
                            crashed: false,
                        });
                        Some(Change::Grant(name, election.epoch, listener))
                    }
                }
            };
            match change {
                None => return,
                Some(Change::Revoke(grant)) => {
                    info!(
                        "event=ownership_revoked device={} candidate={} epoch={} crashed={}",
                        device, grant.candidate, grant.epoch, grant.crashed
                    );
                    if !grant.crashed {
                        grant.listener.lose_ownership().await;
                    }
                }
                Some(Change::Grant(candidate, epoch, listener)) => {
                    info!(
                        "event=ownership_granted device={} candidate={} epoch={}",
                        device, candidate, epoch
                    );
                    listener.become_owner(epoch).await;
                }
            }
        }
    }
}

impl OwnershipService for LocalOwnershipService {
    fn register_candidate(
        &self,
        device: &DeviceId,
        candidate: &str,
        listener: Arc<dyn OwnershipListener>,
    ) -> Result<(), OwnershipError> {
        {
            let mut failures = self.inner.injected_failures.lock();
            if let Some(remaining) = failures.get_mut(device) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(OwnershipError::RegistrationFailed {
                        device: device.to_string(),
                        reason: "injected failure".into(),
                    });
                }
            }
        }
        {
            let mut elections = self.inner.elections.lock();
            let election = elections.entry(device.clone()).or_insert_with(Election::new);
            if election.candidates.iter().any(|(name, _)| name == candidate) {
                return Err(OwnershipError::AlreadyRegistered {
                    device: device.to_string(),
                    candidate: candidate.to_string(),
                });
            }
            election.candidates.push((candidate.to_string(), listener));
        }
        debug!(
            "event=ownership_candidate_registered device={} candidate={}",
            device, candidate
        );
        self.spawn_reconcile(device.clone());
        Ok(())
    }

    fn withdraw_candidate(&self, device: &DeviceId, candidate: &str) {
        let removed = {
            let mut elections = self.inner.elections.lock();
            match elections.get_mut(device) {
                Some(election) => {
                    let before = election.candidates.len();
                    election.candidates.retain(|(name, _)| name != candidate);
                    before != election.candidates.len()
                }
                None => false,
            }
        };
        if removed {
            debug!(
                "event=ownership_candidate_withdrawn device={} candidate={}",
                device, candidate
            );
            self.spawn_reconcile(device.clone());
        }
    }

    fn owner_of(&self, device: &DeviceId) -> Option<(String, u64)> {
        self.inner
            .elections
            .lock()
            .get(device)
            .and_then(|election| election.owner.as_ref())
            .filter(|owner| !owner.crashed)
            .map(|owner| (owner.candidate.clone(), owner.epoch))
    }
}
