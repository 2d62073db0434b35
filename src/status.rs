//! Owner-published connection status, readable by every node.
//!
//! Records are fenced by the owner epoch handed out at election: once a record
//! for epoch `n` has been stored, writes carrying an older epoch are rejected,
//! so a deposed owner cannot overwrite its successor.

use crate::channel::wire::EndpointRef;
use crate::device::{CapabilitySet, DeviceId};
use crate::error::StatusError;
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

const STATUS_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatusRecord {
    pub device: DeviceId,
    pub connected: bool,
    pub owner_address: Option<String>,
    pub owner_epoch: u64,
    #[serde(default)]
    pub capabilities: CapabilitySet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
}

impl ConnectionStatusRecord {
    pub fn connected(
        device: DeviceId,
        owner_address: impl Into<String>,
        owner_epoch: u64,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            device,
            connected: true,
            owner_address: Some(owner_address.into()),
            owner_epoch,
            capabilities,
            failure_cause: None,
        }
    }

    pub fn connecting(device: DeviceId, owner_address: impl Into<String>, owner_epoch: u64) -> Self {
        Self {
            device,
            connected: false,
            owner_address: Some(owner_address.into()),
            owner_epoch,
            capabilities: CapabilitySet::new(),
            failure_cause: None,
        }
    }

    pub fn failed(
        device: DeviceId,
        owner_address: impl Into<String>,
        owner_epoch: u64,
        cause: impl Into<String>,
    ) -> Self {
        Self {
            device,
            connected: false,
            owner_address: Some(owner_address.into()),
            owner_epoch,
            capabilities: CapabilitySet::new(),
            failure_cause: Some(cause.into()),
        }
    }

    /// Endpoint reference followers should target, if the device is usable.
    pub fn endpoint(&self) -> Option<EndpointRef> {
        if !self.connected {
            return None;
        }
        self.owner_address.as_ref().map(|address| EndpointRef {
            address: address.clone(),
            device: self.device.clone(),
            epoch: self.owner_epoch,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    Updated(ConnectionStatusRecord),
    Removed(DeviceId),
}

impl StatusEvent {
    pub fn device(&self) -> &DeviceId {
        match self {
            StatusEvent::Updated(record) => &record.device,
            StatusEvent::Removed(device) => device,
        }
    }
}

/// Externally brokered key-value record with change subscriptions.
pub trait StatusStore: Send + Sync {
    fn publish(&self, record: ConnectionStatusRecord) -> Result<(), StatusError>;
    /// Removes the record if `epoch` is not older than the stored one.
    fn remove(&self, device: &DeviceId, epoch: u64) -> Result<bool, StatusError>;
    fn get(&self, device: &DeviceId) -> Option<ConnectionStatusRecord>;
    fn subscribe(&self) -> broadcast::Receiver<StatusEvent>;
}

#[derive(Default)]
struct StoreState {
    records: HashMap<DeviceId, ConnectionStatusRecord>,
    // Survives removal so a late write from an old owner stays fenced.
    high_water: HashMap<DeviceId, u64>,
}

pub struct InMemoryStatusStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<StatusEvent>,
}

impl Default for InMemoryStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(STATUS_EVENT_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    fn check_epoch(state: &StoreState, device: &DeviceId, offered: u64) -> Result<(), StatusError> {
        let stored = state.high_water.get(device).copied().unwrap_or(0);
        if offered < stored {
            warn!(
                "event=status_fenced device={} stored_epoch={} offered_epoch={}",
                device, stored, offered
            );
            return Err(StatusError::StaleEpoch {
                device: device.to_string(),
                stored,
                offered,
            });
        }
        Ok(())
    }
}

impl StatusStore for InMemoryStatusStore {
    fn publish(&self, record: ConnectionStatusRecord) -> Result<(), StatusError> {
        {
            let mut state = self.state.write();
            Self::check_epoch(&state, &record.device, record.owner_epoch)?;
            state
                .high_water
                .insert(record.device.clone(), record.owner_epoch);
            state.records.insert(record.device.clone(), record.clone());
        }
        debug!(
            "event=status_published device={} connected={} owner={:?} epoch={}",
            record.device, record.connected, record.owner_address, record.owner_epoch
        );
        let _ = self.events.send(StatusEvent::Updated(record));
        Ok(())
    }

    fn remove(&self, device: &DeviceId, epoch: u64) -> Result<bool, StatusError> {
        let removed = {
            let mut state = self.state.write();
            Self::check_epoch(&state, device, epoch)?;
            state.records.remove(device).is_some()
        };
        if removed {
            debug!("event=status_removed device={} epoch={}", device, epoch);
            let _ = self.events.send(StatusEvent::Removed(device.clone()));
        }
        Ok(removed)
    }

    fn get(&self, device: &DeviceId) -> Option<ConnectionStatusRecord> {
        self.state.read().records.get(device).cloned()
    }

    fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }
}
