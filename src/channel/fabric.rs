//! Frame delivery between nodes.
//!
//! `LocalFabric` connects nodes living in one process. Partitions drop frames
//! silently so callers only learn about them through their ask deadline.

use super::wire::Frame;
use crate::error::TransportError;
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

pub trait Transport: Send + Sync {
    fn local_address(&self) -> &str;
    /// Queues `frame` for `to`. Delivery is ordered per destination and at
    /// most once.
    fn send(&self, to: &str, frame: Frame) -> Result<(), TransportError>;
}

#[derive(Default)]
pub struct LocalFabric {
    inboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Frame>>>,
    partitions: RwLock<HashSet<(String, String)>>,
}

impl LocalFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `address` and returns its transport plus inbox.
    pub fn attach(
        self: &Arc<Self>,
        address: &str,
    ) -> (Arc<FabricTransport>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(address.to_string(), tx);
        info!("event=fabric_attach address={}", address);
        (
            Arc::new(FabricTransport {
                fabric: Arc::clone(self),
                address: address.to_string(),
            }),
            rx,
        )
    }

    /// Removes `address`; frames sent to it fail with an unknown peer error.
    pub fn detach(&self, address: &str) -> bool {
        let removed = self.inboxes.write().remove(address).is_some();
        if removed {
            info!("event=fabric_detach address={}", address);
        }
        removed
    }

    pub fn partition(&self, a: &str, b: &str) {
        let mut partitions = self.partitions.write();
        partitions.insert((a.to_string(), b.to_string()));
        partitions.insert((b.to_string(), a.to_string()));
        info!("event=fabric_partition a={} b={}", a, b);
    }

    pub fn heal(&self, a: &str, b: &str) {
        let mut partitions = self.partitions.write();
        partitions.remove(&(a.to_string(), b.to_string()));
        partitions.remove(&(b.to_string(), a.to_string()));
        info!("event=fabric_heal a={} b={}", a, b);
    }

    fn deliver(&self, from: &str, to: &str, frame: Frame) -> Result<(), TransportError> {
        if self
            .partitions
            .read()
            .contains(&(from.to_string(), to.to_string()))
        {
            debug!("event=fabric_drop from={} to={} reason=partition", from, to);
            return Ok(());
        }
        let inbox = self
            .inboxes
            .read()
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeer(to.to_string()))?;
        inbox
            .send(frame)
            .map_err(|_| TransportError::Closed(to.to_string()))
    }
}

pub struct FabricTransport {
    fabric: Arc<LocalFabric>,
    address: String,
}

impl Transport for FabricTransport {
    fn local_address(&self) -> &str {
        &self.address
    }

    fn send(&self, to: &str, frame: Frame) -> Result<(), TransportError> {
        self.fabric.deliver(&self.address, to, frame)
    }
}
