//! Per-process wiring: inbox routing, endpoint registry, notification hub and
//! the lifecycle of every mounted device.

use crate::channel::fabric::Transport;
use crate::channel::wire::{
    EndpointFault, EndpointRef, Frame, NotificationFrame, Reply, ReplyFrame, RequestFrame,
};
use crate::channel::CorrelationChannel;
use crate::config::DeviceConfig;
use crate::device::{DeviceConnector, DeviceId, Notification};
use crate::endpoint::EndpointHandle;
use crate::error::OwnershipError;
use crate::mount::{MountPoint, MountPointService};
use crate::ownership::{DeviceContext, OwnershipService, Role};
use crate::session::credentials::CredentialStore;
use crate::session::schema::SchemaSourceCache;
use crate::status::StatusStore;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const NOTIFICATION_HUB_CAPACITY: usize = 256;

/// Cluster services shared by every device context of a node.
#[derive(Clone)]
pub struct NodeDependencies {
    pub status: Arc<dyn StatusStore>,
    pub ownership: Arc<dyn OwnershipService>,
    pub connector: Arc<dyn DeviceConnector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub schema_cache: Arc<SchemaSourceCache>,
}

/// Endpoints this node runs as owner, keyed by device.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<DeviceId, EndpointHandle>>,
}

impl EndpointRegistry {
    pub fn insert(&self, handle: EndpointHandle) -> Option<EndpointHandle> {
        self.endpoints
            .write()
            .insert(handle.reference().device.clone(), handle)
    }

    /// Removes the entry only if it still belongs to `reference`.
    pub fn remove(&self, reference: &EndpointRef) -> Option<EndpointHandle> {
        let mut endpoints = self.endpoints.write();
        match endpoints.get(&reference.device) {
            Some(handle) if handle.reference() == reference => endpoints.remove(&reference.device),
            _ => None,
        }
    }

    pub fn get(&self, device: &DeviceId) -> Option<EndpointHandle> {
        self.endpoints.read().get(device).cloned()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-device fan-out of notifications forwarded by owners.
#[derive(Default)]
pub struct NotificationHub {
    streams: RwLock<HashMap<DeviceId, broadcast::Sender<Notification>>>,
}

impl NotificationHub {
    pub fn sender(&self, device: &DeviceId) -> broadcast::Sender<Notification> {
        if let Some(sender) = self.streams.read().get(device) {
            return sender.clone();
        }
        self.streams
            .write()
            .entry(device.clone())
            .or_insert_with(|| broadcast::channel(NOTIFICATION_HUB_CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, frame: NotificationFrame) -> usize {
        let sender = self.streams.read().get(&frame.device).cloned();
        match sender {
            Some(sender) => sender.send(frame.notification).unwrap_or(0),
            None => 0,
        }
    }
}

pub struct NodeRuntime {
    pub address: String,
    pub transport: Arc<dyn Transport>,
    pub channel: Arc<CorrelationChannel>,
    pub status: Arc<dyn StatusStore>,
    pub ownership: Arc<dyn OwnershipService>,
    pub connector: Arc<dyn DeviceConnector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub schema_cache: Arc<SchemaSourceCache>,
    pub mounts: Arc<MountPointService>,
    pub endpoints: EndpointRegistry,
    pub notifications: NotificationHub,
}

impl NodeRuntime {
    pub fn new(transport: Arc<dyn Transport>, deps: NodeDependencies) -> Arc<Self> {
        Arc::new(Self {
            address: transport.local_address().to_string(),
            channel: CorrelationChannel::new(Arc::clone(&transport)),
            transport,
            status: deps.status,
            ownership: deps.ownership,
            connector: deps.connector,
            credentials: deps.credentials,
            schema_cache: deps.schema_cache,
            mounts: MountPointService::new(),
            endpoints: EndpointRegistry::default(),
            notifications: NotificationHub::default(),
        })
    }

    pub fn route(&self, frame: Frame) {
        match frame {
            Frame::Request(frame) => self.dispatch(frame),
            Frame::Reply(frame) => {
                self.channel.complete(frame);
            }
            Frame::Notification(frame) => {
                self.notifications.publish(frame);
            }
        }
    }

    fn dispatch(&self, frame: RequestFrame) {
        let RequestFrame {
            origin,
            id,
            target,
            request,
        } = frame;
        let fault = match self.endpoints.get(&target.device) {
            Some(handle) if handle.reference().epoch == target.epoch => {
                if handle.enqueue(origin.clone(), id, request) {
                    return;
                }
                EndpointFault::NotOwner {
                    address: self.address.clone(),
                }
            }
            Some(handle) => EndpointFault::StaleEpoch {
                current: handle.reference().epoch,
            },
            None => EndpointFault::NotOwner {
                address: self.address.clone(),
            },
        };
        debug!(
            "event=request_refused node={} target={} origin={} fault={:?}",
            self.address, target, origin, fault
        );
        let Some(id) = id else {
            return;
        };
        let reply = Frame::Reply(ReplyFrame {
            id,
            device: target.device,
            reply: Reply::Fault(fault),
        });
        if let Err(err) = self.transport.send(&origin, reply) {
            debug!(
                "event=refusal_undeliverable node={} origin={} error={}",
                self.address, origin, err
            );
        }
    }
}

/// One cluster member.
pub struct ClusterNode {
    runtime: Arc<NodeRuntime>,
    contexts: tokio::sync::Mutex<HashMap<DeviceId, DeviceContext>>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterNode {
    pub fn start(
        transport: Arc<dyn Transport>,
        mut inbox: mpsc::UnboundedReceiver<Frame>,
        deps: NodeDependencies,
    ) -> Arc<Self> {
        let runtime = NodeRuntime::new(transport, deps);
        let routed = Arc::clone(&runtime);
        let router = tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                routed.route(frame);
            }
            debug!("event=node_inbox_closed node={}", routed.address);
        });
        info!("event=node_started node={}", runtime.address);
        Arc::new(Self {
            runtime,
            contexts: tokio::sync::Mutex::new(HashMap::new()),
            router: Mutex::new(Some(router)),
        })
    }

    pub fn address(&self) -> &str {
        &self.runtime.address
    }

    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.runtime
    }

    /// Becomes a candidate for the device and starts following its status.
    pub async fn mount_device(&self, config: DeviceConfig) -> Result<(), OwnershipError> {
        let device = config.id();
        let mut contexts = self.contexts.lock().await;
        if contexts.contains_key(&device) {
            return Err(OwnershipError::AlreadyRegistered {
                device: device.to_string(),
                candidate: self.runtime.address.clone(),
            });
        }
        let context = DeviceContext::start(Arc::clone(&self.runtime), config).await?;
        contexts.insert(device, context);
        Ok(())
    }

    /// Replaces the device's context with one built from `config`.
    pub async fn refresh_device(&self, config: DeviceConfig) -> Result<(), OwnershipError> {
        self.unmount_device(&config.id()).await;
        self.mount_device(config).await
    }

    pub async fn unmount_device(&self, device: &DeviceId) -> bool {
        let context = self.contexts.lock().await.remove(device);
        match context {
            Some(context) => {
                context.close().await;
                true
            }
            None => false,
        }
    }

    pub fn mount_point(&self, device: &DeviceId) -> Option<Arc<MountPoint>> {
        self.runtime.mounts.get(device)
    }

    pub async fn role(&self, device: &DeviceId) -> Option<Role> {
        self.contexts
            .lock()
            .await
            .get(device)
            .map(DeviceContext::role)
    }

    pub async fn devices(&self) -> Vec<DeviceId> {
        self.contexts.lock().await.keys().cloned().collect()
    }

    /// Stops everything without withdrawing candidacies or touching the
    /// status store, as if the process died.
    pub async fn crash(&self) {
        warn!("event=node_crashed node={}", self.runtime.address);
        let contexts: Vec<_> = self.contexts.lock().await.drain().map(|(_, c)| c).collect();
        for context in contexts {
            context.halt().await;
        }
        self.stop_routing();
    }

    /// Releases every device and stops routing.
    pub async fn shutdown(&self) {
        let contexts: Vec<_> = self.contexts.lock().await.drain().map(|(_, c)| c).collect();
        for context in contexts {
            context.close().await;
        }
        self.stop_routing();
        info!("event=node_stopped node={}", self.runtime.address);
    }

    fn stop_routing(&self) {
        if let Some(router) = self.router.lock().take() {
            router.abort();
        }
        self.runtime.channel.shutdown();
    }
}
