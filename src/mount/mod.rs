//! Uniform mount points, registered on every node regardless of role.
//!
//! The owner backs its mount point with the live device session; followers
//! back theirs with a [`ProxySet`] aimed at the owner's endpoint plus the
//! node's forwarded notification stream. Callers cannot tell them apart
//! except through failure classification.
//!
//! Writes always go through the owner's endpoint, including the owner's own,
//! so one transaction processor arbitrates the device write handle.

pub mod node_manager;

pub use node_manager::{NodeManager, Transition};

use crate::device::{
    CapabilitySet, DataPath, Datastore, DeviceId, DeviceReadTransaction, DeviceSession,
    Notification, RpcOutcome, SourceId,
};
use crate::endpoint::EndpointHandle;
use crate::error::{DeviceError, MountError};
use crate::proxy::tx::{ProxyReadTransaction, ProxyReadWriteTransaction};
use crate::proxy::ProxySet;
use crate::session::schema::SchemaResolver;
use log::{debug, info};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub enum MountBackend {
    Owner {
        session: Arc<dyn DeviceSession>,
        read_only: Arc<dyn DeviceReadTransaction>,
        resolver: SchemaResolver,
        request_timeout: Duration,
        /// Local route into the owner's endpoint, used for writes.
        writes: ProxySet,
    },
    Follower {
        proxies: ProxySet,
        notifications: broadcast::Sender<Notification>,
    },
}

pub struct MountPoint {
    device: DeviceId,
    capabilities: CapabilitySet,
    sources: Vec<SourceId>,
    backend: MountBackend,
    closed: AtomicBool,
}

async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, MountError>
where
    F: Future<Output = Result<T, DeviceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(DeviceError::Timeout(timeout).into()),
    }
}

impl MountPoint {
    pub fn new(
        device: DeviceId,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
        backend: MountBackend,
    ) -> Self {
        Self {
            device,
            capabilities,
            sources,
            backend,
            closed: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    pub fn is_owner(&self) -> bool {
        matches!(self.backend, MountBackend::Owner { .. })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), MountError> {
        if self.is_closed() {
            return Err(MountError::Closed(self.device.to_string()));
        }
        Ok(())
    }

    pub async fn read(&self, store: Datastore, path: &DataPath) -> Result<Option<Value>, MountError> {
        self.new_read_only()?.read(store, path).await
    }

    pub async fn exists(&self, store: Datastore, path: &DataPath) -> Result<bool, MountError> {
        self.new_read_only()?.exists(store, path).await
    }

    pub fn new_read_only(&self) -> Result<ReadTransaction, MountError> {
        self.ensure_open()?;
        Ok(match &self.backend {
            MountBackend::Owner {
                read_only,
                request_timeout,
                ..
            } => ReadTransaction::Local {
                read_only: Arc::clone(read_only),
                request_timeout: *request_timeout,
            },
            MountBackend::Follower { proxies, .. } => ReadTransaction::Proxy(proxies.new_read_only()),
        })
    }

    pub fn new_write_transaction(&self) -> Result<WriteTransaction, MountError> {
        self.ensure_open()?;
        self.write_route().new_read_write()
    }

    fn write_route(&self) -> &ProxySet {
        match &self.backend {
            MountBackend::Owner { writes, .. } => writes,
            MountBackend::Follower { proxies, .. } => proxies,
        }
    }

    pub async fn invoke_rpc(&self, name: &str, input: Option<Value>) -> Result<RpcOutcome, MountError> {
        self.ensure_open()?;
        match &self.backend {
            MountBackend::Owner {
                session,
                request_timeout,
                ..
            } => bounded(*request_timeout, session.invoke_rpc(name, input)).await,
            MountBackend::Follower { proxies, .. } => proxies.rpc().invoke(name, input).await,
        }
    }

    pub async fn invoke_action(
        &self,
        path: &DataPath,
        name: &str,
        input: Option<Value>,
    ) -> Result<RpcOutcome, MountError> {
        self.ensure_open()?;
        match &self.backend {
            MountBackend::Owner {
                session,
                request_timeout,
                ..
            } => bounded(*request_timeout, session.invoke_action(path, name, input)).await,
            MountBackend::Follower { proxies, .. } => {
                proxies.actions().invoke(path, name, input).await
            }
        }
    }

    pub async fn schema_source(&self, id: &SourceId) -> Result<String, MountError> {
        self.ensure_open()?;
        match &self.backend {
            MountBackend::Owner {
                session, resolver, ..
            } => resolver.resolve(session, id).await.map_err(|err| match err {
                crate::error::SchemaError::Device(err) => MountError::Device(err),
                other => MountError::Device(DeviceError::Unavailable(other.to_string())),
            }),
            MountBackend::Follower { proxies, .. } => proxies.schema_sources().get(id).await,
        }
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        match &self.backend {
            MountBackend::Owner { session, .. } => session.notifications(),
            MountBackend::Follower { notifications, .. } => notifications.subscribe(),
        }
    }

    /// Idempotent. Open write transactions are cancelled with the owner,
    /// pending asks fail, and new calls fail with `Closed`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.write_route().close();
        debug!("event=mount_point_closed device={}", self.device);
        true
    }
}

pub enum ReadTransaction {
    Local {
        read_only: Arc<dyn DeviceReadTransaction>,
        request_timeout: Duration,
    },
    Proxy(ProxyReadTransaction),
}

impl ReadTransaction {
    pub async fn read(&self, store: Datastore, path: &DataPath) -> Result<Option<Value>, MountError> {
        match self {
            ReadTransaction::Local {
                read_only,
                request_timeout,
            } => bounded(*request_timeout, read_only.read(store, path)).await,
            ReadTransaction::Proxy(proxy) => proxy.read(store, path).await,
        }
    }

    pub async fn exists(&self, store: Datastore, path: &DataPath) -> Result<bool, MountError> {
        match self {
            ReadTransaction::Local {
                read_only,
                request_timeout,
            } => bounded(*request_timeout, read_only.exists(store, path)).await,
            ReadTransaction::Proxy(proxy) => proxy.exists(store, path).await,
        }
    }

    pub fn close(&self) -> bool {
        match self {
            ReadTransaction::Local { .. } => true,
            ReadTransaction::Proxy(proxy) => proxy.close(),
        }
    }
}

/// Write transaction of either backend. The owner's mount point routes it
/// into its own endpoint; edits are applied in issuance order and their
/// outcome is reported by `commit`. Reads see committed state only.
pub type WriteTransaction = ProxyReadWriteTransaction;

/// Registry of the mount points of one node.
#[derive(Default)]
pub struct MountPointService {
    mounts: RwLock<HashMap<DeviceId, Arc<MountPoint>>>,
}

impl MountPointService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `mount`, closing any mount point it replaces.
    pub fn register(&self, mount: Arc<MountPoint>) {
        let replaced = self
            .mounts
            .write()
            .insert(mount.device().clone(), Arc::clone(&mount));
        if let Some(replaced) = replaced {
            replaced.close();
        }
    }

    pub fn unregister(&self, device: &DeviceId) -> Option<Arc<MountPoint>> {
        self.mounts.write().remove(device)
    }

    pub fn get(&self, device: &DeviceId) -> Option<Arc<MountPoint>> {
        self.mounts.read().get(device).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.mounts.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mounts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registers the one mount point of a device from either backend.
#[derive(Clone)]
pub struct MountFacade {
    device: DeviceId,
    origin: String,
    mounts: Arc<MountPointService>,
}

impl MountFacade {
    pub fn new(device: DeviceId, origin: impl Into<String>, mounts: Arc<MountPointService>) -> Self {
        Self {
            device,
            origin: origin.into(),
            mounts,
        }
    }

    /// Registers the owner's mount point. `endpoint` must already hold
    /// `session`, since writes are routed through it.
    pub fn register_owner(
        &self,
        session: Arc<dyn DeviceSession>,
        endpoint: &EndpointHandle,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
        resolver: SchemaResolver,
        request_timeout: Duration,
    ) -> Arc<MountPoint> {
        let read_only = session.new_read_only();
        let writes = ProxySet::local(
            endpoint.clone(),
            request_timeout,
            Arc::clone(resolver.cache()),
        );
        let mount = Arc::new(MountPoint::new(
            self.device.clone(),
            capabilities,
            sources,
            MountBackend::Owner {
                session,
                read_only,
                resolver,
                request_timeout,
                writes,
            },
        ));
        self.mounts.register(Arc::clone(&mount));
        info!(
            "event=mount_registered device={} node={} role=owner",
            self.device, self.origin
        );
        mount
    }

    pub fn register_follower(
        &self,
        proxies: ProxySet,
        notifications: broadcast::Sender<Notification>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    ) -> Arc<MountPoint> {
        let owner = proxies.endpoint().clone();
        let mount = Arc::new(MountPoint::new(
            self.device.clone(),
            capabilities,
            sources,
            MountBackend::Follower {
                proxies,
                notifications,
            },
        ));
        self.mounts.register(Arc::clone(&mount));
        info!(
            "event=mount_registered device={} node={} role=follower owner={}",
            self.device, self.origin, owner
        );
        mount
    }

    /// Idempotent. Returns whether a mount point was removed.
    pub fn unregister(&self) -> bool {
        match self.mounts.unregister(&self.device) {
            Some(mount) => {
                mount.close();
                info!("event=mount_unregistered device={}", self.device);
                true
            }
            None => false,
        }
    }
}
