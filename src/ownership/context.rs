//! Per-device coordinator: reacts to ownership changes by switching the node
//! between the owner stack (session manager, endpoint, local mount) and the
//! follower stack (node manager, proxy mount).

use super::{OwnershipListener, Role};
use crate::channel::wire::EndpointRef;
use crate::config::DeviceConfig;
use crate::device::{CapabilitySet, DeviceId, DeviceSession, SourceId};
use crate::endpoint::{EndpointHandle, RemoteOperationEndpoint};
use crate::error::OwnershipError;
use crate::mount::{MountFacade, NodeManager};
use crate::node::NodeRuntime;
use crate::retry::RetryPolicy;
use crate::session::schema::SchemaResolver;
use crate::session::{DeviceHandler, DeviceSessionManager, SessionDependencies};
use crate::status::ConnectionStatusRecord;
use crate::timeouts::{REGISTRATION_ATTEMPTS, REGISTRATION_RETRY_DELAY};
use crate::PinFuture;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

struct OwnerStack {
    session: DeviceSessionManager,
    endpoint: EndpointHandle,
}

struct ContextInner {
    config: DeviceConfig,
    device: DeviceId,
    runtime: Arc<NodeRuntime>,
    facade: MountFacade,
    node_manager: NodeManager,
    role: Mutex<Role>,
    owner: Mutex<Option<OwnerStack>>,
    transition: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl DeviceContext {
    /// Starts following the device, then registers as an ownership
    /// candidate. Registration is retried; if it keeps failing the context is
    /// closed and the error returned.
    pub async fn start(runtime: Arc<NodeRuntime>, config: DeviceConfig) -> Result<Self, OwnershipError> {
        let device = config.id();
        let facade = MountFacade::new(
            device.clone(),
            runtime.address.clone(),
            Arc::clone(&runtime.mounts),
        );
        let node_manager = NodeManager::new(
            device.clone(),
            config.ask_timeout(),
            Arc::clone(&runtime),
            facade.clone(),
        );
        let context = Self {
            inner: Arc::new(ContextInner {
                config,
                device,
                runtime,
                facade,
                node_manager,
                role: Mutex::new(Role::Follower),
                owner: Mutex::new(None),
                transition: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        };
        context.inner.node_manager.start();

        let mut retry = RetryPolicy::fixed(REGISTRATION_ATTEMPTS, REGISTRATION_RETRY_DELAY).handle();
        loop {
            let listener: Arc<dyn OwnershipListener> = Arc::new(context.clone());
            match context.inner.runtime.ownership.register_candidate(
                &context.inner.device,
                &context.inner.runtime.address,
                listener,
            ) {
                Ok(()) => break,
                Err(err) => match retry.next_delay() {
                    Some(delay) => {
                        warn!(
                            "event=candidate_registration_retry device={} attempt={} error={}",
                            context.inner.device,
                            retry.attempts(),
                            err
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        error!(
                            "event=candidate_registration_failed device={} error={}",
                            context.inner.device, err
                        );
                        context.close().await;
                        return Err(err);
                    }
                },
            }
        }
        info!(
            "event=device_context_started device={} node={}",
            context.inner.device, context.inner.runtime.address
        );
        Ok(context)
    }

    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    pub fn role(&self) -> Role {
        *self.inner.role.lock()
    }

    pub fn endpoint(&self) -> Option<EndpointRef> {
        self.inner
            .owner
            .lock()
            .as_ref()
            .map(|stack| stack.endpoint.reference().clone())
    }

    /// Tears down both stacks, removes the status record if this node
    /// published it, then withdraws candidacy. Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _transition = inner.transition.lock().await;
        let role = std::mem::replace(&mut *inner.role.lock(), Role::Follower);
        inner.teardown_owner().await;
        inner.node_manager.stop().await;
        if let Role::Owner { epoch } = role {
            match inner.runtime.status.remove(&inner.device, epoch) {
                Ok(removed) => debug!(
                    "event=status_removed device={} epoch={} removed={}",
                    inner.device, epoch, removed
                ),
                Err(err) => debug!(
                    "event=status_remove_fenced device={} error={}",
                    inner.device, err
                ),
            }
        }
        // The successor is granted only after this transition lock is released.
        inner
            .runtime
            .ownership
            .withdraw_candidate(&inner.device, &inner.runtime.address);
        info!("event=device_context_closed device={}", inner.device);
    }

    /// Stops both stacks without withdrawing or publishing anything.
    pub async fn halt(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        let _transition = inner.transition.lock().await;
        *inner.role.lock() = Role::Follower;
        inner.teardown_owner().await;
        inner.node_manager.stop().await;
        warn!("event=device_context_halted device={}", inner.device);
    }
}

impl OwnershipListener for DeviceContext {
    fn become_owner(&self, epoch: u64) -> PinFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.become_owner(epoch).await })
    }

    fn lose_ownership(&self) -> PinFuture<()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.lose_ownership().await })
    }
}

impl ContextInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn become_owner(&self, epoch: u64) {
        let _transition = self.transition.lock().await;
        if self.is_closed() {
            debug!(
                "event=ownership_grant_ignored device={} epoch={}",
                self.device, epoch
            );
            return;
        }
        info!(
            "event=became_owner device={} node={} epoch={}",
            self.device, self.runtime.address, epoch
        );
        self.node_manager.stop().await;

        let session = DeviceSessionManager::new(
            self.config.clone(),
            SessionDependencies {
                connector: Arc::clone(&self.runtime.connector),
                credentials: Arc::clone(&self.runtime.credentials),
                schema_cache: Arc::clone(&self.runtime.schema_cache),
            },
        );
        let reference = EndpointRef {
            address: self.runtime.address.clone(),
            device: self.device.clone(),
            epoch,
        };
        let endpoint = RemoteOperationEndpoint::spawn(
            reference,
            Arc::clone(&self.runtime.transport),
            session.resolver().clone(),
            self.config.write_tx_idle_timeout(),
        );
        if let Some(previous) = self.runtime.endpoints.insert(endpoint.clone()) {
            warn!(
                "event=endpoint_replaced device={} previous={}",
                self.device,
                previous.reference()
            );
            previous.shutdown().await;
        }
        *self.role.lock() = Role::Owner { epoch };

        let handler = OwnerHandler {
            runtime: Arc::clone(&self.runtime),
            device: self.device.clone(),
            epoch,
            endpoint: endpoint.clone(),
            facade: self.facade.clone(),
            resolver: session.resolver().clone(),
            request_timeout: self.config.request_timeout(),
        };
        handler.publish(ConnectionStatusRecord::connecting(
            self.device.clone(),
            self.runtime.address.clone(),
            epoch,
        ));
        session.spawn_connect(Arc::new(handler));
        *self.owner.lock() = Some(OwnerStack { session, endpoint });
    }

    async fn lose_ownership(&self) {
        let _transition = self.transition.lock().await;
        let was = std::mem::replace(&mut *self.role.lock(), Role::Follower);
        info!(
            "event=lost_ownership device={} node={} role={}",
            self.device, self.runtime.address, was
        );
        self.teardown_owner().await;
        if !self.is_closed() {
            self.node_manager.start();
        }
    }

    /// Stops the session manager, cancels the open write handle with the
    /// endpoint, and removes the owner mount.
    async fn teardown_owner(&self) {
        let stack = self.owner.lock().take();
        if let Some(OwnerStack { session, endpoint }) = stack {
            session.stop().await;
            self.runtime.endpoints.remove(endpoint.reference());
            endpoint.shutdown().await;
        }
        self.facade.unregister();
    }
}

/// Session callbacks of one ownership tenure. Never takes the transition
/// lock, so it may run while a transition waits on the session manager.
struct OwnerHandler {
    runtime: Arc<NodeRuntime>,
    device: DeviceId,
    epoch: u64,
    endpoint: EndpointHandle,
    facade: MountFacade,
    resolver: SchemaResolver,
    request_timeout: Duration,
}

impl OwnerHandler {
    fn publish(&self, record: ConnectionStatusRecord) {
        let connected = record.connected;
        if let Err(err) = self.runtime.status.publish(record) {
            warn!(
                "event=status_publish_rejected device={} epoch={} connected={} error={}",
                self.device, self.epoch, connected, err
            );
        }
    }
}

impl DeviceHandler for OwnerHandler {
    fn on_connected(
        &self,
        session: Arc<dyn DeviceSession>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    ) -> PinFuture<()> {
        self.endpoint
            .session_up(Arc::clone(&session), capabilities.clone(), sources.clone());
        self.facade.register_owner(
            session,
            &self.endpoint,
            capabilities.clone(),
            sources,
            self.resolver.clone(),
            self.request_timeout,
        );
        self.publish(ConnectionStatusRecord::connected(
            self.device.clone(),
            self.runtime.address.clone(),
            self.epoch,
            capabilities,
        ));
        Box::pin(async {})
    }

    fn on_disconnected(&self) -> PinFuture<()> {
        self.endpoint.session_down();
        self.facade.unregister();
        self.publish(ConnectionStatusRecord::connecting(
            self.device.clone(),
            self.runtime.address.clone(),
            self.epoch,
        ));
        Box::pin(async {})
    }

    fn on_failed(&self, cause: String) -> PinFuture<()> {
        self.endpoint.session_down();
        self.facade.unregister();
        self.publish(ConnectionStatusRecord::failed(
            self.device.clone(),
            self.runtime.address.clone(),
            self.epoch,
            cause,
        ));
        // Give up the claim; the service will call lose_ownership.
        self.runtime
            .ownership
            .withdraw_candidate(&self.device, &self.runtime.address);
        Box::pin(async {})
    }
}
