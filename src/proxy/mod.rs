//! Follower-side stand-ins for the owner's device services.
//!
//! Every call becomes one request to the owner's endpoint with the configured
//! ask timeout. Replies translate into a payload, the empty sentinel, a
//! device-reported error list, or a clustering/invariant failure. Closing the
//! set cancels the owner-side write handles it opened, then every outstanding
//! ask.
//!
//! The owner's own mount point uses a local set that enqueues straight onto
//! its endpoint instead of going through the transport.

pub mod rpc;
pub mod schema;
pub mod tx;

use crate::channel::wire::{EndpointFault, EndpointRef, MountSessionInfo, Reply, Request, TxId};
use crate::channel::CorrelationChannel;
use crate::endpoint::EndpointHandle;
use crate::error::{ClusterError, DeviceError, InvariantError, MountError};
use crate::session::schema::SchemaSourceCache;
use crate::timeouts::with_timeout;
use log::{debug, info};
use parking_lot::Mutex;
use rpc::{ProxyActionService, ProxyRpcService};
use schema::ProxySchemaSourceProvider;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tx::{ProxyReadTransaction, ProxyReadWriteTransaction, WriteSlot};

// Transaction ids must stay unique across proxy rebuilds on one node, because
// the owner remembers terminated ids for the lifetime of its endpoint.
static TX_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_tx_id(origin: &str) -> TxId {
    TxId::new(origin, TX_SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

enum Route {
    Remote(Arc<CorrelationChannel>),
    Local(EndpointHandle),
}

#[derive(Clone)]
pub struct ProxySet {
    shared: Arc<ProxyShared>,
}

struct ProxyShared {
    endpoint: EndpointRef,
    route: Route,
    ask_timeout: Duration,
    write_slot: WriteSlot,
    // Write transactions that may hold the owner's handle.
    open_writes: Mutex<BTreeSet<TxId>>,
    schema_cache: Arc<SchemaSourceCache>,
    closed: watch::Sender<bool>,
}

impl ProxySet {
    pub fn new(
        endpoint: EndpointRef,
        channel: Arc<CorrelationChannel>,
        ask_timeout: Duration,
        schema_cache: Arc<SchemaSourceCache>,
    ) -> Self {
        Self::with_route(endpoint, Route::Remote(channel), ask_timeout, schema_cache)
    }

    /// Set bound to an endpoint running in this process.
    pub fn local(
        endpoint: EndpointHandle,
        ask_timeout: Duration,
        schema_cache: Arc<SchemaSourceCache>,
    ) -> Self {
        let reference = endpoint.reference().clone();
        Self::with_route(reference, Route::Local(endpoint), ask_timeout, schema_cache)
    }

    fn with_route(
        endpoint: EndpointRef,
        route: Route,
        ask_timeout: Duration,
        schema_cache: Arc<SchemaSourceCache>,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(ProxyShared {
                endpoint,
                route,
                ask_timeout,
                write_slot: WriteSlot::default(),
                open_writes: Mutex::new(BTreeSet::new()),
                schema_cache,
                closed,
            }),
        }
    }

    fn origin(&self) -> &str {
        match &self.shared.route {
            Route::Remote(channel) => channel.address(),
            Route::Local(_) => &self.shared.endpoint.address,
        }
    }

    pub fn endpoint(&self) -> &EndpointRef {
        &self.shared.endpoint
    }

    pub fn ask_timeout(&self) -> Duration {
        self.shared.ask_timeout
    }

    pub fn new_read_only(&self) -> ProxyReadTransaction {
        ProxyReadTransaction::new(self.clone(), next_tx_id(self.origin()))
    }

    /// Fails with `WriteInProgress` while another write transaction from
    /// this set is still open.
    pub fn new_read_write(&self) -> Result<ProxyReadWriteTransaction, MountError> {
        self.ensure_open()?;
        let permit = self.shared.write_slot.acquire()?;
        Ok(ProxyReadWriteTransaction::new(
            self.clone(),
            next_tx_id(self.origin()),
            permit,
        ))
    }

    pub fn rpc(&self) -> ProxyRpcService {
        ProxyRpcService::new(self.clone())
    }

    pub fn actions(&self) -> ProxyActionService {
        ProxyActionService::new(self.clone())
    }

    pub fn schema_sources(&self) -> ProxySchemaSourceProvider {
        ProxySchemaSourceProvider::new(self.clone(), Arc::clone(&self.shared.schema_cache))
    }

    pub async fn open_mount_session(&self) -> Result<MountSessionInfo, MountError> {
        match self.ask_value(Request::OpenMountSession).await? {
            Some(payload) => serde_json::from_value(payload)
                .map_err(|err| ClusterError::Codec(err.to_string()).into()),
            None => Err(ClusterError::Codec("empty mount session reply".into()).into()),
        }
    }

    pub async fn subscribe_notifications(&self, subscriber: &str) -> Result<(), MountError> {
        self.ask_value(Request::SubscribeNotifications {
            subscriber: subscriber.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub fn unsubscribe_notifications(&self, subscriber: &str) {
        let request = Request::UnsubscribeNotifications {
            subscriber: subscriber.to_string(),
        };
        if let Err(err) = self.tell(request) {
            debug!(
                "event=unsubscribe_failed endpoint={} error={}",
                self.shared.endpoint, err
            );
        }
    }

    /// Cancels the write handles this set opened on the owner, then the
    /// outstanding asks. Later calls fail with `Closed`. Idempotent.
    pub fn close(&self) {
        if *self.shared.closed.borrow() {
            return;
        }
        let open: Vec<TxId> = std::mem::take(&mut *self.shared.open_writes.lock())
            .into_iter()
            .collect();
        for tx in open {
            if let Err(err) = self.send(Request::Cancel { tx: tx.clone() }) {
                debug!(
                    "event=write_cancel_on_close_failed endpoint={} tx={} error={}",
                    self.shared.endpoint, tx, err
                );
            }
        }
        if !self.shared.closed.send_replace(true) {
            info!("event=proxy_set_closed endpoint={}", self.shared.endpoint);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), MountError> {
        if self.is_closed() {
            return Err(MountError::Closed(self.shared.endpoint.device.to_string()));
        }
        Ok(())
    }

    pub(crate) async fn ask(&self, request: Request) -> Result<Reply, MountError> {
        self.ensure_open()?;
        let mut closed = self.shared.closed.subscribe();
        tokio::select! {
            reply = self.route_ask(request) => Ok(reply?),
            _ = closed.wait_for(|closed| *closed) => Err(ClusterError::Cancelled.into()),
        }
    }

    async fn route_ask(&self, request: Request) -> Result<Reply, ClusterError> {
        let timeout = self.shared.ask_timeout;
        match &self.shared.route {
            Route::Remote(channel) => channel.ask(&self.shared.endpoint, request, timeout).await,
            Route::Local(endpoint) => {
                with_timeout(&self.shared.endpoint, timeout, endpoint.ask_local(request))
                    .await?
                    .map_err(|_| ClusterError::EndpointGone(self.shared.endpoint.to_string()))
            }
        }
    }

    pub(crate) async fn ask_value(&self, request: Request) -> Result<Option<Value>, MountError> {
        let reply = self.ask(request).await?;
        self.translate(reply)
    }

    pub(crate) fn tell(&self, request: Request) -> Result<(), MountError> {
        self.ensure_open()?;
        self.send(request)
    }

    /// One-way send that skips the closed check; used for cleanup.
    pub(crate) fn send(&self, request: Request) -> Result<(), MountError> {
        match &self.shared.route {
            Route::Remote(channel) => Ok(channel.tell(&self.shared.endpoint, request)?),
            Route::Local(endpoint) => {
                if endpoint.tell_local(request) {
                    Ok(())
                } else {
                    Err(ClusterError::EndpointGone(self.shared.endpoint.to_string()).into())
                }
            }
        }
    }

    /// Records a write transaction that may hold the owner's handle.
    pub(crate) fn track_write(&self, tx: &TxId) {
        self.shared.open_writes.lock().insert(tx.clone());
    }

    /// Returns false if the transaction was not tracked, for example because
    /// `close` already cancelled it.
    pub(crate) fn untrack_write(&self, tx: &TxId) -> bool {
        self.shared.open_writes.lock().remove(tx)
    }

    pub(crate) fn translate(&self, reply: Reply) -> Result<Option<Value>, MountError> {
        match reply {
            Reply::Success(payload) => Ok(Some(payload)),
            Reply::Empty => Ok(None),
            Reply::Error(errors) => Err(DeviceError::Rejected(errors).into()),
            Reply::Fault(fault) => Err(self.fault_error(fault)),
        }
    }

    pub(crate) fn fault_error(&self, fault: EndpointFault) -> MountError {
        match fault {
            EndpointFault::NotOwner { address } => ClusterError::NotOwner(address).into(),
            EndpointFault::StaleEpoch { current } => ClusterError::StaleOwner(format!(
                "{} (current epoch {current})",
                self.shared.endpoint
            ))
            .into(),
            EndpointFault::StaleHandle { tx } => InvariantError::StaleHandle(tx).into(),
            EndpointFault::WriteInProgress { .. } => InvariantError::WriteInProgress.into(),
            EndpointFault::TransactionClosed { tx } => InvariantError::TransactionClosed(tx).into(),
            EndpointFault::UnknownTransaction { tx } => {
                InvariantError::UnknownTransaction(tx).into()
            }
            EndpointFault::DeviceUnavailable { reason } => DeviceError::Unavailable(reason).into(),
        }
    }
}
