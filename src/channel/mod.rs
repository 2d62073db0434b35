//! Correlation channel: typed request/reply over a [`Transport`] with an
//! explicit deadline per request.
//!
//! A request is at-most-once. When the deadline passes the caller sees a
//! clustering timeout and the pending entry is released; a reply arriving
//! afterwards is discarded.

pub mod fabric;
pub mod pending;
pub mod wire;

use crate::error::{ClusterError, TransportError};
use fabric::Transport;
use log::{debug, warn};
use pending::PendingTable;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wire::{EndpointRef, Frame, Reply, ReplyFrame, Request, RequestFrame};

pub struct CorrelationChannel {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    closed: AtomicBool,
}

impl CorrelationChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn address(&self) -> &str {
        self.transport.local_address()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Sends `request` to `target` and waits at most `timeout` for the reply.
    pub async fn ask(
        &self,
        target: &EndpointRef,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply, ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::Cancelled);
        }
        let kind = request.kind();
        let (guard, reply) = self.pending.register();
        let frame = Frame::Request(RequestFrame {
            origin: self.address().to_string(),
            id: Some(guard.id()),
            target: target.clone(),
            request,
        });
        self.transport
            .send(&target.address, frame)
            .map_err(|err| unreachable(target, err))?;
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClusterError::Cancelled),
            Err(_) => {
                warn!(
                    "event=ask_timeout target={} kind={} request_id={} timeout_ms={}",
                    target,
                    kind,
                    guard.id().0,
                    timeout.as_millis()
                );
                Err(ClusterError::Timeout {
                    target: target.to_string(),
                    timeout,
                })
            }
        }
    }

    /// One-way send. Ordered with asks to the same target.
    pub fn tell(&self, target: &EndpointRef, request: Request) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::Cancelled);
        }
        let frame = Frame::Request(RequestFrame {
            origin: self.address().to_string(),
            id: None,
            target: target.clone(),
            request,
        });
        self.transport
            .send(&target.address, frame)
            .map_err(|err| unreachable(target, err))
    }

    /// Routes an inbound reply to its waiter. Late replies are dropped.
    pub fn complete(&self, frame: ReplyFrame) -> bool {
        let id = frame.id;
        let delivered = self.pending.complete(id, frame.reply);
        if !delivered {
            debug!(
                "event=late_reply device={} request_id={}",
                frame.device, id.0
            );
        }
        delivered
    }

    /// Fails every outstanding ask and refuses new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let cancelled = self.pending.cancel_all();
        if cancelled > 0 {
            debug!(
                "event=channel_shutdown address={} cancelled={}",
                self.address(),
                cancelled
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn unreachable(target: &EndpointRef, err: TransportError) -> ClusterError {
    match err {
        TransportError::UnknownPeer(_) | TransportError::Closed(_) => {
            ClusterError::EndpointGone(target.to_string())
        }
        other => ClusterError::Unreachable {
            address: target.address.clone(),
            reason: other.to_string(),
        },
    }
}
