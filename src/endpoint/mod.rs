//! Remote operation endpoint: the owner's single worker for one device.
//!
//! Requests are taken off one queue and applied to the transaction processor
//! strictly in arrival order. Device calls run as spawned tasks so the worker
//! never waits on device I/O; commit completions come back through the same
//! queue. The owner's own mount point enqueues through the same queue with a
//! local reply channel, so the processor holds the only device write handle.

pub mod processor;

use crate::channel::fabric::Transport;
use crate::channel::wire::{
    EndpointRef, Frame, NotificationFrame, Reply, ReplyFrame, Request, RequestId, TxId,
};
use crate::device::{CapabilitySet, DeviceId, DeviceSession, SourceId};
use crate::error::DeviceError;
use crate::session::schema::SchemaResolver;
use crate::timeouts::{with_timeout, ENDPOINT_SHUTDOWN_GRACE, MAX_IDLE_SWEEP_INTERVAL};
use log::{debug, info, warn};
use parking_lot::Mutex;
use processor::{Step, TransactionProcessor};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const MIN_IDLE_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

enum ReplyTo {
    Remote { origin: String, id: RequestId },
    Local(oneshot::Sender<Reply>),
}

enum EndpointMessage {
    Request {
        origin: String,
        reply_to: Option<ReplyTo>,
        request: Request,
    },
    SessionUp {
        session: Arc<dyn DeviceSession>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    },
    SessionDown,
    CommitFinished {
        tx: TxId,
        result: Result<(), DeviceError>,
        reply_to: Option<ReplyTo>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running endpoint.
#[derive(Clone)]
pub struct EndpointHandle {
    reference: EndpointRef,
    queue: mpsc::UnboundedSender<EndpointMessage>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EndpointHandle {
    pub fn reference(&self) -> &EndpointRef {
        &self.reference
    }

    /// Queues a request. Returns false once the endpoint has stopped.
    pub fn enqueue(&self, origin: String, id: Option<RequestId>, request: Request) -> bool {
        let reply_to = id.map(|id| ReplyTo::Remote {
            origin: origin.clone(),
            id,
        });
        self.queue
            .send(EndpointMessage::Request {
                origin,
                reply_to,
                request,
            })
            .is_ok()
    }

    /// Queues a request from this node. The receiver fails if the endpoint
    /// stops before replying.
    pub fn ask_local(&self, request: Request) -> oneshot::Receiver<Reply> {
        let (reply, receiver) = oneshot::channel();
        let _ = self.queue.send(EndpointMessage::Request {
            origin: self.reference.address.clone(),
            reply_to: Some(ReplyTo::Local(reply)),
            request,
        });
        receiver
    }

    /// One-way request from this node. Returns false once the endpoint has stopped.
    pub fn tell_local(&self, request: Request) -> bool {
        self.queue
            .send(EndpointMessage::Request {
                origin: self.reference.address.clone(),
                reply_to: None,
                request,
            })
            .is_ok()
    }

    pub fn session_up(
        &self,
        session: Arc<dyn DeviceSession>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    ) {
        let _ = self.queue.send(EndpointMessage::SessionUp {
            session,
            capabilities,
            sources,
        });
    }

    pub fn session_down(&self) {
        let _ = self.queue.send(EndpointMessage::SessionDown);
    }

    pub fn is_running(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Cancels the open write handle and stops the worker.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.queue.send(EndpointMessage::Shutdown(ack)).is_ok()
            && with_timeout(&self.reference, ENDPOINT_SHUTDOWN_GRACE, done).await.is_err()
        {
            warn!(
                "event=endpoint_shutdown_timeout endpoint={}",
                self.reference
            );
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

pub struct RemoteOperationEndpoint {
    reference: EndpointRef,
    transport: Arc<dyn Transport>,
    processor: TransactionProcessor,
    subscribers: Arc<Mutex<BTreeSet<String>>>,
    forwarder: Option<JoinHandle<()>>,
    idle_timeout: Option<Duration>,
    queue: mpsc::UnboundedReceiver<EndpointMessage>,
    feedback: mpsc::WeakUnboundedSender<EndpointMessage>,
}

impl RemoteOperationEndpoint {
    pub fn spawn(
        reference: EndpointRef,
        transport: Arc<dyn Transport>,
        resolver: SchemaResolver,
        idle_timeout: Option<Duration>,
    ) -> EndpointHandle {
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let endpoint = Self {
            processor: TransactionProcessor::new(reference.device.clone(), resolver),
            reference: reference.clone(),
            transport,
            subscribers: Arc::new(Mutex::new(BTreeSet::new())),
            forwarder: None,
            idle_timeout,
            queue,
            feedback: queue_tx.downgrade(),
        };
        info!("event=endpoint_started endpoint={}", reference);
        let task = tokio::spawn(endpoint.run());
        EndpointHandle {
            reference,
            queue: queue_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self) {
        let sweep = self
            .idle_timeout
            .map(|idle| (idle / 4).clamp(MIN_IDLE_SWEEP_INTERVAL, MAX_IDLE_SWEEP_INTERVAL))
            .unwrap_or(MAX_IDLE_SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval(sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = self.queue.recv() => match message {
                    Some(EndpointMessage::Shutdown(ack)) => {
                        self.stop();
                        let _ = ack.send(());
                        break;
                    }
                    Some(message) => self.on_message(message),
                    None => {
                        self.stop();
                        break;
                    }
                },
                _ = ticker.tick(), if self.idle_timeout.is_some() => self.sweep_idle(),
            }
        }
        info!("event=endpoint_stopped endpoint={}", self.reference);
    }

    fn on_message(&mut self, message: EndpointMessage) {
        match message {
            EndpointMessage::Request {
                origin,
                reply_to,
                request,
            } => self.on_request(origin, reply_to, request),
            EndpointMessage::SessionUp {
                session,
                capabilities,
                sources,
            } => {
                self.start_forwarder(session.notifications());
                self.processor.attach_session(session, capabilities, sources);
                info!("event=endpoint_session_up endpoint={}", self.reference);
            }
            EndpointMessage::SessionDown => {
                self.stop_forwarder();
                self.processor.detach_session();
                info!("event=endpoint_session_down endpoint={}", self.reference);
            }
            EndpointMessage::CommitFinished {
                tx,
                result,
                reply_to,
            } => {
                let reply = self.processor.commit_finished(tx, result);
                self.reply(reply_to, reply);
            }
            EndpointMessage::Shutdown(ack) => {
                self.stop();
                let _ = ack.send(());
            }
        }
    }

    fn on_request(&mut self, origin: String, reply_to: Option<ReplyTo>, request: Request) {
        debug!(
            "event=endpoint_request endpoint={} origin={} kind={}",
            self.reference,
            origin,
            request.kind()
        );
        match request {
            Request::SubscribeNotifications { subscriber } => {
                self.subscribers.lock().insert(subscriber);
                self.reply(reply_to, Reply::Empty);
            }
            Request::UnsubscribeNotifications { subscriber } => {
                self.subscribers.lock().remove(&subscriber);
                self.reply(reply_to, Reply::Empty);
            }
            request => match self.processor.handle(request, Instant::now()) {
                Step::Reply(reply) => self.reply(reply_to, reply),
                Step::NoReply => self.reply(reply_to, Reply::Empty),
                Step::Deferred(call) => {
                    let transport = Arc::clone(&self.transport);
                    let device = self.reference.device.clone();
                    tokio::spawn(async move {
                        let reply = call.await;
                        send_reply(transport.as_ref(), &device, reply_to, reply);
                    });
                }
                Step::Commit { tx, commit } => {
                    let feedback = self.feedback.clone();
                    tokio::spawn(async move {
                        let result = commit.await;
                        if let Some(queue) = feedback.upgrade() {
                            let _ = queue.send(EndpointMessage::CommitFinished {
                                tx,
                                result,
                                reply_to,
                            });
                        }
                    });
                }
            },
        }
    }

    fn reply(&self, reply_to: Option<ReplyTo>, reply: Reply) {
        send_reply(
            self.transport.as_ref(),
            &self.reference.device,
            reply_to,
            reply,
        );
    }

    fn sweep_idle(&mut self) {
        if let Some(idle) = self.idle_timeout {
            self.processor.expire_idle(Instant::now(), idle);
        }
    }

    fn start_forwarder(&mut self, mut notifications: broadcast::Receiver<crate::device::Notification>) {
        self.stop_forwarder();
        let transport = Arc::clone(&self.transport);
        let subscribers = Arc::clone(&self.subscribers);
        let device = self.reference.device.clone();
        self.forwarder = Some(tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(notification) => {
                        let targets: Vec<String> = subscribers.lock().iter().cloned().collect();
                        for target in targets {
                            let frame = Frame::Notification(NotificationFrame {
                                device: device.clone(),
                                notification: notification.clone(),
                            });
                            if let Err(err) = transport.send(&target, frame) {
                                debug!(
                                    "event=notification_forward_failed device={} subscriber={} error={}",
                                    device, target, err
                                );
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "event=notification_lagged device={} skipped={}",
                            device, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }

    fn stop(&mut self) {
        self.stop_forwarder();
        self.subscribers.lock().clear();
        if let Some(tx) = self.processor.shutdown() {
            info!(
                "event=endpoint_cancelled_write endpoint={} tx={}",
                self.reference, tx
            );
        }
    }
}

fn send_reply(
    transport: &dyn Transport,
    device: &DeviceId,
    reply_to: Option<ReplyTo>,
    reply: Reply,
) {
    let (origin, id) = match reply_to {
        None => return,
        Some(ReplyTo::Local(sender)) => {
            let _ = sender.send(reply);
            return;
        }
        Some(ReplyTo::Remote { origin, id }) => (origin, id),
    };
    let frame = Frame::Reply(ReplyFrame {
        id,
        device: device.clone(),
        reply,
    });
    if let Err(err) = transport.send(&origin, frame) {
        debug!(
            "event=reply_undeliverable device={} origin={} error={}",
            device, origin, err
        );
    }
}
