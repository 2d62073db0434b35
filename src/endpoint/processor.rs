//! Owner-side transaction state for one device.
//!
//! Holds at most one write handle and one shared read-only handle. Write
//! handle states: `Absent -> Open -> Committing -> Absent`, or
//! `Open -> Cancelled -> Absent`. Edits are one-way; an edit that cannot be
//! applied poisons its transaction and the fault is reported by the
//! transaction's submit.

use crate::channel::wire::{EndpointFault, MountSessionInfo, Reply, Request, TxId};
use crate::device::{
    CapabilitySet, DataPath, Datastore, DeviceId, DeviceReadTransaction, DeviceSession,
    DeviceWriteTransaction, Edit, RpcError, RpcOutcome, SourceId,
};
use crate::error::{DeviceError, SchemaError};
use crate::session::schema::SchemaResolver;
use crate::PinFuture;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TERMINATED_CAPACITY: usize = 1024;

/// What the endpoint must do after handing a request to the processor.
pub enum Step {
    Reply(Reply),
    /// One-way request; nothing to send back.
    NoReply,
    /// Device call in flight; reply when it resolves.
    Deferred(PinFuture<Reply>),
    /// Commit in flight; feed the result back through `commit_finished`.
    Commit {
        tx: TxId,
        commit: PinFuture<Result<(), DeviceError>>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteState {
    Absent,
    Open,
    Committing,
    Cancelled,
}

struct OpenWrite {
    tx: TxId,
    device_tx: Box<dyn DeviceWriteTransaction>,
    last_activity: Instant,
    edit_errors: Vec<RpcError>,
}

enum WriteHandle {
    Absent,
    Open(OpenWrite),
    Committing { tx: TxId },
    Cancelled { tx: TxId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Termination {
    Committed,
    Failed,
    Cancelled,
    Expired,
    Lost,
}

pub struct TransactionProcessor {
    device: DeviceId,
    resolver: SchemaResolver,
    session: Option<Arc<dyn DeviceSession>>,
    info: MountSessionInfo,
    read_only: Option<Arc<dyn DeviceReadTransaction>>,
    readers: HashSet<TxId>,
    write: WriteHandle,
    terminated: HashMap<TxId, Termination>,
    terminated_order: VecDeque<TxId>,
    poisoned: HashMap<TxId, EndpointFault>,
}

impl TransactionProcessor {
    pub fn new(device: DeviceId, resolver: SchemaResolver) -> Self {
        Self {
            device,
            resolver,
            session: None,
            info: MountSessionInfo::default(),
            read_only: None,
            readers: HashSet::new(),
            write: WriteHandle::Absent,
            terminated: HashMap::new(),
            terminated_order: VecDeque::new(),
            poisoned: HashMap::new(),
        }
    }

    pub fn attach_session(
        &mut self,
        session: Arc<dyn DeviceSession>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    ) {
        self.read_only = Some(session.new_read_only());
        self.session = Some(session);
        self.info = MountSessionInfo {
            capabilities,
            sources,
        };
    }

    /// The device session is gone: any open write handle is lost with it.
    pub fn detach_session(&mut self) {
        self.session = None;
        self.read_only = None;
        if let Some(tx) = self.discard_open(WriteHandle::Absent, Termination::Lost) {
            warn!(
                "event=write_handle_lost device={} tx={}",
                self.device, tx
            );
            self.poisoned.insert(
                tx,
                EndpointFault::DeviceUnavailable {
                    reason: "device session lost".into(),
                },
            );
        }
    }

    pub fn session(&self) -> Option<&Arc<dyn DeviceSession>> {
        self.session.as_ref()
    }

    pub fn write_state(&self) -> WriteState {
        match self.write {
            WriteHandle::Absent => WriteState::Absent,
            WriteHandle::Open(_) => WriteState::Open,
            WriteHandle::Committing { .. } => WriteState::Committing,
            WriteHandle::Cancelled { .. } => WriteState::Cancelled,
        }
    }

    pub fn write_holder(&self) -> Option<&TxId> {
        match &self.write {
            WriteHandle::Open(open) => Some(&open.tx),
            WriteHandle::Committing { tx } | WriteHandle::Cancelled { tx } => Some(tx),
            WriteHandle::Absent => None,
        }
    }

    pub fn open_readers(&self) -> usize {
        self.readers.len()
    }

    pub fn handle(&mut self, request: Request, now: Instant) -> Step {
        match request {
            Request::OpenMountSession => match &self.session {
                Some(_) => match serde_json::to_value(&self.info) {
                    Ok(info) => Step::Reply(Reply::Success(info)),
                    Err(err) => Step::Reply(Reply::Fault(EndpointFault::DeviceUnavailable {
                        reason: err.to_string(),
                    })),
                },
                None => Step::Reply(unavailable()),
            },
            Request::OpenReadTransaction { tx } => {
                if self.session.is_none() {
                    return Step::Reply(unavailable());
                }
                self.readers.insert(tx);
                Step::Reply(Reply::Empty)
            }
            Request::CloseReadTransaction { tx } => {
                Step::Reply(Reply::Success(Value::Bool(self.readers.remove(&tx))))
            }
            Request::OpenWriteTransaction { tx } => match self.open_write(&tx, now) {
                Ok(()) => Step::Reply(Reply::Empty),
                Err(fault) => Step::Reply(Reply::Fault(fault)),
            },
            Request::Put {
                tx,
                store,
                path,
                data,
            } => self.edit(tx, Edit::put(store, path, data), now),
            Request::Merge {
                tx,
                store,
                path,
                data,
            } => self.edit(tx, Edit::merge(store, path, data), now),
            Request::Delete { tx, store, path } => self.edit(tx, Edit::delete(store, path), now),
            Request::Read { store, path, .. } => self.read(store, path),
            Request::Exists { store, path, .. } => self.exists(store, path),
            Request::Submit { tx } => self.submit(tx),
            Request::Cancel { tx } => Step::Reply(self.cancel(tx)),
            Request::InvokeRpc { name, input } => match &self.session {
                Some(session) => {
                    let call = session.invoke_rpc(&name, input);
                    Step::Deferred(Box::pin(async move { outcome_reply(call.await) }))
                }
                None => Step::Reply(unavailable()),
            },
            Request::InvokeAction { path, name, input } => match &self.session {
                Some(session) => {
                    let call = session.invoke_action(&path, &name, input);
                    Step::Deferred(Box::pin(async move { outcome_reply(call.await) }))
                }
                None => Step::Reply(unavailable()),
            },
            Request::GetSchemaSource { source } => match &self.session {
                Some(session) => {
                    let session = Arc::clone(session);
                    let resolver = self.resolver.clone();
                    Step::Deferred(Box::pin(async move {
                        match resolver.resolve(&session, &source).await {
                            Ok(text) => Reply::Success(Value::String(text)),
                            Err(SchemaError::Device(err)) => device_error_reply(err),
                            Err(err) => Reply::Error(vec![RpcError::application(
                                "missing-schema-source",
                                err.to_string(),
                            )]),
                        }
                    }))
                }
                None => Step::Reply(unavailable()),
            },
            // Subscriptions are owned by the endpoint, not the transaction state.
            Request::SubscribeNotifications { .. } | Request::UnsubscribeNotifications { .. } => {
                Step::Reply(Reply::Empty)
            }
        }
    }

    fn open_write(&mut self, tx: &TxId, now: Instant) -> Result<(), EndpointFault> {
        if let Some(fault) = self.poisoned.get(tx) {
            return Err(fault.clone());
        }
        if self.terminated.contains_key(tx) {
            return Err(EndpointFault::StaleHandle { tx: tx.clone() });
        }
        match &self.write {
            WriteHandle::Open(open) if open.tx == *tx => return Ok(()),
            WriteHandle::Committing { tx: holder } if holder == tx => {
                return Err(EndpointFault::StaleHandle { tx: tx.clone() });
            }
            WriteHandle::Open(OpenWrite { tx: holder, .. })
            | WriteHandle::Committing { tx: holder } => {
                return Err(EndpointFault::WriteInProgress {
                    holder: holder.clone(),
                });
            }
            WriteHandle::Absent | WriteHandle::Cancelled { .. } => {}
        }
        let session = self.session.as_ref().ok_or_else(unavailable_fault)?;
        self.write = WriteHandle::Open(OpenWrite {
            tx: tx.clone(),
            device_tx: session.new_write(),
            last_activity: now,
            edit_errors: Vec::new(),
        });
        debug!("event=write_handle_opened device={} tx={}", self.device, tx);
        Ok(())
    }

    fn edit(&mut self, tx: TxId, edit: Edit, now: Instant) -> Step {
        if let Err(fault) = self.open_write(&tx, now) {
            debug!(
                "event=edit_rejected device={} tx={} fault={:?}",
                self.device, tx, fault
            );
            self.poisoned.entry(tx).or_insert(fault);
            return Step::NoReply;
        }
        if let WriteHandle::Open(open) = &mut self.write {
            open.last_activity = now;
            if let Err(err) = open.device_tx.apply(edit) {
                open.edit_errors.extend(edit_failure(err));
            }
        }
        Step::NoReply
    }

    fn read(&self, store: Datastore, path: DataPath) -> Step {
        let Some(read_only) = &self.read_only else {
            return Step::Reply(unavailable());
        };
        let call = read_only.read(store, &path);
        Step::Deferred(Box::pin(async move {
            match call.await {
                Ok(Some(value)) => Reply::Success(value),
                Ok(None) => Reply::Empty,
                Err(err) => device_error_reply(err),
            }
        }))
    }

    fn exists(&self, store: Datastore, path: DataPath) -> Step {
        let Some(read_only) = &self.read_only else {
            return Step::Reply(unavailable());
        };
        let call = read_only.exists(store, &path);
        Step::Deferred(Box::pin(async move {
            match call.await {
                Ok(found) => Reply::Success(Value::Bool(found)),
                Err(err) => device_error_reply(err),
            }
        }))
    }

    fn submit(&mut self, tx: TxId) -> Step {
        if let Some(fault) = self.poisoned.remove(&tx) {
            return Step::Reply(Reply::Fault(fault));
        }
        if let Some(termination) = self.terminated.get(&tx) {
            return Step::Reply(match termination {
                Termination::Committed => Reply::Empty,
                _ => Reply::Fault(EndpointFault::StaleHandle { tx }),
            });
        }
        match std::mem::replace(&mut self.write, WriteHandle::Absent) {
            WriteHandle::Open(open) if open.tx == tx => {
                if !open.edit_errors.is_empty() {
                    let OpenWrite {
                        device_tx,
                        edit_errors,
                        ..
                    } = open;
                    device_tx.cancel();
                    self.terminate(tx, Termination::Failed);
                    return Step::Reply(Reply::Error(edit_errors));
                }
                self.write = WriteHandle::Committing { tx: tx.clone() };
                info!("event=write_commit_started device={} tx={}", self.device, tx);
                Step::Commit {
                    tx,
                    commit: open.device_tx.commit(),
                }
            }
            other => {
                let reply = match &other {
                    WriteHandle::Open(OpenWrite { tx: holder, .. }) => {
                        Reply::Fault(EndpointFault::WriteInProgress {
                            holder: holder.clone(),
                        })
                    }
                    WriteHandle::Committing { tx: holder } if *holder == tx => {
                        Reply::Fault(EndpointFault::StaleHandle { tx: tx.clone() })
                    }
                    WriteHandle::Committing { tx: holder } => {
                        Reply::Fault(EndpointFault::WriteInProgress {
                            holder: holder.clone(),
                        })
                    }
                    WriteHandle::Absent | WriteHandle::Cancelled { .. } => {
                        // Nothing was written; submitting is trivially successful.
                        self.terminate(tx.clone(), Termination::Committed);
                        Reply::Empty
                    }
                };
                self.write = other;
                Step::Reply(reply)
            }
        }
    }

    pub fn commit_finished(&mut self, tx: TxId, result: Result<(), DeviceError>) -> Reply {
        match &self.write {
            WriteHandle::Committing { tx: holder } if *holder == tx => {
                self.write = WriteHandle::Absent;
            }
            _ => debug!(
                "event=commit_finished_after_reset device={} tx={}",
                self.device, tx
            ),
        }
        match result {
            Ok(()) => {
                info!("event=write_committed device={} tx={}", self.device, tx);
                self.terminate(tx, Termination::Committed);
                Reply::Empty
            }
            Err(err) => {
                warn!(
                    "event=write_commit_failed device={} tx={} error={}",
                    self.device, tx, err
                );
                self.terminate(tx, Termination::Failed);
                device_error_reply(err)
            }
        }
    }

    fn cancel(&mut self, tx: TxId) -> Reply {
        self.poisoned.remove(&tx);
        let holds_open = matches!(&self.write, WriteHandle::Open(open) if open.tx == tx);
        if !holds_open {
            return Reply::Success(Value::Bool(false));
        }
        let cancelled = WriteHandle::Cancelled { tx: tx.clone() };
        self.discard_open(cancelled, Termination::Cancelled);
        debug!("event=write_cancelled device={} tx={}", self.device, tx);
        Reply::Success(Value::Bool(true))
    }

    /// Cancels the open write handle if it has been idle for `idle`.
    pub fn expire_idle(&mut self, now: Instant, idle: Duration) -> Option<TxId> {
        let tx = match &self.write {
            WriteHandle::Open(open) if now.saturating_duration_since(open.last_activity) >= idle => {
                open.tx.clone()
            }
            _ => return None,
        };
        self.discard_open(WriteHandle::Cancelled { tx: tx.clone() }, Termination::Expired);
        warn!(
            "event=write_handle_expired device={} tx={} idle_ms={}",
            self.device,
            tx,
            idle.as_millis()
        );
        Some(tx)
    }

    /// Cancels any open write handle. Returns the transaction it belonged to.
    pub fn shutdown(&mut self) -> Option<TxId> {
        self.read_only = None;
        self.readers.clear();
        let tx = match &self.write {
            WriteHandle::Open(open) => open.tx.clone(),
            _ => return None,
        };
        self.discard_open(WriteHandle::Cancelled { tx: tx.clone() }, Termination::Cancelled);
        Some(tx)
    }

    fn discard_open(&mut self, next: WriteHandle, termination: Termination) -> Option<TxId> {
        if !matches!(self.write, WriteHandle::Open(_)) {
            return None;
        }
        match std::mem::replace(&mut self.write, next) {
            WriteHandle::Open(open) => {
                open.device_tx.cancel();
                self.terminate(open.tx.clone(), termination);
                Some(open.tx)
            }
            _ => None,
        }
    }

    fn terminate(&mut self, tx: TxId, termination: Termination) {
        if self.terminated.insert(tx.clone(), termination).is_none() {
            self.terminated_order.push_back(tx);
            if self.terminated_order.len() > TERMINATED_CAPACITY {
                if let Some(oldest) = self.terminated_order.pop_front() {
                    self.terminated.remove(&oldest);
                }
            }
        }
    }
}

fn unavailable_fault() -> EndpointFault {
    EndpointFault::DeviceUnavailable {
        reason: "device session is not connected".into(),
    }
}

fn unavailable() -> Reply {
    Reply::Fault(unavailable_fault())
}

fn edit_failure(err: DeviceError) -> Vec<RpcError> {
    match err {
        DeviceError::Rejected(errors) => errors,
        other => vec![RpcError::application("operation-failed", other.to_string())],
    }
}

/// Device-reported errors pass through verbatim; anything else is a fault.
pub fn device_error_reply(err: DeviceError) -> Reply {
    match err {
        DeviceError::Rejected(errors) => Reply::Error(errors),
        other => Reply::Fault(EndpointFault::DeviceUnavailable {
            reason: other.to_string(),
        }),
    }
}

fn outcome_reply(result: Result<RpcOutcome, DeviceError>) -> Reply {
    match result {
        Ok(outcome) if !outcome.is_success() => Reply::Error(outcome.errors),
        Ok(RpcOutcome {
            output: Some(output),
            ..
        }) => Reply::Success(output),
        Ok(_) => Reply::Empty,
        Err(err) => device_error_reply(err),
    }
}
