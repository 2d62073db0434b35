//! Read-only and read-write transaction proxies.

use super::ProxySet;
use crate::channel::wire::{Request, TxId};
use crate::device::{DataPath, Datastore};
use crate::error::{ClusterError, InvariantError, MountError};
use log::debug;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

/// At most one write-capable transaction per slot.
#[derive(Clone, Default)]
pub(crate) struct WriteSlot {
    taken: Arc<AtomicBool>,
}

impl WriteSlot {
    pub(crate) fn acquire(&self) -> Result<WritePermit, InvariantError> {
        self.taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| WritePermit {
                taken: Arc::clone(&self.taken),
            })
            .map_err(|_| InvariantError::WriteInProgress)
    }
}

pub(crate) struct WritePermit {
    taken: Arc<AtomicBool>,
}

impl Drop for WritePermit {
    fn drop(&mut self) {
        self.taken.store(false, Ordering::Release);
    }
}

/// Lifecycle shared by every write transaction flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxPhase {
    /// No edit has reached the owner yet.
    Idle,
    Open,
    Committed,
    Cancelled,
    Failed,
}

pub(crate) fn expect_bool(payload: Option<Value>) -> Result<bool, MountError> {
    match payload {
        Some(Value::Bool(flag)) => Ok(flag),
        other => Err(ClusterError::Codec(format!("expected a boolean, got {other:?}")).into()),
    }
}

pub struct ProxyReadTransaction {
    proxies: ProxySet,
    tx: TxId,
    opened: OnceCell<()>,
    closed: AtomicBool,
}

impl ProxyReadTransaction {
    pub(crate) fn new(proxies: ProxySet, tx: TxId) -> Self {
        Self {
            proxies,
            tx,
            opened: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &TxId {
        &self.tx
    }

    async fn ensure_open(&self) -> Result<(), MountError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(InvariantError::TransactionClosed(self.tx.clone()).into());
        }
        self.opened
            .get_or_try_init(|| async {
                self.proxies
                    .ask_value(Request::OpenReadTransaction {
                        tx: self.tx.clone(),
                    })
                    .await
                    .map(|_| ())
            })
            .await
            .map(|_| ())
    }

    pub async fn read(&self, store: Datastore, path: &DataPath) -> Result<Option<Value>, MountError> {
        self.ensure_open().await?;
        self.proxies
            .ask_value(Request::Read {
                tx: self.tx.clone(),
                store,
                path: path.clone(),
            })
            .await
    }

    pub async fn exists(&self, store: Datastore, path: &DataPath) -> Result<bool, MountError> {
        self.ensure_open().await?;
        let payload = self
            .proxies
            .ask_value(Request::Exists {
                tx: self.tx.clone(),
                store,
                path: path.clone(),
            })
            .await?;
        expect_bool(payload)
    }

    /// Releases the owner-side handle. Returns false if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.opened.initialized() {
            let request = Request::CloseReadTransaction {
                tx: self.tx.clone(),
            };
            if let Err(err) = self.proxies.tell(request) {
                debug!("event=read_close_failed tx={} error={}", self.tx, err);
            }
        }
        true
    }
}

impl Drop for ProxyReadTransaction {
    fn drop(&mut self) {
        self.close();
    }
}

struct WriteState {
    phase: TxPhase,
    permit: Option<WritePermit>,
}

/// Write transaction forwarded to the owner.
///
/// Edits are one-way and applied in issuance order; their outcome is reported
/// by `commit`. Commit is idempotent once it succeeded; commit after cancel is
/// an invariant error; cancel after either returns `false`.
pub struct ProxyReadWriteTransaction {
    proxies: ProxySet,
    tx: TxId,
    state: tokio::sync::Mutex<WriteState>,
}

impl ProxyReadWriteTransaction {
    pub(crate) fn new(proxies: ProxySet, tx: TxId, permit: WritePermit) -> Self {
        Self {
            proxies,
            tx,
            state: tokio::sync::Mutex::new(WriteState {
                phase: TxPhase::Idle,
                permit: Some(permit),
            }),
        }
    }

    pub fn id(&self) -> &TxId {
        &self.tx
    }

    async fn edit(&self, request: Request) -> Result<(), MountError> {
        let mut state = self.state.lock().await;
        match state.phase {
            TxPhase::Idle => {
                self.proxies.track_write(&self.tx);
                let opened = self
                    .proxies
                    .ask_value(Request::OpenWriteTransaction {
                        tx: self.tx.clone(),
                    })
                    .await;
                if let Err(err) = opened {
                    self.abandon_open(&err);
                    return Err(err);
                }
                state.phase = TxPhase::Open;
            }
            TxPhase::Open => {}
            TxPhase::Committed | TxPhase::Cancelled | TxPhase::Failed => {
                return Err(InvariantError::StaleHandle(self.tx.clone()).into());
            }
        }
        self.proxies.tell(request)
    }

    // The owner may have opened the handle even though the reply was lost.
    fn abandon_open(&self, err: &MountError) {
        if !self.proxies.untrack_write(&self.tx) || !err.is_cluster_failure() {
            return;
        }
        let request = Request::Cancel {
            tx: self.tx.clone(),
        };
        if let Err(err) = self.proxies.send(request) {
            debug!("event=write_abandon_failed tx={} error={}", self.tx, err);
        }
    }

    pub async fn put(&self, store: Datastore, path: DataPath, data: Value) -> Result<(), MountError> {
        self.edit(Request::Put {
            tx: self.tx.clone(),
            store,
            path,
            data,
        })
        .await
    }

    pub async fn merge(&self, store: Datastore, path: DataPath, data: Value) -> Result<(), MountError> {
        self.edit(Request::Merge {
            tx: self.tx.clone(),
            store,
            path,
            data,
        })
        .await
    }

    pub async fn delete(&self, store: Datastore, path: DataPath) -> Result<(), MountError> {
        self.edit(Request::Delete {
            tx: self.tx.clone(),
            store,
            path,
        })
        .await
    }

    /// Reads committed device state.
    pub async fn read(&self, store: Datastore, path: &DataPath) -> Result<Option<Value>, MountError> {
        self.proxies
            .ask_value(Request::Read {
                tx: self.tx.clone(),
                store,
                path: path.clone(),
            })
            .await
    }

    pub async fn exists(&self, store: Datastore, path: &DataPath) -> Result<bool, MountError> {
        let payload = self
            .proxies
            .ask_value(Request::Exists {
                tx: self.tx.clone(),
                store,
                path: path.clone(),
            })
            .await?;
        expect_bool(payload)
    }

    pub async fn commit(&self) -> Result<(), MountError> {
        let mut state = self.state.lock().await;
        match state.phase {
            TxPhase::Committed => return Ok(()),
            TxPhase::Cancelled | TxPhase::Failed => {
                return Err(InvariantError::TransactionClosed(self.tx.clone()).into());
            }
            TxPhase::Idle => {
                state.phase = TxPhase::Committed;
                state.permit = None;
                return Ok(());
            }
            TxPhase::Open => {}
        }
        let result = self
            .proxies
            .ask_value(Request::Submit {
                tx: self.tx.clone(),
            })
            .await
            .map(|_| ());
        self.proxies.untrack_write(&self.tx);
        state.phase = if result.is_ok() {
            TxPhase::Committed
        } else {
            TxPhase::Failed
        };
        state.permit = None;
        result
    }

    pub async fn cancel(&self) -> Result<bool, MountError> {
        let mut state = self.state.lock().await;
        match state.phase {
            TxPhase::Idle => {
                state.phase = TxPhase::Cancelled;
                state.permit = None;
                Ok(true)
            }
            TxPhase::Open => {
                state.phase = TxPhase::Cancelled;
                state.permit = None;
                self.proxies.untrack_write(&self.tx);
                let payload = self
                    .proxies
                    .ask_value(Request::Cancel {
                        tx: self.tx.clone(),
                    })
                    .await?;
                expect_bool(payload)
            }
            TxPhase::Committed | TxPhase::Cancelled | TxPhase::Failed => Ok(false),
        }
    }
}

impl Drop for ProxyReadWriteTransaction {
    fn drop(&mut self) {
        let phase = self.state.get_mut().phase;
        if phase == TxPhase::Open && self.proxies.untrack_write(&self.tx) {
            let request = Request::Cancel {
                tx: self.tx.clone(),
            };
            if let Err(err) = self.proxies.send(request) {
                debug!("event=write_abandon_failed tx={} error={}", self.tx, err);
            }
        }
    }
}
