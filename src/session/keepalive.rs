//! Keepalive decorator: probes an idle session and reports it lost when a
//! probe does not complete within the request timeout.

use crate::device::{
    CapabilitySet, DataPath, DeviceId, DeviceReadTransaction, DeviceSession,
    DeviceWriteTransaction, Notification, RpcOutcome, SourceId,
};
use crate::error::DeviceError;
use crate::PinFuture;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub struct KeepaliveSession {
    inner: Arc<dyn DeviceSession>,
    last_activity: Arc<Mutex<Instant>>,
    lost: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeepaliveSession {
    pub fn wrap(
        inner: Arc<dyn DeviceSession>,
        delay: Duration,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let (lost_tx, lost) = watch::channel(false);
        let task = tokio::spawn(run_probes(
            Arc::clone(&inner),
            Arc::clone(&last_activity),
            lost_tx,
            delay,
            request_timeout,
        ));
        Arc::new(Self {
            inner,
            last_activity,
            lost,
            task: Mutex::new(Some(task)),
        })
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

async fn run_probes(
    session: Arc<dyn DeviceSession>,
    last_activity: Arc<Mutex<Instant>>,
    lost: watch::Sender<bool>,
    delay: Duration,
    request_timeout: Duration,
) {
    let device = session.device().clone();
    loop {
        let due = *last_activity.lock() + delay;
        tokio::select! {
            _ = tokio::time::sleep_until(due.into()) => {}
            _ = session.closed() => {
                debug!("event=keepalive_session_closed device={}", device);
                let _ = lost.send(true);
                return;
            }
        }
        if last_activity.lock().elapsed() < delay {
            continue;
        }
        match tokio::time::timeout(request_timeout, session.probe()).await {
            Ok(Ok(())) => {
                *last_activity.lock() = Instant::now();
            }
            Ok(Err(err)) => {
                warn!("event=keepalive_failed device={} error={}", device, err);
                let _ = lost.send(true);
                return;
            }
            Err(_) => {
                warn!(
                    "event=keepalive_timeout device={} timeout_ms={}",
                    device,
                    request_timeout.as_millis()
                );
                let _ = lost.send(true);
                return;
            }
        }
    }
}

impl DeviceSession for KeepaliveSession {
    fn device(&self) -> &DeviceId {
        self.inner.device()
    }

    fn capabilities(&self) -> CapabilitySet {
        self.inner.capabilities()
    }

    fn schema_sources(&self) -> Vec<SourceId> {
        self.inner.schema_sources()
    }

    fn new_read_only(&self) -> Arc<dyn DeviceReadTransaction> {
        self.touch();
        self.inner.new_read_only()
    }

    fn new_write(&self) -> Box<dyn DeviceWriteTransaction> {
        self.touch();
        self.inner.new_write()
    }

    fn invoke_rpc(
        &self,
        name: &str,
        input: Option<Value>,
    ) -> PinFuture<Result<RpcOutcome, DeviceError>> {
        self.touch();
        self.inner.invoke_rpc(name, input)
    }

    fn invoke_action(
        &self,
        path: &DataPath,
        name: &str,
        input: Option<Value>,
    ) -> PinFuture<Result<RpcOutcome, DeviceError>> {
        self.touch();
        self.inner.invoke_action(path, name, input)
    }

    fn schema_source(&self, id: &SourceId) -> PinFuture<Result<String, DeviceError>> {
        self.touch();
        self.inner.schema_source(id)
    }

    fn probe(&self) -> PinFuture<Result<(), DeviceError>> {
        self.inner.probe()
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications()
    }

    fn closed(&self) -> PinFuture<()> {
        let mut lost = self.lost.clone();
        Box::pin(async move {
            // A dropped sender also means the prober has stopped.
            let _ = lost.wait_for(|lost| *lost).await;
        })
    }

    fn close(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.close();
    }
}

impl Drop for KeepaliveSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
