//! Follower-side watcher of a device's connection status record.
//!
//! Each status change is classified and acted on: a connected record naming
//! another node rebuilds the proxy set and follower mount (discarding the
//! previous one first), anything else tears the mount down. A record for the
//! owner endpoint already in use is a no-op.

use super::MountFacade;
use crate::channel::wire::EndpointRef;
use crate::device::{DeviceId, SourceId};
use crate::error::MountError;
use crate::node::NodeRuntime;
use crate::proxy::ProxySet;
use crate::status::{ConnectionStatusRecord, StatusEvent};
use crate::timeouts::{REBUILD_RETRY_DELAY, SCHEMA_PREFETCH_ATTEMPTS};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// A new owner endpoint: proxies and mount rebuilt.
    Connected,
    /// Same owner endpoint, record details changed.
    StatusChanged,
    /// The device became unusable; the mount was torn down.
    Disconnected,
    Ignored,
}

#[derive(Default)]
struct FollowerState {
    current: Option<ProxySet>,
    last: Option<ConnectionStatusRecord>,
    rebuilds: usize,
}

struct ManagerShared {
    device: DeviceId,
    ask_timeout: Duration,
    runtime: Arc<NodeRuntime>,
    facade: MountFacade,
    state: Mutex<FollowerState>,
}

pub struct NodeManager {
    shared: Arc<ManagerShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(
        device: DeviceId,
        ask_timeout: Duration,
        runtime: Arc<NodeRuntime>,
        facade: MountFacade,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                device,
                ask_timeout,
                runtime,
                facade,
                state: Mutex::new(FollowerState::default()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.shared.device
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Watches the status store until [`stop`](Self::stop).
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
            return;
        }
        // Subscribe before reading the snapshot so no change falls in between.
        let events = self.shared.runtime.status.subscribe();
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move { shared.run(events).await }));
        debug!("event=node_manager_started device={}", self.shared.device);
    }

    /// Stops watching and tears down the follower mount. Idempotent.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.shared.teardown();
        self.shared.state.lock().last = None;
    }

    pub async fn apply(&self, event: StatusEvent) -> Transition {
        self.shared.apply(event).await
    }

    pub fn rebuild_count(&self) -> usize {
        self.shared.state.lock().rebuilds
    }

    pub fn current_owner(&self) -> Option<EndpointRef> {
        self.shared
            .state
            .lock()
            .current
            .as_ref()
            .map(|proxies| proxies.endpoint().clone())
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl ManagerShared {
    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<StatusEvent>) {
        self.resync().await;
        loop {
            let retry = self.needs_retry();
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.device() == &self.device => {
                        self.apply(event).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            "event=status_events_lagged device={} skipped={}",
                            self.device, skipped
                        );
                        self.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep(REBUILD_RETRY_DELAY), if retry => {
                    self.resync().await;
                }
            }
        }
    }

    async fn resync(&self) {
        let event = match self.runtime.status.get(&self.device) {
            Some(record) => StatusEvent::Updated(record),
            None => StatusEvent::Removed(self.device.clone()),
        };
        self.apply(event).await;
    }

    /// Usable owner elsewhere, but no mount yet: the last rebuild failed.
    fn needs_retry(&self) -> bool {
        let state = self.state.lock();
        state.current.is_none()
            && state
                .last
                .as_ref()
                .and_then(|record| self.foreign_endpoint(record))
                .is_some()
    }

    fn foreign_endpoint(&self, record: &ConnectionStatusRecord) -> Option<EndpointRef> {
        record
            .endpoint()
            .filter(|endpoint| endpoint.address != self.runtime.address)
    }

    async fn apply(&self, event: StatusEvent) -> Transition {
        let record = match event {
            StatusEvent::Updated(record) => Some(record),
            StatusEvent::Removed(_) => None,
        };
        let endpoint = record.as_ref().and_then(|record| self.foreign_endpoint(record));
        let (previous, current) = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut state.last, record.clone());
            let current = state.current.as_ref().map(|proxies| proxies.endpoint().clone());
            (previous, current)
        };
        match endpoint {
            Some(endpoint) if current.as_ref() == Some(&endpoint) => {
                if previous == record {
                    Transition::Ignored
                } else {
                    debug!(
                        "event=status_changed device={} owner={}",
                        self.device, endpoint
                    );
                    Transition::StatusChanged
                }
            }
            Some(endpoint) => match self.rebuild(endpoint.clone()).await {
                Ok(()) => Transition::Connected,
                Err(err) => {
                    warn!(
                        "event=follower_rebuild_failed device={} owner={} error={}",
                        self.device, endpoint, err
                    );
                    Transition::Disconnected
                }
            },
            None => {
                if self.teardown() {
                    info!(
                        "event=follower_disconnected device={} cause={}",
                        self.device,
                        record
                            .as_ref()
                            .and_then(|record| record.failure_cause.as_deref())
                            .unwrap_or("owner not connected")
                    );
                    Transition::Disconnected
                } else {
                    Transition::Ignored
                }
            }
        }
    }

    async fn rebuild(&self, endpoint: EndpointRef) -> Result<(), MountError> {
        self.teardown();
        self.state.lock().rebuilds += 1;
        info!(
            "event=follower_rebuild device={} owner={}",
            self.device, endpoint
        );
        let proxies = ProxySet::new(
            endpoint,
            Arc::clone(&self.runtime.channel),
            self.ask_timeout,
            Arc::clone(&self.runtime.schema_cache),
        );
        match self.register(&proxies).await {
            Ok(()) => {
                self.state.lock().current = Some(proxies);
                Ok(())
            }
            Err(err) => {
                proxies.close();
                Err(err)
            }
        }
    }

    async fn register(&self, proxies: &ProxySet) -> Result<(), MountError> {
        let info = proxies.open_mount_session().await?;
        self.prefetch(proxies, &info.sources).await;
        let notifications = self.runtime.notifications.sender(&self.device);
        proxies
            .subscribe_notifications(&self.runtime.address)
            .await?;
        self.facade.register_follower(
            proxies.clone(),
            notifications,
            info.capabilities,
            info.sources,
        );
        Ok(())
    }

    async fn prefetch(&self, proxies: &ProxySet, sources: &[SourceId]) {
        let provider = proxies.schema_sources();
        for source in sources {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match provider.get(source).await {
                    Ok(_) => break,
                    Err(err) if err.is_timeout() && attempt < SCHEMA_PREFETCH_ATTEMPTS => {
                        debug!(
                            "event=schema_prefetch_retry device={} source={} attempt={}",
                            self.device, source, attempt
                        );
                    }
                    Err(err) => {
                        warn!(
                            "event=schema_prefetch_failed device={} source={} error={}",
                            self.device, source, err
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Returns whether anything was torn down.
    fn teardown(&self) -> bool {
        let current = self.state.lock().current.take();
        let had_proxies = current.is_some();
        if let Some(proxies) = current {
            proxies.unsubscribe_notifications(&self.runtime.address);
            proxies.close();
        }
        let had_mount = self.facade.unregister();
        had_proxies || had_mount
    }
}
