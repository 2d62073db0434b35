//! Device session lifecycle on the owner: connect with the configured
//! reconnect strategy, wrap in keepalive, resolve schemas, and reconnect when
//! the session is lost.

pub mod credentials;
pub mod keepalive;
pub mod schema;

use crate::config::DeviceConfig;
use crate::device::{
    CapabilitySet, ConnectRequest, DeviceConnector, DeviceId, DeviceSession, SourceId,
};
use crate::error::{ConnectError, SessionError};
use crate::PinFuture;
use credentials::CredentialStore;
use keepalive::KeepaliveSession;
use log::{error, info, warn};
use parking_lot::Mutex;
use schema::{DirectorySchemaLibrary, SchemaLibrary, SchemaResolver, SchemaSourceCache};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receives session lifecycle transitions.
pub trait DeviceHandler: Send + Sync {
    fn on_connected(
        &self,
        session: Arc<dyn DeviceSession>,
        capabilities: CapabilitySet,
        sources: Vec<SourceId>,
    ) -> PinFuture<()>;
    fn on_disconnected(&self) -> PinFuture<()>;
    /// Terminal: reconnect attempts are exhausted or credentials are unusable.
    fn on_failed(&self, cause: String) -> PinFuture<()>;
}

#[derive(Clone)]
pub struct SessionDependencies {
    pub connector: Arc<dyn DeviceConnector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub schema_cache: Arc<SchemaSourceCache>,
}

struct Established {
    session: Arc<dyn DeviceSession>,
    capabilities: CapabilitySet,
    sources: Vec<SourceId>,
}

#[derive(Clone)]
pub struct DeviceSessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: DeviceConfig,
    device: DeviceId,
    connector: Arc<dyn DeviceConnector>,
    credentials: Arc<dyn CredentialStore>,
    resolver: SchemaResolver,
    stop: watch::Sender<bool>,
    current: Mutex<Option<Arc<dyn DeviceSession>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceSessionManager {
    pub fn new(config: DeviceConfig, deps: SessionDependencies) -> Self {
        let library = config
            .yang_library_directory
            .as_ref()
            .map(|dir| Arc::new(DirectorySchemaLibrary::new(dir)) as Arc<dyn SchemaLibrary>);
        let (stop, _) = watch::channel(false);
        Self {
            inner: Arc::new(ManagerInner {
                device: config.id(),
                config,
                connector: deps.connector,
                credentials: deps.credentials,
                resolver: SchemaResolver::new(deps.schema_cache, library),
                stop,
                current: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    pub fn resolver(&self) -> &SchemaResolver {
        &self.inner.resolver
    }

    pub fn current_session(&self) -> Option<Arc<dyn DeviceSession>> {
        self.inner.current.lock().clone()
    }

    /// Connects, notifies `handler`, and keeps the session supervised until
    /// [`stop`](Self::stop). Resolves with the negotiated capabilities.
    pub async fn connect(
        &self,
        handler: Arc<dyn DeviceHandler>,
    ) -> Result<CapabilitySet, SessionError> {
        match self.inner.establish().await {
            Ok(established) => {
                let capabilities = established.capabilities.clone();
                *self.inner.current.lock() = Some(Arc::clone(&established.session));
                info!(
                    "event=device_connected device={} capabilities={} sources={}",
                    self.inner.device,
                    capabilities.len(),
                    established.sources.len()
                );
                let session = Arc::clone(&established.session);
                handler
                    .on_connected(established.session, established.capabilities, established.sources)
                    .await;
                let supervisor = tokio::spawn(supervise(
                    Arc::clone(&self.inner),
                    Arc::clone(&handler),
                    session,
                ));
                self.inner.tasks.lock().push(supervisor);
                Ok(capabilities)
            }
            Err(SessionError::Stopped(device)) => Err(SessionError::Stopped(device)),
            Err(err) => {
                error!(
                    "event=device_connect_failed device={} error={}",
                    self.inner.device, err
                );
                handler.on_failed(err.to_string()).await;
                Err(err)
            }
        }
    }

    /// Runs [`connect`](Self::connect) in the background.
    pub fn spawn_connect(&self, handler: Arc<dyn DeviceHandler>) {
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let _ = manager.connect(handler).await;
        });
        self.inner.tasks.lock().push(task);
    }

    /// Aborts connection attempts, stops supervision, and closes the session.
    pub async fn stop(&self) {
        self.inner.stop.send_replace(true);
        loop {
            let task = self.inner.tasks.lock().pop();
            match task {
                Some(task) => {
                    let _ = task.await;
                }
                None => break,
            }
        }
        if let Some(session) = self.inner.current.lock().take() {
            session.close();
        }
        info!("event=device_session_stopped device={}", self.inner.device);
    }
}

impl ManagerInner {
    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    async fn establish(&self) -> Result<Established, SessionError> {
        let auth = credentials::resolve(
            &self.config.credentials,
            self.config.protocol,
            self.credentials.as_ref(),
        )?;
        let request = ConnectRequest {
            id: self.device.clone(),
            protocol: self.config.protocol,
            auth,
            connection_timeout: self.config.connection_timeout(),
            hello_capabilities: self.config.hello_capability_set(),
            concurrent_rpc_limit: self.config.concurrent_rpc_limit,
        };
        let mut retry = self.config.reconnect.retry_policy().handle();
        let mut stop = self.stop.subscribe();
        let mut attempt = 0usize;
        let session = loop {
            if self.stopped() {
                return Err(SessionError::Stopped(self.device.to_string()));
            }
            attempt += 1;
            let timeout = self.config.connection_timeout();
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(timeout, self.connector.connect(request.clone())) => outcome,
                _ = stop.wait_for(|stopped| *stopped) => {
                    return Err(SessionError::Stopped(self.device.to_string()));
                }
            };
            let failure = match outcome {
                Ok(Ok(session)) => break session,
                Ok(Err(err)) => err,
                Err(_) => ConnectError::Timeout(timeout),
            };
            match retry.next_delay() {
                Some(delay) => {
                    warn!(
                        "event=device_connect_retry device={} attempt={} delay_ms={} error={}",
                        self.device,
                        attempt,
                        delay.as_millis(),
                        failure
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.wait_for(|stopped| *stopped) => {
                            return Err(SessionError::Stopped(self.device.to_string()));
                        }
                    }
                }
                None => {
                    return Err(SessionError::Exhausted {
                        device: self.device.to_string(),
                        attempts: attempt,
                        last: failure.to_string(),
                    });
                }
            }
        };

        let session: Arc<dyn DeviceSession> = match self.config.keepalive_delay() {
            Some(delay) => {
                KeepaliveSession::wrap(session, delay, self.config.request_timeout())
                    as Arc<dyn DeviceSession>
            }
            None => session,
        };
        let capabilities = session.capabilities();
        let advertised = session.schema_sources();
        let sources = self.resolver.resolve_all(&session, &advertised).await;
        if self.stopped() {
            session.close();
            return Err(SessionError::Stopped(self.device.to_string()));
        }
        Ok(Established {
            session,
            capabilities,
            sources,
        })
    }
}

async fn supervise(
    inner: Arc<ManagerInner>,
    handler: Arc<dyn DeviceHandler>,
    mut session: Arc<dyn DeviceSession>,
) {
    let mut stop = inner.stop.subscribe();
    loop {
        tokio::select! {
            _ = session.closed() => {}
            _ = stop.wait_for(|stopped| *stopped) => return,
        }
        if inner.stopped() {
            return;
        }
        warn!("event=device_session_lost device={}", inner.device);
        inner.current.lock().take();
        session.close();
        handler.on_disconnected().await;
        match inner.establish().await {
            Ok(established) => {
                session = Arc::clone(&established.session);
                *inner.current.lock() = Some(Arc::clone(&session));
                info!("event=device_reconnected device={}", inner.device);
                handler
                    .on_connected(established.session, established.capabilities, established.sources)
                    .await;
            }
            Err(SessionError::Stopped(_)) => return,
            Err(err) => {
                error!(
                    "event=device_reconnect_failed device={} error={}",
                    inner.device, err
                );
                handler.on_failed(err.to_string()).await;
                return;
            }
        }
    }
}
