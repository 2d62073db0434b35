//! In-memory simulated device and connector.
//!
//! Each device keeps one JSON tree per datastore. Write transactions buffer
//! edits and apply them atomically at commit, so errors such as deleting a
//! missing node only surface then.

use crate::device::{
    AuthMethod, CapabilitySet, ConnectRequest, DataPath, Datastore, DeviceConnector, DeviceId,
    DeviceReadTransaction, DeviceSession, DeviceWriteTransaction, Edit, EditOperation,
    Notification, RpcError, RpcOutcome, SourceId,
};
use crate::error::{ConnectError, DeviceError};
use crate::PinFuture;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};

const NOTIFICATION_CAPACITY: usize = 64;

pub type RpcHandler = Arc<dyn Fn(Option<Value>) -> RpcOutcome + Send + Sync>;

#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<SimState>,
}

struct SimState {
    id: DeviceId,
    stores: Mutex<HashMap<Datastore, Value>>,
    capabilities: RwLock<CapabilitySet>,
    sources: RwLock<BTreeMap<SourceId, String>>,
    rpcs: RwLock<HashMap<String, RpcHandler>>,
    login: RwLock<Option<(String, String)>>,
    notifications: broadcast::Sender<Notification>,
    reachable: AtomicBool,
    stall_probes: AtomicBool,
    sessions: Mutex<Vec<Weak<SimSession>>>,
    connects: AtomicUsize,
    schema_fetches: AtomicUsize,
    commits: AtomicUsize,
}

impl SimulatedDevice {
    pub fn new(id: DeviceId) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let capabilities = [
            "urn:ietf:params:netconf:base:1.0",
            "urn:ietf:params:netconf:base:1.1",
            "urn:ietf:params:netconf:capability:candidate:1.0",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        let mut sources = BTreeMap::new();
        sources.insert(
            SourceId::new("ietf-interfaces", Some("2018-02-20")),
            "module ietf-interfaces { namespace \"urn:ietf:params:xml:ns:yang:ietf-interfaces\"; }"
                .to_string(),
        );
        let mut rpcs: HashMap<String, RpcHandler> = HashMap::new();
        rpcs.insert(
            "echo".to_string(),
            Arc::new(|input: Option<Value>| RpcOutcome::success(input)),
        );
        Self {
            state: Arc::new(SimState {
                id,
                stores: Mutex::new(HashMap::new()),
                capabilities: RwLock::new(capabilities),
                sources: RwLock::new(sources),
                rpcs: RwLock::new(rpcs),
                login: RwLock::new(None),
                notifications,
                reachable: AtomicBool::new(true),
                stall_probes: AtomicBool::new(false),
                sessions: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                schema_fetches: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.state.id
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.state.capabilities.read().clone()
    }

    pub fn add_capability(&self, capability: impl Into<String>) {
        self.state.capabilities.write().insert(capability.into());
    }

    pub fn add_source(&self, id: SourceId, text: impl Into<String>) {
        self.state.sources.write().insert(id, text.into());
    }

    pub fn add_rpc(&self, name: impl Into<String>, handler: RpcHandler) {
        self.state.rpcs.write().insert(name.into(), handler);
    }

    /// Only password logins with these values are accepted afterwards.
    pub fn require_login(&self, username: impl Into<String>, password: impl Into<String>) {
        *self.state.login.write() = Some((username.into(), password.into()));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Stalled probes never complete, which keepalive treats as a dead session.
    pub fn stall_probes(&self, stall: bool) {
        self.state.stall_probes.store(stall, Ordering::SeqCst);
    }

    /// Terminates every live session as if the transport dropped.
    pub fn drop_sessions(&self) {
        let sessions: Vec<_> = self.state.sessions.lock().drain(..).collect();
        for session in sessions.iter().filter_map(Weak::upgrade) {
            session.close();
        }
        info!("event=sim_sessions_dropped device={}", self.state.id);
    }

    pub fn emit_notification(&self, stream: impl Into<String>, body: Value) {
        let event_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        let _ = self.state.notifications.send(Notification {
            stream: stream.into(),
            event_time_ms,
            body,
        });
    }

    /// Opens a session directly, bypassing any connector.
    pub fn open_session(&self) -> Arc<dyn DeviceSession> {
        self.state.open_session(None)
    }

    /// Committed state, read without a session.
    pub fn read(&self, store: Datastore, path: &DataPath) -> Option<Value> {
        let stores = self.state.stores.lock();
        stores
            .get(&store)
            .and_then(|root| lookup(root, path))
            .cloned()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn schema_fetch_count(&self) -> usize {
        self.state.schema_fetches.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.state
            .sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|session| !session.is_closed())
            .count()
    }
}

impl SimState {
    fn open_session(self: &Arc<Self>, hello: Option<CapabilitySet>) -> Arc<dyn DeviceSession> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (closed, _) = watch::channel(false);
        let session = Arc::new(SimSession {
            state: Arc::clone(self),
            capabilities: hello.unwrap_or_else(|| self.capabilities.read().clone()),
            closed,
        });
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        session
    }

    fn authorize(&self, auth: &AuthMethod) -> Result<(), ConnectError> {
        let login = self.login.read();
        let Some((username, password)) = login.as_ref() else {
            return Ok(());
        };
        match auth {
            AuthMethod::Password {
                username: offered_user,
                password: offered_password,
            } if offered_user == username && offered_password == password => Ok(()),
            other => Err(ConnectError::Authentication(format!(
                "{} as {}",
                self.id,
                other.username().unwrap_or("<certificate>")
            ))),
        }
    }
}

pub struct SimSession {
    state: Arc<SimState>,
    capabilities: CapabilitySet,
    closed: watch::Sender<bool>,
}

impl SimSession {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn guard(&self) -> Result<(), DeviceError> {
        if self.is_closed() {
            Err(DeviceError::SessionDown)
        } else {
            Ok(())
        }
    }
}

impl DeviceSession for SimSession {
    fn device(&self) -> &DeviceId {
        &self.state.id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    fn schema_sources(&self) -> Vec<SourceId> {
        self.state.sources.read().keys().cloned().collect()
    }

    fn new_read_only(&self) -> Arc<dyn DeviceReadTransaction> {
        Arc::new(SimReader {
            state: Arc::clone(&self.state),
            closed: self.closed.subscribe(),
        })
    }

    fn new_write(&self) -> Box<dyn DeviceWriteTransaction> {
        Box::new(SimWriter {
            state: Arc::clone(&self.state),
            closed: self.closed.subscribe(),
            edits: Vec::new(),
        })
    }

    fn invoke_rpc(
        &self,
        name: &str,
        input: Option<Value>,
    ) -> PinFuture<Result<RpcOutcome, DeviceError>> {
        let result = self.guard().map(|()| {
            let handler = self.state.rpcs.read().get(name).cloned();
            match handler {
                Some(handler) => handler(input),
                None => RpcOutcome::failed(vec![RpcError::protocol(
                    "operation-not-supported",
                    format!("rpc {name} is not supported"),
                )]),
            }
        });
        Box::pin(async move { result })
    }

    fn invoke_action(
        &self,
        path: &DataPath,
        name: &str,
        input: Option<Value>,
    ) -> PinFuture<Result<RpcOutcome, DeviceError>> {
        let result = self.guard().map(|()| {
            RpcOutcome::success(Some(json!({
                "path": path.to_string(),
                "action": name,
                "input": input,
            })))
        });
        Box::pin(async move { result })
    }

    fn schema_source(&self, id: &SourceId) -> PinFuture<Result<String, DeviceError>> {
        let result = self.guard().and_then(|()| {
            self.state.schema_fetches.fetch_add(1, Ordering::SeqCst);
            self.state.sources.read().get(id).cloned().ok_or_else(|| {
                DeviceError::Rejected(vec![RpcError::application(
                    "data-missing",
                    format!("schema {id} is not available"),
                )])
            })
        });
        Box::pin(async move { result })
    }

    fn probe(&self) -> PinFuture<Result<(), DeviceError>> {
        if self.state.stall_probes.load(Ordering::SeqCst) {
            return Box::pin(std::future::pending());
        }
        let result = self.guard();
        Box::pin(async move { result })
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.state.notifications.subscribe()
    }

    fn closed(&self) -> PinFuture<()> {
        let mut closed = self.closed.subscribe();
        Box::pin(async move {
            let _ = closed.wait_for(|closed| *closed).await;
        })
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("event=sim_session_closed device={}", self.state.id);
        }
    }
}

struct SimReader {
    state: Arc<SimState>,
    closed: watch::Receiver<bool>,
}

impl SimReader {
    fn lookup(&self, store: Datastore, path: &DataPath) -> Result<Option<Value>, DeviceError> {
        if *self.closed.borrow() {
            return Err(DeviceError::SessionDown);
        }
        let stores = self.state.stores.lock();
        Ok(stores
            .get(&store)
            .and_then(|root| lookup(root, path))
            .cloned())
    }
}

impl DeviceReadTransaction for SimReader {
    fn read(&self, store: Datastore, path: &DataPath) -> PinFuture<Result<Option<Value>, DeviceError>> {
        let result = self.lookup(store, path);
        Box::pin(async move { result })
    }

    fn exists(&self, store: Datastore, path: &DataPath) -> PinFuture<Result<bool, DeviceError>> {
        let result = self.lookup(store, path).map(|value| value.is_some());
        Box::pin(async move { result })
    }
}

struct SimWriter {
    state: Arc<SimState>,
    closed: watch::Receiver<bool>,
    edits: Vec<Edit>,
}

impl DeviceWriteTransaction for SimWriter {
    fn apply(&mut self, edit: Edit) -> Result<(), DeviceError> {
        if *self.closed.borrow() {
            return Err(DeviceError::SessionDown);
        }
        if edit.operation != EditOperation::Delete && edit.data.is_none() {
            return Err(DeviceError::Rejected(vec![RpcError::protocol(
                "missing-element",
                format!("{:?} at {} carries no data", edit.operation, edit.path),
            )]));
        }
        self.edits.push(edit);
        Ok(())
    }

    fn commit(self: Box<Self>) -> PinFuture<Result<(), DeviceError>> {
        let result = if *self.closed.borrow() {
            Err(DeviceError::SessionDown)
        } else {
            let mut stores = self.state.stores.lock();
            let mut staged = stores.clone();
            let applied = self
                .edits
                .into_iter()
                .try_for_each(|edit| apply_edit(&mut staged, edit));
            match applied {
                Ok(()) => {
                    *stores = staged;
                    self.state.commits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                Err(err) => Err(DeviceError::Rejected(vec![err])),
            }
        };
        Box::pin(async move { result })
    }

    fn cancel(self: Box<Self>) -> bool {
        !self.edits.is_empty()
    }
}

#[derive(Default)]
pub struct SimulatedConnector {
    devices: RwLock<HashMap<String, SimulatedDevice>>,
}

impl SimulatedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, device: SimulatedDevice) {
        self.devices
            .write()
            .insert(device.id().name.clone(), device);
    }

    pub fn device(&self, name: &str) -> Option<SimulatedDevice> {
        self.devices.read().get(name).cloned()
    }
}

impl DeviceConnector for SimulatedConnector {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> PinFuture<Result<Arc<dyn DeviceSession>, ConnectError>> {
        let result = match self.device(&request.id.name) {
            None => Err(ConnectError::Refused {
                device: request.id.to_string(),
                reason: "no such device".into(),
            }),
            Some(device) if !device.state.reachable.load(Ordering::SeqCst) => {
                Err(ConnectError::Refused {
                    device: request.id.to_string(),
                    reason: "host unreachable".into(),
                })
            }
            Some(device) => device
                .state
                .authorize(&request.auth)
                .map(|()| device.state.open_session(request.hello_capabilities.clone())),
        };
        Box::pin(async move { result })
    }
}

fn lookup<'a>(root: &'a Value, path: &DataPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(root, |node, segment| node.get(segment))
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn node_mut<'a>(root: &'a mut Value, segments: &[String]) -> &'a mut Value {
    segments.iter().fold(root, |node, segment| {
        ensure_object(node)
            .entry(segment.clone())
            .or_insert(Value::Null)
    })
}

fn merge_values(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_values(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}

fn remove_node(root: &mut Value, segments: &[String]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut node = root;
    for segment in parents {
        node = node.get_mut(segment)?;
    }
    node.as_object_mut()?.remove(last)
}

fn apply_edit(stores: &mut HashMap<Datastore, Value>, edit: Edit) -> Result<(), RpcError> {
    let root = stores
        .entry(edit.store)
        .or_insert_with(|| Value::Object(Map::new()));
    let segments = edit.path.segments();
    match edit.operation {
        EditOperation::Put => {
            *node_mut(root, segments) = edit.data.unwrap_or(Value::Null);
            Ok(())
        }
        EditOperation::Merge => {
            merge_values(node_mut(root, segments), edit.data.unwrap_or(Value::Null));
            Ok(())
        }
        EditOperation::Delete => {
            if segments.is_empty() {
                *root = Value::Object(Map::new());
                return Ok(());
            }
            remove_node(root, segments).map(|_| ()).ok_or_else(|| {
                RpcError::application("data-missing", format!("{} does not exist", edit.path))
            })
        }
    }
}
