//! Device identity, data addressing, and the raw device-operation interface
//! produced by a connector.

use crate::config::TransportProtocol;
use crate::error::{ConnectError, DeviceError};
use crate::PinFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capability URIs advertised by a device session.
pub type CapabilitySet = BTreeSet<String>;

/// Immutable identity of a managed device. Correlation key for every message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl DeviceId {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.name, self.host, self.port)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datastore {
    Configuration,
    Operational,
}

/// Slash-separated location inside a datastore tree. The empty path is the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPath(Vec<String>);

impl DataPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(raw: &str) -> Self {
        Self(
            raw.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DataPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    Put,
    Merge,
    Delete,
}

/// A single buffered modification inside a write transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edit {
    pub operation: EditOperation,
    pub store: Datastore,
    pub path: DataPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Edit {
    pub fn put(store: Datastore, path: DataPath, data: Value) -> Self {
        Self {
            operation: EditOperation::Put,
            store,
            path,
            data: Some(data),
        }
    }

    pub fn merge(store: Datastore, path: DataPath, data: Value) -> Self {
        Self {
            operation: EditOperation::Merge,
            store,
            path,
            data: Some(data),
        }
    }

    pub fn delete(store: Datastore, path: DataPath) -> Self {
        Self {
            operation: EditOperation::Delete,
            store,
            path,
            data: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Error,
    Warning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

/// Structured error reported by a device. Passed through verbatim, never retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub severity: ErrorSeverity,
    pub error_type: ErrorType,
    pub tag: String,
    pub message: String,
}

impl RpcError {
    pub fn new(
        severity: ErrorSeverity,
        error_type: ErrorType,
        tag: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            error_type,
            tag: tag.into(),
            message: message.into(),
        }
    }

    pub fn application(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::Error, ErrorType::Application, tag, message)
    }

    pub fn protocol(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorSeverity::Error, ErrorType::Protocol, tag, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{}: {}",
            self.severity, self.error_type, self.tag, self.message
        )
    }
}

/// Result of a remote-procedure or action invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RpcError>,
}

impl RpcOutcome {
    pub fn success(output: Option<Value>) -> Self {
        Self {
            output,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<RpcError>) -> Self {
        Self {
            output: None,
            errors,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors
            .iter()
            .all(|err| err.severity != ErrorSeverity::Error)
    }
}

/// Module identifier used to fetch schema source text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl SourceId {
    pub fn new(name: impl Into<String>, revision: Option<&str>) -> Self {
        Self {
            name: name.into(),
            revision: revision.map(str::to_string),
        }
    }

    /// File name used by on-disk schema caches and libraries.
    pub fn file_name(&self) -> String {
        match &self.revision {
            Some(revision) => format!("{}@{}.yang", self.name, revision),
            None => format!("{}.yang", self.name),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.revision {
            Some(revision) => write!(f, "{}@{}", self.name, revision),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub stream: String,
    pub event_time_ms: u64,
    pub body: Value,
}

/// Resolved authentication material handed to a connector.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password {
        username: String,
        password: String,
    },
    PublicKey {
        username: String,
        private_key: String,
        passphrase: Option<String>,
    },
    TransportSecured {
        key_id: String,
        private_key: String,
    },
}

impl AuthMethod {
    pub fn username(&self) -> Option<&str> {
        match self {
            AuthMethod::Password { username, .. } | AuthMethod::PublicKey { username, .. } => {
                Some(username)
            }
            AuthMethod::TransportSecured { .. } => None,
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            AuthMethod::PublicKey { username, .. } => f
                .debug_struct("PublicKey")
                .field("username", username)
                .finish_non_exhaustive(),
            AuthMethod::TransportSecured { key_id, .. } => f
                .debug_struct("TransportSecured")
                .field("key_id", key_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Everything a connector needs for one connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectRequest {
    pub id: DeviceId,
    pub protocol: TransportProtocol,
    pub auth: AuthMethod,
    pub connection_timeout: Duration,
    /// Replaces the client hello capabilities when set.
    pub hello_capabilities: Option<CapabilitySet>,
    /// Zero means unlimited.
    pub concurrent_rpc_limit: usize,
}

pub trait DeviceConnector: Send + Sync {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> PinFuture<Result<Arc<dyn DeviceSession>, ConnectError>>;
}

/// Live protocol session to a device. Only the owner holds one.
pub trait DeviceSession: Send + Sync {
    fn device(&self) -> &DeviceId;
    fn capabilities(&self) -> CapabilitySet;
    fn schema_sources(&self) -> Vec<SourceId>;
    fn new_read_only(&self) -> Arc<dyn DeviceReadTransaction>;
    fn new_write(&self) -> Box<dyn DeviceWriteTransaction>;
    fn invoke_rpc(&self, name: &str, input: Option<Value>)
        -> PinFuture<Result<RpcOutcome, DeviceError>>;
    fn invoke_action(
        &self,
        path: &DataPath,
        name: &str,
        input: Option<Value>,
    ) -> PinFuture<Result<RpcOutcome, DeviceError>>;
    fn schema_source(&self, id: &SourceId) -> PinFuture<Result<String, DeviceError>>;
    /// Cheap round trip used by keepalive.
    fn probe(&self) -> PinFuture<Result<(), DeviceError>>;
    fn notifications(&self) -> broadcast::Receiver<Notification>;
    /// Resolves once the session is lost or closed.
    fn closed(&self) -> PinFuture<()>;
    fn close(&self);
}

pub trait DeviceReadTransaction: Send + Sync {
    fn read(&self, store: Datastore, path: &DataPath) -> PinFuture<Result<Option<Value>, DeviceError>>;
    fn exists(&self, store: Datastore, path: &DataPath) -> PinFuture<Result<bool, DeviceError>>;
}

/// Buffered edits against a device. Some failures only surface at commit.
pub trait DeviceWriteTransaction: Send {
    fn apply(&mut self, edit: Edit) -> Result<(), DeviceError>;
    fn commit(self: Box<Self>) -> PinFuture<Result<(), DeviceError>>;
    fn cancel(self: Box<Self>) -> bool;
}
