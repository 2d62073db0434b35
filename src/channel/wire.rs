//! Frames exchanged between nodes. Payloads are JSON trees.

use crate::device::{CapabilitySet, DataPath, Datastore, DeviceId, Notification, RpcError, SourceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Process-local handle to an owner's endpoint, valid while that owner's
/// epoch is current.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRef {
    pub address: String,
    pub device: DeviceId,
    pub epoch: u64,
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.device, self.epoch, self.address)
    }
}

/// Identity of an outstanding ask, unique per originating channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

/// Transaction identity chosen by the proxy that created it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId {
    pub origin: String,
    pub seq: u64,
}

impl TxId {
    pub fn new(origin: impl Into<String>, seq: u64) -> Self {
        Self {
            origin: origin.into(),
            seq,
        }
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.origin, self.seq)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Request {
    OpenMountSession,
    OpenReadTransaction {
        tx: TxId,
    },
    OpenWriteTransaction {
        tx: TxId,
    },
    CloseReadTransaction {
        tx: TxId,
    },
    Put {
        tx: TxId,
        store: Datastore,
        path: DataPath,
        data: Value,
    },
    Merge {
        tx: TxId,
        store: Datastore,
        path: DataPath,
        data: Value,
    },
    Delete {
        tx: TxId,
        store: Datastore,
        path: DataPath,
    },
    Read {
        tx: TxId,
        store: Datastore,
        path: DataPath,
    },
    Exists {
        tx: TxId,
        store: Datastore,
        path: DataPath,
    },
    Submit {
        tx: TxId,
    },
    Cancel {
        tx: TxId,
    },
    InvokeRpc {
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    InvokeAction {
        path: DataPath,
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    GetSchemaSource {
        source: SourceId,
    },
    SubscribeNotifications {
        subscriber: String,
    },
    UnsubscribeNotifications {
        subscriber: String,
    },
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::OpenMountSession => "open-mount-session",
            Request::OpenReadTransaction { .. } => "open-read-transaction",
            Request::OpenWriteTransaction { .. } => "open-write-transaction",
            Request::CloseReadTransaction { .. } => "close-read-transaction",
            Request::Put { .. } => "put",
            Request::Merge { .. } => "merge",
            Request::Delete { .. } => "delete",
            Request::Read { .. } => "read",
            Request::Exists { .. } => "exists",
            Request::Submit { .. } => "submit",
            Request::Cancel { .. } => "cancel",
            Request::InvokeRpc { .. } => "invoke-rpc",
            Request::InvokeAction { .. } => "invoke-action",
            Request::GetSchemaSource { .. } => "get-schema-source",
            Request::SubscribeNotifications { .. } => "subscribe-notifications",
            Request::UnsubscribeNotifications { .. } => "unsubscribe-notifications",
        }
    }

    pub fn tx(&self) -> Option<&TxId> {
        match self {
            Request::OpenReadTransaction { tx }
            | Request::OpenWriteTransaction { tx }
            | Request::CloseReadTransaction { tx }
            | Request::Put { tx, .. }
            | Request::Merge { tx, .. }
            | Request::Delete { tx, .. }
            | Request::Read { tx, .. }
            | Request::Exists { tx, .. }
            | Request::Submit { tx }
            | Request::Cancel { tx } => Some(tx),
            _ => None,
        }
    }
}

/// Owner-side refusal that did not come from the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "fault", rename_all = "kebab-case")]
pub enum EndpointFault {
    NotOwner { address: String },
    StaleEpoch { current: u64 },
    StaleHandle { tx: TxId },
    WriteInProgress { holder: TxId },
    TransactionClosed { tx: TxId },
    UnknownTransaction { tx: TxId },
    DeviceUnavailable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Reply {
    Success(Value),
    Empty,
    Error(Vec<RpcError>),
    Fault(EndpointFault),
}

/// Payload of a successful `open-mount-session` reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MountSessionInfo {
    pub capabilities: CapabilitySet,
    pub sources: Vec<SourceId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub origin: String,
    /// Absent for one-way requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub target: EndpointRef,
    pub request: Request,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: RequestId,
    pub device: DeviceId,
    pub reply: Reply,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub device: DeviceId,
    pub notification: Notification,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "kebab-case")]
pub enum Frame {
    Request(RequestFrame),
    Reply(ReplyFrame),
    Notification(NotificationFrame),
}

impl Frame {
    pub fn device(&self) -> &DeviceId {
        match self {
            Frame::Request(frame) => &frame.target.device,
            Frame::Reply(frame) => &frame.device,
            Frame::Notification(frame) => &frame.device,
        }
    }
}
