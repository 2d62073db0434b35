use crate::channel::wire::TxId;
use crate::device::RpcError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

fn render_rpc_errors(errors: &[RpcError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure to establish a device session. Retried per the reconnect strategy.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection to {device} refused: {reason}")]
    Refused { device: String, reason: String },
    #[error("authentication rejected for {0}")]
    Authentication(String),
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// Failure reported by, or on behalf of, the device itself.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device rejected the operation: {}", render_rpc_errors(.0))]
    Rejected(Vec<RpcError>),
    #[error("device session is down")]
    SessionDown,
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),
    #[error("owner reports device unavailable: {0}")]
    Unavailable(String),
}

impl DeviceError {
    pub fn rpc_errors(&self) -> &[RpcError] {
        match self {
            DeviceError::Rejected(errors) => errors,
            _ => &[],
        }
    }
}

/// Clustering or transport failure that did not originate at the device.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("no reply from {target} within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("owner reference {0} is stale")]
    StaleOwner(String),
    #[error("{0} does not own the device")]
    NotOwner(String),
    #[error("remote endpoint {0} is gone")]
    EndpointGone(String),
    #[error("peer {address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("request cancelled before a reply arrived")]
    Cancelled,
    #[error("unexpected reply: {0}")]
    Codec(String),
}

impl ClusterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout { .. })
    }

    /// The cached owner reference no longer names a live endpoint.
    pub fn is_stale_owner(&self) -> bool {
        matches!(
            self,
            ClusterError::StaleOwner(_) | ClusterError::NotOwner(_) | ClusterError::EndpointGone(_)
        )
    }
}

/// Local contract violations. Never forwarded to the device.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantError {
    #[error("transaction {0} no longer holds a live write handle")]
    StaleHandle(TxId),
    #[error("another write transaction is in progress")]
    WriteInProgress,
    #[error("transaction {0} is already closed")]
    TransactionClosed(TxId),
    #[error("transaction {0} is unknown to the owner")]
    UnknownTransaction(TxId),
}

/// Caller-facing error of every mount point operation.
#[derive(Debug, Error)]
pub enum MountError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("clustering failure: {0}")]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error("mount point for {0} is closed")]
    Closed(String),
}

impl MountError {
    pub fn is_device_failure(&self) -> bool {
        matches!(self, MountError::Device(_))
    }

    pub fn is_cluster_failure(&self) -> bool {
        matches!(self, MountError::Cluster(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, MountError::Invariant(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MountError::Cluster(err) if err.is_timeout())
    }

    pub fn rpc_errors(&self) -> &[RpcError] {
        match self {
            MountError::Device(err) => err.rpc_errors(),
            _ => &[],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("status for {device} is fenced at epoch {stored}, rejected epoch {offered}")]
    StaleEpoch {
        device: String,
        stored: u64,
        offered: u64,
    },
}

#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("candidate registration for {device} failed: {reason}")]
    RegistrationFailed { device: String, reason: String },
    #[error("{candidate} is already a candidate for {device}")]
    AlreadyRegistered { device: String, candidate: String },
    #[error("device context for {0} is closed")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("gave up connecting to {device} after {attempts} attempts: {last}")]
    Exhausted {
        device: String,
        attempts: usize,
        last: String,
    },
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("session manager for {0} was stopped")]
    Stopped(String),
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema source {0} not found")]
    NotFound(String),
    #[error("schema cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no key material stored under {0}")]
    UnknownKey(String),
    #[error("encrypted credential could not be decrypted: {0}")]
    Decrypt(String),
    #[error("credential encoding invalid: {0}")]
    Encoding(String),
    #[error("{credentials} credentials cannot be used with {protocol}")]
    Unsupported {
        protocol: String,
        credentials: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no route to peer {0}")]
    UnknownPeer(String),
    #[error("transport to {0} is closed")]
    Closed(String),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}
