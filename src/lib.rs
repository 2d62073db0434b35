//! Cluster-wide device mounts.
//!
//! Exactly one process in the cluster owns the live session to a device. Every
//! process registers an identical mount point for it: the owner backs the mount
//! with the local session, followers back it with proxies that forward each
//! operation to the owner's remote operation endpoint.

pub mod channel;
pub mod config;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod mount;
#[cfg(feature = "net")]
pub mod net;
pub mod node;
pub mod ownership;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod sim;
pub mod status;
pub mod timeouts;

use std::future::Future;

/// Boxed future used by trait-object async methods.
pub type PinFuture<T> = std::pin::Pin<Box<dyn Future<Output = T> + Send>>;

pub use channel::fabric::{FabricTransport, LocalFabric, Transport};
pub use channel::wire::{EndpointRef, Frame, Reply, Request, RequestId, TxId};
pub use channel::CorrelationChannel;
pub use config::{
    load_cluster_config, ClusterConfig, DeviceConfig, NodeSettings, ReconnectSettings,
    TransportProtocol,
};
pub use device::{
    CapabilitySet, DataPath, Datastore, DeviceConnector, DeviceId, DeviceReadTransaction,
    DeviceSession, DeviceWriteTransaction, Edit, EditOperation, Notification, RpcError,
    RpcOutcome, SourceId,
};
pub use endpoint::{EndpointHandle, RemoteOperationEndpoint};
pub use error::{
    ClusterError, ConfigError, ConnectError, CredentialError, DeviceError, InvariantError,
    MountError, OwnershipError, SchemaError, SessionError, StatusError, TransportError,
};
pub use mount::{MountFacade, MountPoint, MountPointService, NodeManager, WriteTransaction};
pub use node::{ClusterNode, NodeDependencies};
pub use ownership::{
    DeviceContext, LocalOwnershipService, OwnershipListener, OwnershipService, Role,
};
pub use proxy::ProxySet;
pub use retry::{RetryHandle, RetryPolicy, RetryStrategy};
pub use session::credentials::{Credentials, CredentialStore, KeystoreCredentialStore};
pub use session::DeviceSessionManager;
pub use sim::{SimulatedConnector, SimulatedDevice};
pub use status::{ConnectionStatusRecord, InMemoryStatusStore, StatusEvent, StatusStore};
