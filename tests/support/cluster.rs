#![allow(dead_code)]

use clustermount::session::schema::SchemaSourceCache;
use clustermount::{
    ClusterNode, Credentials, DeviceConfig, DeviceId, InMemoryStatusStore,
    KeystoreCredentialStore, LocalFabric, LocalOwnershipService, MountPoint, NodeDependencies,
    SimulatedConnector, SimulatedDevice,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SETTLE: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds, panicking with `what` after `timeout`.
pub async fn eventually<F>(timeout: Duration, what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Device config with short timeouts suitable for tests.
pub fn device_config(name: &str) -> DeviceConfig {
    let mut config = DeviceConfig::new(
        name,
        "192.0.2.10",
        830,
        Credentials::LoginPassword {
            username: "admin".into(),
            password: "admin".into(),
        },
    );
    config.ask_timeout_ms = 400;
    config.connection_timeout_ms = 500;
    config.reconnect.max_connection_attempts = 3;
    config.reconnect.between_attempts_timeout_ms = 20;
    config.reconnect.max_timeout_between_attempts_ms = 100;
    config
}

/// In-process cluster sharing one fabric, status store and election broker.
pub struct TestCluster {
    pub fabric: Arc<LocalFabric>,
    pub status: Arc<InMemoryStatusStore>,
    pub ownership: Arc<LocalOwnershipService>,
    pub connector: Arc<SimulatedConnector>,
    pub credentials: Arc<KeystoreCredentialStore>,
    pub nodes: Vec<Arc<ClusterNode>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            fabric: LocalFabric::new(),
            status: Arc::new(InMemoryStatusStore::new()),
            ownership: Arc::new(LocalOwnershipService::new()),
            connector: SimulatedConnector::new(),
            credentials: Arc::new(KeystoreCredentialStore::without_master_key()),
            nodes: Vec::new(),
        }
    }

    pub fn with_nodes(addresses: &[&str]) -> Self {
        let mut cluster = Self::new();
        for address in addresses {
            cluster.add_node(address);
        }
        cluster
    }

    pub fn dependencies(&self) -> NodeDependencies {
        NodeDependencies {
            status: self.status.clone(),
            ownership: self.ownership.clone(),
            connector: self.connector.clone(),
            credentials: self.credentials.clone(),
            schema_cache: SchemaSourceCache::in_memory(),
        }
    }

    pub fn add_node(&mut self, address: &str) -> Arc<ClusterNode> {
        let (transport, inbox) = self.fabric.attach(address);
        let node = ClusterNode::start(transport, inbox, self.dependencies());
        self.nodes.push(Arc::clone(&node));
        node
    }

    /// Registers a simulated device accepting `admin`/`admin`.
    pub fn add_device(&self, name: &str) -> (SimulatedDevice, DeviceConfig) {
        let config = device_config(name);
        let device = SimulatedDevice::new(config.id());
        device.require_login("admin", "admin");
        self.connector.add(device.clone());
        (device, config)
    }

    pub fn node(&self, address: &str) -> Arc<ClusterNode> {
        self.nodes
            .iter()
            .find(|node| node.address() == address)
            .cloned()
            .unwrap_or_else(|| panic!("no node {address}"))
    }

    pub async fn mount_everywhere(&self, config: &DeviceConfig) {
        for node in &self.nodes {
            node.mount_device(config.clone()).await.unwrap();
        }
    }

    /// The node whose mount for `device` is backed by the live session.
    pub fn owner(&self, device: &DeviceId) -> Option<Arc<ClusterNode>> {
        self.nodes
            .iter()
            .find(|node| {
                node.mount_point(device)
                    .map(|mount| mount.is_owner())
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn followers(&self, device: &DeviceId) -> Vec<Arc<ClusterNode>> {
        self.nodes
            .iter()
            .filter(|node| {
                node.mount_point(device)
                    .map(|mount| !mount.is_owner())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Waits until one node owns `device` and every live node has a mount.
    pub async fn settle(&self, device: &DeviceId) -> Arc<ClusterNode> {
        eventually(SETTLE, "device mounted on every node", || {
            self.owner(device).is_some()
                && self.nodes.iter().all(|node| node.mount_point(device).is_some())
        })
        .await;
        self.owner(device).unwrap()
    }

    pub fn mount(&self, address: &str, device: &DeviceId) -> Arc<MountPoint> {
        self.node(address)
            .mount_point(device)
            .unwrap_or_else(|| panic!("{address} has no mount for {device}"))
    }

    /// Kills a node as a process death would: no withdrawal, no cleanup.
    pub async fn crash(&mut self, address: &str) {
        let node = self.node(address);
        node.crash().await;
        self.ownership.node_failed(address);
        self.fabric.detach(address);
        self.nodes.retain(|node| node.address() != address);
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}
