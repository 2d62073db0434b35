//! Runs an in-process cluster against simulated devices: mounts every
//! configured device on every node, writes through a follower, crashes the
//! owner and reads the data back through the successor.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use clustermount::session::schema::SchemaSourceCache;
use clustermount::{
    load_cluster_config, ClusterConfig, ClusterNode, Credentials, DataPath, Datastore,
    DeviceConfig, DeviceId, InMemoryStatusStore, KeystoreCredentialStore, LocalFabric,
    LocalOwnershipService, NodeDependencies, SimulatedConnector, SimulatedDevice,
};
use env_logger::Env;
use log::{info, warn};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_LOG_FILTER: &str = "info,clustermount=info";
const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Parser, Debug, Clone)]
struct Cli {
    /// Path to cluster configuration YAML
    #[arg(long)]
    config: PathBuf,

    /// env_logger-style filter string (e.g. "info,clustermount=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,

    /// How long to wait for mounts to settle after each step
    #[arg(long, default_value_t = 10_000)]
    settle_timeout_ms: u64,

    /// Skip crashing the owner after the first write
    #[arg(long)]
    no_failover: bool,
}

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_millis();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

struct SimCluster {
    fabric: Arc<LocalFabric>,
    ownership: Arc<LocalOwnershipService>,
    nodes: Vec<Arc<ClusterNode>>,
}

impl SimCluster {
    fn start(config: &ClusterConfig, connector: Arc<SimulatedConnector>) -> Result<Self> {
        let fabric = LocalFabric::new();
        let status = Arc::new(InMemoryStatusStore::new());
        let ownership = Arc::new(LocalOwnershipService::new());
        let credentials = Arc::new(
            KeystoreCredentialStore::from_settings(&config.keystore)
                .context("loading keystore")?,
        );
        let mut nodes = Vec::with_capacity(config.nodes.len());
        for settings in &config.nodes {
            let schema_cache = match &config.schema_cache_directory {
                Some(dir) => SchemaSourceCache::with_directory(dir.join(&settings.id)),
                None => SchemaSourceCache::in_memory(),
            };
            let (transport, inbox) = fabric.attach(&settings.address);
            let node = ClusterNode::start(
                transport,
                inbox,
                NodeDependencies {
                    status: status.clone(),
                    ownership: ownership.clone(),
                    connector: connector.clone(),
                    credentials: credentials.clone(),
                    schema_cache,
                },
            );
            info!("event=sim_node_started id={} address={}", settings.id, settings.address);
            nodes.push(node);
        }
        Ok(Self {
            fabric,
            ownership,
            nodes,
        })
    }

    async fn mount_everywhere(&self, device: &DeviceConfig) -> Result<()> {
        for node in &self.nodes {
            node.mount_device(device.clone())
                .await
                .with_context(|| format!("mounting {} on {}", device.name, node.address()))?;
        }
        Ok(())
    }

    async fn owner_of(&self, device: &DeviceId) -> Option<Arc<ClusterNode>> {
        for node in &self.nodes {
            if let Some(mount) = node.mount_point(device) {
                if mount.is_owner() {
                    return Some(Arc::clone(node));
                }
            }
        }
        None
    }

    /// Waits until one node owns the device and every node has a mount.
    async fn settle(&self, device: &DeviceId, timeout: Duration) -> Result<Arc<ClusterNode>> {
        let deadline = Instant::now() + timeout;
        loop {
            let all_mounted = self
                .nodes
                .iter()
                .all(|node| node.mount_point(device).is_some());
            if all_mounted {
                if let Some(owner) = self.owner_of(device).await {
                    return Ok(owner);
                }
            }
            if Instant::now() >= deadline {
                bail!("device {device} did not settle within {timeout:?}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn follower_of(&self, owner: &ClusterNode) -> Option<Arc<ClusterNode>> {
        self.nodes
            .iter()
            .find(|node| node.address() != owner.address())
            .cloned()
    }

    async fn crash(&mut self, victim: &ClusterNode) {
        victim.crash().await;
        self.ownership.node_failed(victim.address());
        self.fabric.detach(victim.address());
        self.nodes.retain(|node| node.address() != victim.address());
    }

    async fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

fn simulated_device(config: &DeviceConfig) -> SimulatedDevice {
    let device = SimulatedDevice::new(config.id());
    if let Credentials::LoginPassword { username, password } = &config.credentials {
        device.require_login(username.clone(), password.clone());
    }
    device
}

async fn exercise(cluster: &mut SimCluster, device: &DeviceConfig, settle: Duration, failover: bool) -> Result<()> {
    let id = device.id();
    let owner = cluster.settle(&id, settle).await?;
    info!("event=sim_owner_elected device={} owner={}", id, owner.address());

    let writer = cluster.follower_of(&owner).unwrap_or_else(|| Arc::clone(&owner));
    let mount = writer
        .mount_point(&id)
        .ok_or_else(|| anyhow!("{} has no mount for {}", writer.address(), id))?;
    let path = DataPath::parse("/system/hostname");
    let tx = mount.new_write_transaction()?;
    tx.put(Datastore::Configuration, path.clone(), json!(format!("sim-{}", device.name)))
        .await?;
    tx.commit().await?;
    let value = mount.read(Datastore::Configuration, &path).await?;
    info!(
        "event=sim_write_committed device={} via={} value={}",
        id,
        writer.address(),
        value.unwrap_or_default()
    );

    if !failover {
        return Ok(());
    }
    if cluster.nodes.len() < 2 {
        warn!("event=sim_failover_skipped device={} reason=single_node", id);
        return Ok(());
    }
    cluster.crash(&owner).await;
    let successor = cluster.settle(&id, settle).await?;
    info!(
        "event=sim_failover_complete device={} previous={} owner={}",
        id,
        owner.address(),
        successor.address()
    );
    let reader = cluster.follower_of(&successor).unwrap_or(successor);
    let mount = reader
        .mount_point(&id)
        .ok_or_else(|| anyhow!("{} has no mount for {}", reader.address(), id))?;
    let value = mount.read(Datastore::Configuration, &path).await?;
    info!(
        "event=sim_read_after_failover device={} via={} value={}",
        id,
        reader.address(),
        value.unwrap_or_default()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    let config = load_cluster_config(&cli.config)?;
    let settle = Duration::from_millis(cli.settle_timeout_ms);

    let connector = SimulatedConnector::new();
    for device in &config.devices {
        connector.add(simulated_device(device));
    }
    let mut cluster = SimCluster::start(&config, connector)?;
    for device in &config.devices {
        cluster.mount_everywhere(device).await?;
    }
    let mut result = Ok(());
    for device in &config.devices {
        if let Err(err) = exercise(&mut cluster, device, settle, !cli.no_failover).await {
            result = Err(err);
            break;
        }
    }
    cluster.shutdown().await;
    result
}
