//! YAML configuration for nodes and mounted devices.

use crate::device::{CapabilitySet, DeviceId};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::session::credentials::Credentials;
use crate::timeouts::{
    DEFAULT_ASK_TIMEOUT, DEFAULT_BETWEEN_ATTEMPTS, DEFAULT_CONNECTION_TIMEOUT,
    DEFAULT_MAX_BETWEEN_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SLEEP_FACTOR,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Ssh,
    Tls,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportProtocol::Ssh => "ssh",
            TransportProtocol::Tls => "tls",
            TransportProtocol::Tcp => "tcp",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Zero retries forever.
    #[serde(default)]
    pub max_connection_attempts: usize,
    #[serde(default = "default_between_attempts_ms")]
    pub between_attempts_timeout_ms: u64,
    #[serde(default = "default_sleep_factor")]
    pub sleep_factor: f64,
    #[serde(default = "default_max_between_attempts_ms")]
    pub max_timeout_between_attempts_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_connection_attempts: 0,
            between_attempts_timeout_ms: default_between_attempts_ms(),
            sleep_factor: default_sleep_factor(),
            max_timeout_between_attempts_ms: default_max_between_attempts_ms(),
        }
    }
}

impl ReconnectSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::backoff(
            self.max_connection_attempts,
            Duration::from_millis(self.between_attempts_timeout_ms),
            self.sleep_factor,
        )
        .with_max_delay(Duration::from_millis(self.max_timeout_between_attempts_ms))
    }
}

/// Connection configuration of one mounted device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: TransportProtocol,
    pub credentials: Credentials,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    /// Zero disables keepalive.
    #[serde(default)]
    pub keepalive_delay_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default = "default_ask_timeout_ms")]
    pub ask_timeout_ms: u64,
    /// Zero disables idle expiry of the owner-side write handle.
    #[serde(default)]
    pub write_tx_idle_timeout_secs: u64,
    #[serde(default)]
    pub concurrent_rpc_limit: usize,
    #[serde(default)]
    pub yang_library_directory: Option<PathBuf>,
    #[serde(default)]
    pub hello_capabilities: Option<Vec<String>>,
}

impl DeviceConfig {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        credentials: Credentials,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            protocol: TransportProtocol::default(),
            credentials,
            connection_timeout_ms: default_connection_timeout_ms(),
            default_request_timeout_ms: default_request_timeout_ms(),
            keepalive_delay_secs: 0,
            reconnect: ReconnectSettings::default(),
            ask_timeout_ms: default_ask_timeout_ms(),
            write_tx_idle_timeout_secs: 0,
            concurrent_rpc_limit: 0,
            yang_library_directory: None,
            hello_capabilities: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        DeviceId::new(&self.name, &self.host, self.port)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    pub fn keepalive_delay(&self) -> Option<Duration> {
        (self.keepalive_delay_secs > 0).then(|| Duration::from_secs(self.keepalive_delay_secs))
    }

    pub fn ask_timeout(&self) -> Duration {
        Duration::from_millis(self.ask_timeout_ms)
    }

    pub fn write_tx_idle_timeout(&self) -> Option<Duration> {
        (self.write_tx_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.write_tx_idle_timeout_secs))
    }

    pub fn hello_capability_set(&self) -> Option<CapabilitySet> {
        self.hello_capabilities
            .as_ref()
            .map(|caps| caps.iter().cloned().collect())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("device name must not be empty".into()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "device {} has no host",
                self.name
            )));
        }
        if self.ask_timeout_ms == 0 || self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "device {} timeouts must be positive",
                self.name
            )));
        }
        if !(self.reconnect.sleep_factor.is_finite() && self.reconnect.sleep_factor > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "device {} sleep factor must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    /// Address other nodes use to reach this node's inbox.
    pub address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeystoreSettings {
    /// Hex-encoded 32-byte key protecting encrypted passwords.
    #[serde(default)]
    pub master_key: Option<String>,
    #[serde(default)]
    pub private_keys: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeSettings>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub keystore: KeystoreSettings,
    #[serde(default)]
    pub schema_cache_directory: Option<PathBuf>,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::Invalid("at least one node is required".into()));
        }
        let mut ids = BTreeSet::new();
        let mut addresses = BTreeSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate node id {}", node.id)));
            }
            if !addresses.insert(node.address.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node address {}",
                    node.address
                )));
            }
        }
        let mut devices = BTreeSet::new();
        for device in &self.devices {
            device.validate()?;
            if !devices.insert(device.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate device {}",
                    device.name
                )));
            }
        }
        Ok(())
    }
}

pub fn load_cluster_config(path: &Path) -> Result<ClusterConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: ClusterConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    // Relative directories are relative to the config file.
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if let Some(dir) = config.schema_cache_directory.take() {
        config.schema_cache_directory = Some(resolve_relative(&base, &dir));
    }
    for device in &mut config.devices {
        if let Some(dir) = device.yang_library_directory.take() {
            device.yang_library_directory = Some(resolve_relative(&base, &dir));
        }
    }
    config.validate()?;
    Ok(config)
}

/// If `path` is relative, joins it to `base`; otherwise returns it unchanged.
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

fn default_connection_timeout_ms() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as u64
}

fn default_ask_timeout_ms() -> u64 {
    DEFAULT_ASK_TIMEOUT.as_millis() as u64
}

fn default_between_attempts_ms() -> u64 {
    DEFAULT_BETWEEN_ATTEMPTS.as_millis() as u64
}

fn default_max_between_attempts_ms() -> u64 {
    DEFAULT_MAX_BETWEEN_ATTEMPTS.as_millis() as u64
}

fn default_sleep_factor() -> f64 {
    DEFAULT_SLEEP_FACTOR
}
