//! Configuration loading and management
//!
//! Values come from an optional JSON file where every field has a default,
//! then command-line flags (see `main.rs`) override what the file says.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Curator service address (`host:port`)
    #[serde(default = "default_curator_addr")]
    pub curator_addr: String,

    /// Host used to discover our outbound IP (a UDP "connect" to port 443)
    #[serde(default = "default_kubernetes_api_addr")]
    pub kubernetes_api_addr: String,

    /// Base URL of the cluster API used to resolve our node name
    #[serde(default = "default_cluster_addr")]
    pub cluster_addr: String,

    /// Bearer token for the cluster API
    #[serde(default)]
    pub auth_token: String,

    /// Cluster API connect/request timeout in seconds
    #[serde(default = "default_cluster_api_timeout")]
    pub cluster_api_timeout_secs: u64,

    /// Skip the cluster API lookup and use this node name
    #[serde(default)]
    pub node_name: Option<String>,

    /// Skip the local IP probe and advertise this IP
    #[serde(default)]
    pub advertise_ip: Option<String>,

    /// Port every agent's peer server listens on
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,

    /// WebSocket path on both the curator and peer servers
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Intervals and timeouts
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// TCP reachability probe timeout (default: 3s)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Delay before retrying an unreachable curator (default: 10s)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Membership reconciliation period (default: 5s)
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Periodic liveness snapshot period (default: 10s)
    #[serde(default = "default_publish_interval")]
    pub publish_interval_ms: u64,

    /// Curator ping period; the pinger stays off when unset
    #[serde(default)]
    pub curator_ping_interval_ms: Option<u64>,

    /// Grace delay between a termination signal and exit (default: 2s)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout(),
            retry_interval_ms: default_retry_interval(),
            reconcile_interval_ms: default_reconcile_interval(),
            publish_interval_ms: default_publish_interval(),
            curator_ping_interval_ms: None,
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl TimingConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn curator_ping_interval(&self) -> Option<Duration> {
        self.curator_ping_interval_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_curator_addr() -> String {
    "curator:8080".to_string()
}

fn default_kubernetes_api_addr() -> String {
    "kubernetes.default.svc".to_string()
}

fn default_cluster_addr() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_cluster_api_timeout() -> u64 {
    5
}

fn default_peer_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_probe_timeout() -> u64 {
    3_000
}

fn default_retry_interval() -> u64 {
    10_000
}

fn default_reconcile_interval() -> u64 {
    5_000
}

fn default_publish_interval() -> u64 {
    10_000
}

fn default_shutdown_grace() -> u64 {
    2_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            curator_addr: default_curator_addr(),
            kubernetes_api_addr: default_kubernetes_api_addr(),
            cluster_addr: default_cluster_addr(),
            auth_token: String::new(),
            cluster_api_timeout_secs: default_cluster_api_timeout(),
            node_name: None,
            advertise_ip: None,
            peer_port: default_peer_port(),
            ws_path: default_ws_path(),
            timing: TimingConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("curator_addr must not be empty")]
    MissingCuratorAddr,
    #[error("ws_path must start with '/', got {0:?}")]
    InvalidWsPath(String),
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

impl Config {
    /// Load configuration from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            tracing::info!("No config file given, using defaults");
            return Ok(Config::default());
        };

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.curator_addr.trim().is_empty() {
            return Err(ConfigError::MissingCuratorAddr);
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidWsPath(self.ws_path.clone()));
        }
        let timing = &self.timing;
        for (name, value) in [
            ("probe_timeout_ms", timing.probe_timeout_ms),
            ("retry_interval_ms", timing.retry_interval_ms),
            ("reconcile_interval_ms", timing.reconcile_interval_ms),
            ("publish_interval_ms", timing.publish_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval(name));
            }
        }
        if timing.curator_ping_interval_ms == Some(0) {
            return Err(ConfigError::ZeroInterval("curator_ping_interval_ms"));
        }
        Ok(())
    }

    pub fn cluster_api_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster_api_timeout_secs)
    }
}
