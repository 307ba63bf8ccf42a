//! Discovering who this agent is: outbound IP and cluster node name.

use crate::config::Config;
use serde::Deserialize;
use std::net::IpAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Local IP lookup via {addr} failed: {source}")]
    LocalIp {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HOSTNAME is not set")]
    MissingHostname,

    #[error("Cluster API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("No pod named {0:?} in cluster API listing")]
    PodNotFound(String),
}

/// This agent's name and advertised IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Cluster node name (empty if it could not be resolved)
    pub name: String,
    pub ip: String,
}

/// Subset of a cluster API pod listing.
#[derive(Debug, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
pub struct Pod {
    pub metadata: PodMetadata,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Deserialize)]
pub struct PodMetadata {
    pub name: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PodSpec {
    #[serde(rename = "nodeName", default)]
    pub node_name: String,
}

/// Outbound IP, found by "connecting" a UDP socket to `<host>:443`.
///
/// No packet is sent; the kernel just picks the route and source address.
pub async fn local_ip(host: &str) -> Result<IpAddr, IdentityError> {
    let addr = format!("{}:443", host);
    let err = |source: std::io::Error| IdentityError::LocalIp {
        addr: addr.clone(),
        source,
    };
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(err)?;
    socket.connect(&addr).await.map_err(err)?;
    Ok(socket.local_addr().map_err(err)?.ip())
}

/// Node name of the pod called `hostname`, if listed.
pub fn node_name_for(pods: &PodList, hostname: &str) -> Option<String> {
    pods.items
        .iter()
        .find(|pod| pod.metadata.name == hostname)
        .map(|pod| pod.spec.node_name.clone())
}

/// Ask the cluster API which node the pod `hostname` runs on.
///
/// TLS verification is off: in-cluster API servers present certificates
/// signed by the cluster CA, which is not in the default trust store.
pub async fn resolve_node_name(config: &Config, hostname: &str) -> Result<String, IdentityError> {
    let timeout = config.cluster_api_timeout();
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()?;

    let url = format!("{}/api/v1/pods", config.cluster_addr.trim_end_matches('/'));
    let pods: PodList = client
        .get(&url)
        .bearer_auth(&config.auth_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    node_name_for(&pods, hostname).ok_or_else(|| IdentityError::PodNotFound(hostname.to_string()))
}

/// Resolve both halves of the identity.
///
/// The IP is required (the peer server binds to it). The node name is not:
/// lookup failures are logged and the agent continues with an empty name.
pub async fn resolve(config: &Config) -> Result<NodeIdentity, IdentityError> {
    let ip = match &config.advertise_ip {
        Some(ip) => ip.clone(),
        None => local_ip(&config.kubernetes_api_addr).await?.to_string(),
    };

    let name = match &config.node_name {
        Some(name) => name.clone(),
        None => {
            let lookup = match std::env::var("HOSTNAME") {
                Ok(hostname) => resolve_node_name(config, &hostname).await,
                Err(_) => Err(IdentityError::MissingHostname),
            };
            lookup.unwrap_or_else(|e| {
                warn!("Unable to resolve node name, continuing without one: {}", e);
                String::new()
            })
        }
    };

    info!("Node identity: name={:?} ip={}", name, ip);
    Ok(NodeIdentity { name, ip })
}
