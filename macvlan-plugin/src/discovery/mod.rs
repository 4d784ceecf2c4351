//! Back-fills the registry with macvlan networks the engine already knows.
//!
//! Runs once per Join that misses the registry. There is no polling and no
//! invalidation: a reconciled network stays until it is deleted.

use anyhow::{Context, Result};
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ipnetwork::Ipv4Network;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::MacvlanMode;
use crate::state::{Network, Registry};
use crate::types::{HOST_IFACE_OPTION, MODE_OPTION};

/// Network names the engine creates itself.
pub const RESERVED_NETWORK_NAMES: [&str; 4] = ["", "none", "host", "bridge"];

/// Network as listed by the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineNetwork {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "IPAM")]
    pub ipam: EngineIpam,
    #[serde(rename = "Options")]
    pub options: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineIpam {
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "Config")]
    pub config: Option<Vec<EngineIpamConfig>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineIpamConfig {
    #[serde(rename = "Subnet")]
    pub subnet: String,
    #[serde(rename = "Gateway")]
    pub gateway: String,
}

/// Source of the engine's network list.
pub trait NetworkLister: Send + Sync {
    fn list_networks(&self) -> Result<Vec<EngineNetwork>>;
}

/// Registry entry for an engine network, or `None` when the network is
/// reserved or not macvlan-managed (no `host_iface` option).
pub fn network_from_engine(net: &EngineNetwork, default_mode: MacvlanMode) -> Option<Network> {
    if RESERVED_NETWORK_NAMES.contains(&net.name.as_str()) {
        return None;
    }
    let options = net.options.as_ref()?;
    let parent = options
        .get(HOST_IFACE_OPTION)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())?;

    let (cidr, gateway) = match net.ipam.config.as_ref().and_then(|c| c.first()) {
        Some(cfg) => {
            let cidr = match Ipv4Network::from_str(&cfg.subnet) {
                Ok(cidr) => Some(cidr),
                Err(e) => {
                    error!(
                        "invalid cidr address in network [ {} ]: [ {} ] {}",
                        net.name, cfg.subnet, e
                    );
                    None
                }
            };
            (cidr, cfg.gateway.clone())
        }
        None => (None, String::new()),
    };

    let mode = match options.get(MODE_OPTION) {
        Some(m) => m.parse().unwrap_or_else(|e| {
            warn!("network [ {} ]: {}, using {}", net.name, e, default_mode);
            default_mode
        }),
        None => default_mode,
    };

    debug!(
        "Existing macvlan network: [Name:{}, Cidr:{:?}, Gateway:{}, Parent:{}]",
        net.name, cidr, gateway, parent
    );

    Some(Network::new(&net.id, cidr, &gateway, parent, mode))
}

/// One-shot bridge between the engine's networks and the registry
#[derive(Clone)]
pub struct Reconciler {
    lister: Arc<dyn NetworkLister>,
    default_mode: MacvlanMode,
}

impl Reconciler {
    pub fn new(lister: Arc<dyn NetworkLister>, default_mode: MacvlanMode) -> Self {
        Self {
            lister,
            default_mode,
        }
    }

    /// List the engine's networks and register the macvlan ones that are
    /// missing. Returns the ids that were added.
    pub fn reconcile(&self, registry: &Registry) -> Result<Vec<String>> {
        let networks = self
            .lister
            .list_networks()
            .context("unable to retrieve existing networks")?;

        let added: Vec<String> = networks
            .iter()
            .filter_map(|n| network_from_engine(n, self.default_mode))
            .filter_map(|n| {
                let id = n.id().to_string();
                registry.insert_if_absent(n).then_some(id)
            })
            .collect();

        if !added.is_empty() {
            info!("Reconciled existing networks: [ {} ]", added.iter().join(", "));
        }
        Ok(added)
    }
}

/// Minimal Docker Engine API client over the engine's unix socket
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
    runtime: Handle,
}

impl DockerClient {
    /// `runtime` drives requests issued from blocking contexts.
    pub fn new(socket: impl Into<PathBuf>, runtime: Handle) -> Self {
        Self {
            socket: socket.into(),
            runtime,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let client: Client<_, Empty<Bytes>> =
            Client::builder(TokioExecutor::new()).build(hyperlocal::UnixConnector);

        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket, path).into();
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header("Host", "docker")
            .body(Empty::new())
            .context("failed to build request")?;

        let response = client.request(req).await.with_context(|| {
            format!("failed to reach the engine at {}", self.socket.display())
        })?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .context("failed to read engine response")?
            .to_bytes();

        if !status.is_success() {
            anyhow::bail!(
                "engine returned {} for {}: {}",
                status,
                path,
                String::from_utf8_lossy(&body)
            );
        }
        Ok(body)
    }

    /// Check the engine answers.
    pub async fn ping(&self) -> Result<()> {
        self.get("/_ping").await.map(|_| ())
    }

    /// All networks, unfiltered.
    pub async fn networks(&self) -> Result<Vec<EngineNetwork>> {
        let body = self.get("/networks").await?;
        serde_json::from_slice(&body).context("failed to decode engine network list")
    }
}

impl NetworkLister for DockerClient {
    // Called from blocking handler threads, never from inside the runtime.
    fn list_networks(&self) -> Result<Vec<EngineNetwork>> {
        self.runtime.block_on(self.networks())
    }
}
