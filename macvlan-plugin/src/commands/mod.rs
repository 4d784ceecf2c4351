use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::geteuid;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::config::{
    ConfigOptions, DriverConfig, PluginPaths, DEFAULT_DOCKER_SOCKET, DEFAULT_PLUGIN_DIR,
    DEFAULT_SOCKET_NAME,
};
use crate::discovery::DockerClient;
use crate::link::{IpLinkOps, LinkOps};
use crate::plugin::MacvlanDriver;
use crate::server::PluginServer;

/// Docker Macvlan Networking
#[derive(Parser, Debug, Clone)]
#[command(name = "macvlan-plugin", author, version, about)]
pub struct Cli {
    /// Enable debugging
    #[arg(short, long, env = "MACVLAN_DEBUG")]
    pub debug: bool,

    /// Listening unix socket, a file name in the plugin directory or an absolute path
    #[arg(short, long, default_value = DEFAULT_SOCKET_NAME, env = "MACVLAN_SOCKET")]
    pub socket: String,

    /// Directory the engine discovers plugin sockets in
    #[arg(long, default_value = DEFAULT_PLUGIN_DIR, env = "MACVLAN_PLUGIN_DIR")]
    pub plugin_dir: PathBuf,

    /// Host interface macvlan links attach to
    #[arg(long, alias = "macvlan-interface", env = "MACVLAN_HOST_INTERFACE")]
    pub host_interface: String,

    /// Default subnet for networks created without IPAM data
    #[arg(long, alias = "macvlan-subnet", env = "MACVLAN_SUBNET")]
    pub subnet: Option<String>,

    /// Macvlan mode [bridge|private|vepa|passthru]
    #[arg(long, alias = "macvlan-mode", default_value = "bridge", env = "MACVLAN_MODE")]
    pub mode: String,

    /// Gateway announced to containers instead of the network's own
    #[arg(long, env = "MACVLAN_GATEWAY")]
    pub gateway: Option<String>,

    /// Link MTU, 0 selects 1500
    #[arg(long, default_value_t = 0, allow_negative_numbers = true, env = "MACVLAN_MTU")]
    pub mtu: i64,

    /// Docker Engine API socket
    #[arg(long, default_value = DEFAULT_DOCKER_SOCKET, env = "MACVLAN_DOCKER_SOCKET")]
    pub docker_socket: PathBuf,

    /// Only allow a single network
    #[arg(long, env = "MACVLAN_SINGLE_NETWORK")]
    pub single_network: bool,
}

impl Cli {
    pub fn config_options(&self) -> ConfigOptions {
        ConfigOptions {
            host_interface: self.host_interface.clone(),
            subnet: self.subnet.clone(),
            mode: Some(self.mode.clone()),
            gateway: self.gateway.clone(),
            mtu: self.mtu,
            single_network: self.single_network,
        }
    }

    pub fn paths(&self) -> PluginPaths {
        PluginPaths {
            plugin_dir: self.plugin_dir.clone(),
            socket_name: self.socket.clone(),
            docker_socket: self.docker_socket.clone(),
        }
    }
}

/// Fail unless the configured host interface exists.
pub fn verify_host_interface(links: &dyn LinkOps, name: &str) -> Result<()> {
    match links.link_index(name)? {
        Some(index) => {
            info!("Host interface [ {} ] found with index {}", name, index);
            Ok(())
        }
        None => anyhow::bail!("host interface [ {} ] does not exist", name),
    }
}

/// Validate everything the driver needs, then serve until shutdown.
///
/// Any error returned before the socket is bound is fatal for the process.
pub async fn run(cli: Cli) -> Result<()> {
    let config =
        DriverConfig::from_options(&cli.config_options()).context("invalid configuration")?;
    let paths = cli.paths();

    let links = Arc::new(IpLinkOps::new());
    verify_host_interface(links.as_ref(), &config.host_interface)?;

    let docker = DockerClient::new(&paths.docker_socket, Handle::current());
    docker.ping().await.with_context(|| {
        format!(
            "could not connect to docker at {}",
            paths.docker_socket.display()
        )
    })?;

    if !geteuid().is_root() {
        warn!("Not running as root, creating macvlan links will most likely fail");
    }

    info!(
        "Macvlan driver config: host interface [ {} ] mode [ {} ] mtu [ {} ]",
        config.host_interface, config.mode, config.mtu
    );
    let driver = Arc::new(MacvlanDriver::new(config, links, Arc::new(docker)));
    info!("Macvlan network driver initialized successfully");

    PluginServer::new(paths.socket_path(), driver).run().await
}
