use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{DriverError, Result};

/// MTU used when none is configured.
pub const DEFAULT_MTU: u32 = 1500;

/// Lower bound of an IPv4 MTU (RFC 791).
pub const MIN_MTU: u32 = 68;

/// Directory Docker scans for plugin sockets.
pub const DEFAULT_PLUGIN_DIR: &str = "/run/docker/plugins";

/// Socket file name inside the plugin directory.
pub const DEFAULT_SOCKET_NAME: &str = "macvlan.sock";

/// Docker Engine API socket.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Macvlan sub-mode.
///
/// Only `Bridge` can be provisioned. The others still parse so that a typo
/// and an unsupported mode fail with different messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacvlanMode {
    #[default]
    Bridge,
    Private,
    Vepa,
    Passthru,
}

impl MacvlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::Private => "private",
            Self::Vepa => "vepa",
            Self::Passthru => "passthru",
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MacvlanMode {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "bridge" => Ok(Self::Bridge),
            "private" => Ok(Self::Private),
            "vepa" => Ok(Self::Vepa),
            "passthru" => Ok(Self::Passthru),
            other => Err(DriverError::Validation(format!(
                "invalid macvlan mode [ {} ], expected one of bridge|private|vepa|passthru",
                other
            ))),
        }
    }
}

/// Turn the requested MTU into the effective one.
///
/// Zero or negative selects the default, anything from 1 to 67 is rejected.
pub fn resolve_mtu(requested: i64) -> Result<u32> {
    if requested <= 0 {
        return Ok(DEFAULT_MTU);
    }
    if requested < i64::from(MIN_MTU) {
        return Err(DriverError::Validation(format!(
            "the MTU value passed [ {} ] must be at least [ {} ] bytes per rfc791",
            requested, MIN_MTU
        )));
    }
    u32::try_from(requested)
        .map_err(|_| DriverError::Validation(format!("MTU value [ {} ] is out of range", requested)))
}

/// Raw driver options as handed over by the command line.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    /// Host interface macvlan children attach to
    pub host_interface: String,
    /// Default subnet for networks created without IPAM data
    pub subnet: Option<String>,
    /// Macvlan mode name
    pub mode: Option<String>,
    /// Gateway announced to containers instead of the network's own
    pub gateway: Option<String>,
    /// Requested MTU (0 or less selects the default)
    pub mtu: i64,
    /// Only allow one network at a time
    pub single_network: bool,
}

/// Validated, immutable driver configuration.
///
/// Built once at startup and shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub host_interface: String,
    pub subnet: Option<Ipv4Network>,
    pub mode: MacvlanMode,
    pub gateway_override: Option<Ipv4Addr>,
    pub mtu: u32,
    pub single_network: bool,
}

impl DriverConfig {
    /// Validate raw options into a configuration.
    pub fn from_options(opts: &ConfigOptions) -> Result<Self> {
        let host_interface = opts.host_interface.trim().to_string();
        if host_interface.is_empty() {
            return Err(DriverError::Validation(
                "a host interface is required (--host-interface)".to_string(),
            ));
        }

        let subnet = match opts.subnet.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(Ipv4Network::from_str(s).map_err(|e| {
                DriverError::Validation(format!("invalid subnet [ {} ]: {}", s, e))
            })?),
        };

        let mode = match opts.mode.as_deref() {
            Some(m) => m.parse()?,
            None => MacvlanMode::default(),
        };
        if mode != MacvlanMode::Bridge {
            return Err(DriverError::Validation(format!(
                "macvlan mode [ {} ] is unsupported, only bridge mode is currently supported",
                mode
            )));
        }

        let gateway_override = match opts.gateway.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(g) => Some(g.parse::<Ipv4Addr>().map_err(|e| {
                DriverError::Validation(format!("invalid gateway [ {} ]: {}", g, e))
            })?),
        };

        Ok(Self {
            host_interface,
            subnet,
            mode,
            gateway_override,
            mtu: resolve_mtu(opts.mtu)?,
            single_network: opts.single_network,
        })
    }

    /// Configuration with defaults for everything except the host interface.
    pub fn new_default(host_interface: &str) -> Result<Self> {
        Self::from_options(&ConfigOptions {
            host_interface: host_interface.to_string(),
            ..Default::default()
        })
    }
}

/// Filesystem locations the plugin uses.
#[derive(Debug, Clone)]
pub struct PluginPaths {
    /// Directory the plugin socket lives in
    pub plugin_dir: PathBuf,
    /// Socket file name
    pub socket_name: String,
    /// Docker Engine API socket
    pub docker_socket: PathBuf,
}

impl Default for PluginPaths {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from(DEFAULT_PLUGIN_DIR),
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
        }
    }
}

impl PluginPaths {
    /// Absolute path of the plugin socket.
    ///
    /// An absolute `socket_name` is used as is.
    pub fn socket_path(&self) -> PathBuf {
        let name = PathBuf::from(&self.socket_name);
        if name.is_absolute() {
            name
        } else {
            self.plugin_dir.join(name)
        }
    }
}
