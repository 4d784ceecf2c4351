//! Host-side macvlan link provisioning.

use nix::errno::Errno;
use nix::net::if_::if_nametoindex;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{MacvlanMode, MIN_MTU};
use crate::error::{DriverError, Result};

/// Characters of the endpoint id used as the pre-handoff link name.
pub const LINK_NAME_LEN: usize = 5;

/// Operator guidance logged when a link cannot be created.
pub const REMEDIATION_HINTS: [&str; 3] = [
    "a parent interface cannot be bound to macvlan links of different modes; use another parent",
    "check /var/run/docker/netns/ for orphaned links to unmount and delete, then restart the plugin",
    "clean orphaned links with 'umount /var/run/docker/netns/* && rm /var/run/docker/netns/*'",
];

/// Link name used while the interface still lives in the driver's namespace.
///
/// The first five characters of the endpoint id; shorter ids are used whole.
pub fn derive_link_name(endpoint_id: &str) -> String {
    endpoint_id.chars().take(LINK_NAME_LEN).collect()
}

/// Kernel link operations the provisioner needs.
pub trait LinkOps: Send + Sync {
    /// Kernel index of the named link, `None` if it does not exist.
    fn link_index(&self, name: &str) -> Result<Option<u32>>;

    /// Create a macvlan link named `name` on `parent`.
    fn add_macvlan(&self, parent: &str, name: &str, mode: MacvlanMode) -> Result<()>;

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;

    fn set_up(&self, name: &str) -> Result<()>;

    fn delete(&self, name: &str) -> Result<()>;
}

/// `LinkOps` backed by `if_nametoindex(3)` and the iproute2 `ip` tool.
#[derive(Debug, Clone)]
pub struct IpLinkOps {
    ip_bin: PathBuf,
}

impl Default for IpLinkOps {
    fn default() -> Self {
        Self {
            ip_bin: PathBuf::from("ip"),
        }
    }
}

impl IpLinkOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `ip` binary.
    pub fn with_binary(ip_bin: impl Into<PathBuf>) -> Self {
        Self {
            ip_bin: ip_bin.into(),
        }
    }

    fn ip(&self, args: &[&str]) -> Result<()> {
        let output = Command::new(&self.ip_bin)
            .args(args)
            .output()
            .map_err(|e| {
                DriverError::Provisioning(format!(
                    "failed to execute {} {}: {}",
                    self.ip_bin.display(),
                    args.join(" "),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(DriverError::Provisioning(format!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl LinkOps for IpLinkOps {
    fn link_index(&self, name: &str) -> Result<Option<u32>> {
        match if_nametoindex(name) {
            Ok(index) => Ok(Some(index)),
            Err(Errno::ENODEV) => Ok(None),
            Err(e) => Err(DriverError::Provisioning(format!(
                "failed to look up link {}: {}",
                name, e
            ))),
        }
    }

    fn add_macvlan(&self, parent: &str, name: &str, mode: MacvlanMode) -> Result<()> {
        self.ip(&[
            "link", "add", "link", parent, "name", name, "type", "macvlan", "mode",
            mode.as_str(),
        ])
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()])
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "up"])
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", "dev", name])
    }
}

/// A link created by the provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkHandle {
    /// Link name in the driver namespace
    pub name: String,
    /// Kernel index of the link
    pub index: u32,
    /// Parent interface name
    pub parent: String,
    /// Kernel index of the parent
    pub parent_index: u32,
    /// Macvlan mode
    pub mode: MacvlanMode,
    /// MTU set on the link
    pub mtu: u32,
}

/// Creates and destroys macvlan links
#[derive(Clone)]
pub struct Provisioner {
    ops: Arc<dyn LinkOps>,
}

impl Provisioner {
    pub fn new(ops: Arc<dyn LinkOps>) -> Self {
        Self { ops }
    }

    /// Whether a link with this name exists in the driver namespace.
    pub fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.ops.link_index(name)?.is_some())
    }

    /// Create a macvlan link on `parent`, set its MTU and bring it up.
    ///
    /// A link left half-configured by a failed MTU or up call is deleted
    /// again before the error is returned.
    pub fn create_link(
        &self,
        parent: &str,
        name: &str,
        mode: MacvlanMode,
        mtu: u32,
    ) -> Result<LinkHandle> {
        if mode != MacvlanMode::Bridge {
            return Err(DriverError::Validation(format!(
                "macvlan mode [ {} ] is not supported, only bridge mode can be provisioned",
                mode
            )));
        }
        if mtu < MIN_MTU {
            return Err(DriverError::Validation(format!(
                "MTU [ {} ] is below the minimum of [ {} ]",
                mtu, MIN_MTU
            )));
        }
        if name.is_empty() {
            return Err(DriverError::BadRequest("link name is empty".to_string()));
        }

        let parent_index = self.ops.link_index(parent)?.ok_or_else(|| {
            DriverError::Provisioning(format!("parent interface [ {} ] was not found", parent))
        })?;

        if self.ops.link_index(name)?.is_some() {
            return Err(DriverError::Provisioning(format!(
                "a link named [ {} ] already exists, likely left behind by a previous container",
                name
            )));
        }

        self.ops.add_macvlan(parent, name, mode)?;
        info!(
            "Created macvlan link [ {} ] on parent [ {} ] using mode [ {} ]",
            name, parent, mode
        );

        if let Err(err) = self
            .ops
            .set_mtu(name, mtu)
            .and_then(|_| self.ops.set_up(name))
        {
            if let Err(del_err) = self.ops.delete(name) {
                warn!("Failed to remove half-configured link [ {} ]: {}", name, del_err);
            }
            return Err(err);
        }

        let index = self.ops.link_index(name)?.ok_or_else(|| {
            DriverError::Provisioning(format!("link [ {} ] vanished after creation", name))
        })?;

        debug!("Link [ {} ] index {} is up with MTU {}", name, index, mtu);

        Ok(LinkHandle {
            name: name.to_string(),
            index,
            parent: parent.to_string(),
            parent_index,
            mode,
            mtu,
        })
    }

    /// Delete a link by name. `NotFound` when no such link exists here.
    pub fn delete_link(&self, name: &str) -> Result<()> {
        if self.ops.link_index(name)?.is_none() {
            return Err(DriverError::NotFound(format!(
                "the requested interface to delete [ {} ] was not found on the host",
                name
            )));
        }
        info!("Deleting the unused macvlan link [ {} ]", name);
        self.ops.delete(name)
    }
}
