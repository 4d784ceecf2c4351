//! In-memory network and endpoint registry.
//!
//! Locking is two-level: `Registry::networks` guards the id → network map and
//! every `Network` guards its own endpoint map. A method takes at most one of
//! those locks at a time, so network-level and endpoint-level operations
//! cannot deadlock against each other. The link-name claim table has a third,
//! independent lock.

use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::config::MacvlanMode;
use crate::error::{DriverError, Result};

/// Locally administered prefix of every derived MAC address.
pub const MAC_PREFIX: [u8; 2] = [0x7a, 0x42];

/// MAC address derived from an endpoint's IPv4 address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// `7a:42` followed by the four address octets.
    pub fn from_ipv4(ip: Ipv4Addr) -> Self {
        let mut hw = [0u8; 6];
        hw[..2].copy_from_slice(&MAC_PREFIX);
        hw[2..].copy_from_slice(&ip.octets());
        Self(hw)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

/// Where an endpoint is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Metadata only, no link yet
    Created,
    /// Link created and handed to a sandbox
    Joined,
}

/// Endpoint record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint ID
    pub id: String,
    /// IPv4 address with prefix length
    pub address: Ipv4Network,
    /// Derived MAC address
    pub mac: MacAddress,
    /// Macvlan link created at Join
    pub host_interface: Option<String>,
    /// Sandbox the link was handed to
    pub sandbox_key: Option<String>,
    /// Lifecycle state
    pub state: EndpointState,
}

impl Endpoint {
    pub fn new(id: &str, address: Ipv4Network) -> Self {
        Self {
            id: id.to_string(),
            address,
            mac: MacAddress::from_ipv4(address.ip()),
            host_interface: None,
            sandbox_key: None,
            state: EndpointState::Created,
        }
    }
}

/// A macvlan network and its endpoints
#[derive(Debug)]
pub struct Network {
    id: String,
    cidr: Option<Ipv4Network>,
    gateway: String,
    parent_interface: String,
    mode: MacvlanMode,
    endpoints: Mutex<HashMap<String, Endpoint>>,
}

impl Network {
    pub fn new(
        id: &str,
        cidr: Option<Ipv4Network>,
        gateway: &str,
        parent_interface: &str,
        mode: MacvlanMode,
    ) -> Self {
        Self {
            id: id.to_string(),
            cidr,
            gateway: gateway.to_string(),
            parent_interface: parent_interface.to_string(),
            mode,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cidr(&self) -> Option<Ipv4Network> {
        self.cidr
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn parent_interface(&self) -> &str {
        &self.parent_interface
    }

    pub fn mode(&self) -> MacvlanMode {
        self.mode
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an endpoint; an id already present is a conflict.
    pub fn add_endpoint(&self, ep: Endpoint) -> Result<()> {
        let mut endpoints = self.lock_endpoints();
        if endpoints.contains_key(&ep.id) {
            return Err(DriverError::Conflict(format!(
                "endpoint {} already exists in network {}",
                ep.id, self.id
            )));
        }
        endpoints.insert(ep.id.clone(), ep);
        Ok(())
    }

    /// Copy of an endpoint record.
    pub fn get_endpoint(&self, id: &str) -> Result<Endpoint> {
        if id.is_empty() {
            return Err(DriverError::BadRequest("invalid endpoint id: empty".to_string()));
        }
        self.lock_endpoints()
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("endpoint not found: {}", id)))
    }

    /// Remove an endpoint, returning it if it was present.
    pub fn delete_endpoint(&self, id: &str) -> Option<Endpoint> {
        self.lock_endpoints().remove(id)
    }

    /// Record the link an endpoint was joined with.
    pub fn mark_joined(&self, id: &str, host_interface: &str, sandbox_key: &str) -> Result<()> {
        let mut endpoints = self.lock_endpoints();
        let ep = endpoints
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(format!("endpoint not found: {}", id)))?;
        ep.host_interface = Some(host_interface.to_string());
        ep.sandbox_key = (!sandbox_key.is_empty()).then(|| sandbox_key.to_string());
        ep.state = EndpointState::Joined;
        Ok(())
    }

    pub fn endpoint_ids(&self) -> Vec<String> {
        self.lock_endpoints().keys().cloned().collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock_endpoints().len()
    }

    /// Remove and return every endpoint.
    pub fn drain_endpoints(&self) -> Vec<Endpoint> {
        self.lock_endpoints().drain().map(|(_, ep)| ep).collect()
    }
}

/// Endpoint holding a link name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOwner {
    pub network_id: String,
    pub endpoint_id: String,
}

impl LinkOwner {
    pub fn new(network_id: &str, endpoint_id: &str) -> Self {
        Self {
            network_id: network_id.to_string(),
            endpoint_id: endpoint_id.to_string(),
        }
    }
}

/// Thread-safe store of networks
#[derive(Debug, Default)]
pub struct Registry {
    networks: RwLock<HashMap<String, Arc<Network>>>,
    link_claims: Mutex<HashMap<String, LinkOwner>>,
    single_network: bool,
}

impl Registry {
    pub fn new(single_network: bool) -> Self {
        Self {
            single_network,
            ..Default::default()
        }
    }

    /// Insert a network.
    ///
    /// Fails with `Conflict` if the id is taken, or, in single-network mode,
    /// if another network already exists. The existing entry is untouched.
    pub fn add_network(&self, network: Network) -> Result<Arc<Network>> {
        if network.id.is_empty() {
            return Err(DriverError::BadRequest("invalid network id: empty".to_string()));
        }
        let mut networks = self.networks.write().unwrap_or_else(|e| e.into_inner());
        if networks.contains_key(&network.id) {
            return Err(DriverError::Conflict(format!(
                "network {} already exists",
                network.id
            )));
        }
        if self.single_network {
            if let Some(existing) = networks.keys().next() {
                return Err(DriverError::Conflict(format!(
                    "only one network is allowed and {} already exists",
                    existing
                )));
            }
        }
        let network = Arc::new(network);
        networks.insert(network.id.clone(), Arc::clone(&network));
        Ok(network)
    }

    /// Insert a network unless one with the same id exists, or the
    /// single-network slot is taken. Returns whether it was inserted.
    pub fn insert_if_absent(&self, network: Network) -> bool {
        if network.id.is_empty() {
            return false;
        }
        let mut networks = self.networks.write().unwrap_or_else(|e| e.into_inner());
        if networks.contains_key(&network.id) || (self.single_network && !networks.is_empty()) {
            return false;
        }
        networks.insert(network.id.clone(), Arc::new(network));
        true
    }

    pub fn get_network(&self, id: &str) -> Result<Arc<Network>> {
        if id.is_empty() {
            return Err(DriverError::BadRequest("invalid network id: empty".to_string()));
        }
        self.networks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("network not found: {}", id)))
    }

    pub fn contains_network(&self, id: &str) -> bool {
        self.networks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Remove a network and purge its endpoints.
    ///
    /// Returns the purged endpoints so their links can be released, or
    /// `None` if the network was not present.
    pub fn delete_network(&self, id: &str) -> Option<Vec<Endpoint>> {
        let removed = self
            .networks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)?;
        // Top-level lock is released here; only the network's lock is taken.
        Some(removed.drain_endpoints())
    }

    pub fn network_ids(&self) -> Vec<String> {
        self.networks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.networks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a link name for an endpoint. First writer wins; claiming a name
    /// the same endpoint already holds succeeds.
    ///
    /// Returns `true` if this call took the claim, `false` if `owner`
    /// already held it.
    pub fn claim_link(&self, name: &str, owner: LinkOwner) -> Result<bool> {
        let mut claims = self.link_claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.get(name) {
            Some(current) if *current != owner => Err(DriverError::Conflict(format!(
                "link name {} is already in use by endpoint {} in network {}",
                name, current.endpoint_id, current.network_id
            ))),
            Some(_) => Ok(false),
            None => {
                claims.insert(name.to_string(), owner);
                Ok(true)
            }
        }
    }

    /// Link names claimed by endpoints of `network_id`, with their owners.
    pub fn network_links(&self, network_id: &str) -> Vec<(String, LinkOwner)> {
        self.link_claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, owner)| owner.network_id == network_id)
            .map(|(name, owner)| (name.clone(), owner.clone()))
            .collect()
    }

    /// Release a claim held by `owner`. Claims held by others are kept.
    pub fn release_link(&self, name: &str, owner: &LinkOwner) -> bool {
        let mut claims = self.link_claims.lock().unwrap_or_else(|e| e.into_inner());
        if claims.get(name) == Some(owner) {
            claims.remove(name);
            true
        } else {
            false
        }
    }

    pub fn link_owner(&self, name: &str) -> Option<LinkOwner> {
        self.link_claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }
}
