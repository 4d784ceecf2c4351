use ipnetwork::Ipv4Network;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{DriverConfig, MacvlanMode};
use crate::discovery::{NetworkLister, Reconciler};
use crate::error::{DriverError, Result};
use crate::link::{derive_link_name, LinkOps, Provisioner, REMEDIATION_HINTS};
use crate::state::{Endpoint, EndpointState, LinkOwner, Network, Registry};
use crate::types::{
    CapabilitiesResponse, CreateEndpointRequest, CreateEndpointResponse, CreateNetworkRequest,
    DeleteEndpointRequest, DeleteNetworkRequest, EmptyResponse, EndpointInterface, InfoRequest,
    InfoResponse, InterfaceName, IpamData, JoinRequest, JoinResponse, LeaveRequest,
    CONTAINER_IFACE_PREFIX, GENERIC_OPTIONS_KEY,
};

/// Driver options from `docker network create -o key=value`
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DriverOptions {
    /// Parent interface for the network's macvlan links
    pub host_iface: Option<String>,
    /// Macvlan mode for the network
    pub macvlan_mode: Option<String>,
}

impl DriverOptions {
    /// Decode the generic option map nested in a request's `Options`.
    ///
    /// Any shape other than an object of strings is a validation failure.
    pub fn decode(options: &HashMap<String, Value>) -> Result<Self> {
        match options.get(GENERIC_OPTIONS_KEY) {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(generic @ Value::Object(_)) => {
                for (key, val) in generic.as_object().into_iter().flatten() {
                    debug!("Libnetwork Opts Sent: [ {} ] Value: [ {} ]", key, val);
                }
                Self::deserialize(generic).map_err(|e| {
                    DriverError::Validation(format!("invalid driver options: {}", e))
                })
            }
            Some(other) => Err(DriverError::Validation(format!(
                "driver options under {} must be an object, got {}",
                GENERIC_OPTIONS_KEY, other
            ))),
        }
    }
}

/// First IPv4 pool wins.
fn parse_ipam(data: &[IpamData]) -> Result<(Option<Ipv4Network>, String)> {
    let Some(v4) = data.first() else {
        return Ok((None, String::new()));
    };
    if data.len() > 1 {
        warn!(
            "{} IPv4 pools supplied, using the first [ {} ]",
            data.len(),
            v4.pool
        );
    }

    let pool = v4.pool.trim();
    let cidr = if pool.is_empty() {
        None
    } else {
        let net = Ipv4Network::from_str(pool).map_err(|e| {
            DriverError::Validation(format!("invalid IPv4 pool [ {} ]: {}", pool, e))
        })?;
        // Normalise to the network address.
        Some(Ipv4Network::new(net.network(), net.prefix()).map_err(|e| {
            DriverError::Validation(format!("invalid IPv4 pool [ {} ]: {}", pool, e))
        })?)
    };

    // The engine may hand the gateway over in CIDR form.
    let gateway = v4.gateway.split('/').next().unwrap_or_default().trim();
    if !gateway.is_empty() {
        gateway.parse::<Ipv4Addr>().map_err(|e| {
            DriverError::Validation(format!("invalid gateway [ {} ]: {}", v4.gateway, e))
        })?;
    }

    Ok((cidr, gateway.to_string()))
}

/// Parse an endpoint address. A bare address takes the network's prefix.
fn parse_endpoint_address(raw: &str, cidr: Option<Ipv4Network>) -> Result<Ipv4Network> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DriverError::Validation(
            "unable to obtain an IP address, none was supplied by the engine's IPAM".to_string(),
        ));
    }
    let invalid = |e: &dyn std::fmt::Display| {
        DriverError::Validation(format!("invalid IPv4 address [ {} ]: {}", raw, e))
    };
    if raw.contains('/') {
        return Ipv4Network::from_str(raw).map_err(|e| invalid(&e));
    }
    let ip = raw.parse::<Ipv4Addr>().map_err(|e| invalid(&e))?;
    let prefix = cidr.map(|c| c.prefix()).unwrap_or(32);
    Ipv4Network::new(ip, prefix).map_err(|e| invalid(&e))
}

fn require_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(DriverError::BadRequest(format!("invalid {} id: empty", kind)));
    }
    Ok(())
}

/// Macvlan network driver: the lifecycle handler behind every RPC
pub struct MacvlanDriver {
    config: Arc<DriverConfig>,
    registry: Registry,
    provisioner: Provisioner,
    reconciler: Reconciler,
}

impl MacvlanDriver {
    /// Create a driver from its configuration and kernel/engine backends.
    pub fn new(
        config: DriverConfig,
        links: Arc<dyn LinkOps>,
        lister: Arc<dyn NetworkLister>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Registry::new(config.single_network),
            provisioner: Provisioner::new(links),
            reconciler: Reconciler::new(lister, config.mode),
            config,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// The driver only ever works on the local host.
    pub fn capabilities(&self) -> CapabilitiesResponse {
        CapabilitiesResponse::local()
    }

    /// Register a network from the engine's IPAM data and driver options.
    pub fn create_network(&self, req: &CreateNetworkRequest) -> Result<EmptyResponse> {
        debug!("Network Create Called: [ {:?} ]", req);
        require_id("network", &req.network_id)?;

        let (cidr, gateway) = parse_ipam(&req.ipv4_data)?;
        let opts = DriverOptions::decode(&req.options)?;

        let parent = opts
            .host_iface
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.config.host_interface.as_str());
        let mode = match opts.macvlan_mode.as_deref() {
            Some(m) => m.parse::<MacvlanMode>()?,
            None => self.config.mode,
        };
        let cidr = cidr.or(self.config.subnet);

        let network = Network::new(&req.network_id, cidr, &gateway, parent, mode);
        self.registry.add_network(network)?;

        info!(
            "Created network [ {} ] cidr [ {} ] gateway [ {} ] parent [ {} ] mode [ {} ]",
            req.network_id,
            cidr.map(|c| c.to_string()).unwrap_or_default(),
            gateway,
            parent,
            mode
        );
        Ok(EmptyResponse::default())
    }

    /// Remove a network, purging its endpoints and their links.
    pub fn delete_network(&self, req: &DeleteNetworkRequest) -> Result<EmptyResponse> {
        debug!("Delete network request: {:?}", req);
        require_id("network", &req.network_id)?;

        let endpoints = self.registry.delete_network(&req.network_id).ok_or_else(|| {
            DriverError::NotFound(format!("network {} not found", req.network_id))
        })?;

        for ep in endpoints {
            if let Some(link) = ep.host_interface.as_deref() {
                self.release_endpoint_link(&req.network_id, &ep.id, link);
            }
        }
        // Joins without an endpoint record still hold a claim and a link.
        for (link, owner) in self.registry.network_links(&req.network_id) {
            self.release_endpoint_link(&owner.network_id, &owner.endpoint_id, &link);
        }

        info!("Destroyed network [ {} ]", req.network_id);
        Ok(EmptyResponse::default())
    }

    /// Record endpoint metadata and hand back the address and derived MAC.
    pub fn create_endpoint(&self, req: &CreateEndpointRequest) -> Result<CreateEndpointResponse> {
        debug!("Create endpoint request: {:?}", req);
        require_id("network", &req.network_id)?;
        require_id("endpoint", &req.endpoint_id)?;

        let network = self.registry.get_network(&req.network_id)?;

        let raw = req
            .interface
            .as_ref()
            .map(|i| i.address.as_str())
            .unwrap_or_default();
        let address = parse_endpoint_address(raw, network.cidr())?;

        let endpoint = Endpoint::new(&req.endpoint_id, address);
        let mac = endpoint.mac;
        network.add_endpoint(endpoint)?;

        info!("Allocated container IP: [ {} ] MAC: [ {} ]", address, mac);

        Ok(CreateEndpointResponse {
            interface: Some(EndpointInterface {
                address: address.to_string(),
                mac_address: mac.to_string(),
                ..Default::default()
            }),
        })
    }

    /// Remove an endpoint and its host link. Never fails: problems are
    /// logged only.
    pub fn delete_endpoint(&self, req: &DeleteEndpointRequest) -> Result<EmptyResponse> {
        debug!("Delete endpoint request: {:?}", req);
        if req.endpoint_id.trim().is_empty() {
            warn!("Delete endpoint request without an endpoint id, nothing to do");
            return Ok(EmptyResponse::default());
        }

        let network = self.registry.get_network(&req.network_id).ok();
        let recorded = network
            .as_ref()
            .and_then(|n| n.get_endpoint(&req.endpoint_id).ok())
            .and_then(|ep| ep.host_interface);
        let link = recorded.unwrap_or_else(|| derive_link_name(&req.endpoint_id));

        self.release_endpoint_link(&req.network_id, &req.endpoint_id, &link);

        if let Some(network) = network {
            network.delete_endpoint(&req.endpoint_id);
        }
        debug!("Delete endpoint {}", req.endpoint_id);
        Ok(EmptyResponse::default())
    }

    /// Delete an endpoint's link unless another endpoint holds the name,
    /// then drop this endpoint's claim.
    fn release_endpoint_link(&self, network_id: &str, endpoint_id: &str, link: &str) {
        let owner = LinkOwner::new(network_id, endpoint_id);
        if let Some(current) = self.registry.link_owner(link) {
            if current != owner {
                warn!(
                    "Link [ {} ] belongs to endpoint {}, not removing it for {}",
                    link, current.endpoint_id, endpoint_id
                );
                return;
            }
        }

        match self.provisioner.delete_link(link) {
            Ok(()) => info!("Removed macvlan link [ {} ] of endpoint {}", link, endpoint_id),
            // Usually the link was moved into the container namespace and
            // went away with it.
            Err(DriverError::NotFound(msg)) => debug!("{}", msg),
            Err(e) => error!("unable to delete the macvlan link [ {} ]: {}", link, e),
        }
        self.registry.release_link(link, &owner);
    }

    /// Operational data for an endpoint.
    pub fn endpoint_info(&self, req: &InfoRequest) -> Result<InfoResponse> {
        debug!("Endpoint info request: {:?}", req);
        require_id("network", &req.network_id)?;
        let ep = self
            .registry
            .get_network(&req.network_id)?
            .get_endpoint(&req.endpoint_id)?;

        let mut value = HashMap::new();
        value.insert("address".to_string(), ep.address.to_string());
        value.insert("mac_address".to_string(), ep.mac.to_string());
        value.insert(
            "state".to_string(),
            match ep.state {
                EndpointState::Created => "created",
                EndpointState::Joined => "joined",
            }
            .to_string(),
        );
        if let Some(link) = ep.host_interface {
            value.insert("host_interface".to_string(), link);
        }
        Ok(InfoResponse { value })
    }

    /// Create the endpoint's macvlan link for hand-off into the sandbox.
    pub fn join(&self, req: &JoinRequest) -> Result<JoinResponse> {
        debug!("Join request: {:?}", req);
        require_id("network", &req.network_id)?;
        require_id("endpoint", &req.endpoint_id)?;

        let network = match self.registry.get_network(&req.network_id) {
            Ok(network) => network,
            Err(e) if e.is_not_found() => {
                // Networks created before the driver started.
                if let Err(err) = self.reconciler.reconcile(&self.registry) {
                    error!("{:#}", err);
                }
                self.registry.get_network(&req.network_id).map_err(|_| {
                    DriverError::NotFound(format!(
                        "error getting network ID [ {} ]. Run 'docker network ls' or 'docker network create'",
                        req.network_id
                    ))
                })?
            }
            Err(e) => return Err(e),
        };

        if network.parent_interface().is_empty() {
            return Err(DriverError::Validation(
                "Required macvlan parent interface is missing, please recreate the network specifying the -o host_iface=ethX"
                    .to_string(),
            ));
        }

        // Unique name while still in the driver namespace.
        let link_name = derive_link_name(&req.endpoint_id);
        let owner = LinkOwner::new(&req.network_id, &req.endpoint_id);
        let claimed = self.registry.claim_link(&link_name, owner.clone())?;

        let handle = match self.provisioner.create_link(
            network.parent_interface(),
            &link_name,
            network.mode(),
            self.config.mtu,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                // A claim held from an earlier Join still guards a live link.
                if claimed {
                    self.registry.release_link(&link_name, &owner);
                }
                if matches!(err, DriverError::Provisioning(_)) {
                    warn!("Failed to create the macvlan link [ {} ]: {}", link_name, err);
                    for hint in REMEDIATION_HINTS {
                        warn!("{}", hint);
                    }
                }
                return Err(err);
            }
        };

        // DeleteNetwork may have run while the link was being created.
        if !self.registry.contains_network(&req.network_id) {
            self.release_endpoint_link(&req.network_id, &req.endpoint_id, &handle.name);
            return Err(DriverError::NotFound(format!(
                "network {} was deleted during join",
                req.network_id
            )));
        }

        if let Err(e) = network.mark_joined(&req.endpoint_id, &handle.name, &req.sandbox_key) {
            debug!("Joined endpoint has no metadata record: {}", e);
        }

        let gateway = self
            .config
            .gateway_override
            .map(|gw| gw.to_string())
            .unwrap_or_else(|| network.gateway().to_string());

        let res = JoinResponse {
            interface_name: InterfaceName {
                src_name: handle.name,
                dst_prefix: CONTAINER_IFACE_PREFIX.to_string(),
            },
            gateway,
            disable_gateway_service: true,
            ..Default::default()
        };
        debug!(
            "Join endpoint {}:{} to {}: {:?}",
            req.network_id, req.endpoint_id, req.sandbox_key, res
        );
        Ok(res)
    }

    /// Nothing to undo: the link is removed at DeleteEndpoint.
    pub fn leave(&self, req: &LeaveRequest) -> Result<EmptyResponse> {
        debug!("Leave {}:{}", req.network_id, req.endpoint_id);
        Ok(EmptyResponse::default())
    }

    /// Not used by local scoped drivers.
    pub fn discover_new(&self) -> Result<EmptyResponse> {
        Ok(EmptyResponse::default())
    }

    /// Not used by local scoped drivers.
    pub fn discover_delete(&self) -> Result<EmptyResponse> {
        Ok(EmptyResponse::default())
    }

    pub fn program_external_connectivity(&self) -> Result<EmptyResponse> {
        Ok(EmptyResponse::default())
    }

    pub fn revoke_external_connectivity(&self) -> Result<EmptyResponse> {
        Ok(EmptyResponse::default())
    }
}
