// Shared fakes for the kernel and engine backends.
#![allow(dead_code)]

use anyhow::Result as AnyResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use macvlan_plugin::config::{DriverConfig, MacvlanMode};
use macvlan_plugin::discovery::{EngineIpam, EngineIpamConfig, EngineNetwork, NetworkLister};
use macvlan_plugin::error::{DriverError, Result};
use macvlan_plugin::link::LinkOps;
use macvlan_plugin::types::{
    CreateEndpointRequest, CreateNetworkRequest, EndpointInterface, IpamData, JoinRequest,
    GENERIC_OPTIONS_KEY,
};
use macvlan_plugin::MacvlanDriver;

/// A link as seen by the fake kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub index: u32,
    pub parent: Option<String>,
    pub mode: Option<MacvlanMode>,
    pub mtu: u32,
    pub up: bool,
}

/// In-memory `LinkOps`
#[derive(Debug)]
pub struct FakeLinks {
    links: Mutex<HashMap<String, FakeLink>>,
    next_index: AtomicU32,
    pub fail_add: AtomicBool,
    pub fail_up: AtomicBool,
    pub fail_delete: AtomicBool,
    pub deletes: AtomicUsize,
}

impl FakeLinks {
    /// Fake kernel with the given physical interfaces.
    pub fn with_host_interfaces(names: &[&str]) -> Arc<Self> {
        let fake = Self {
            links: Mutex::new(HashMap::new()),
            next_index: AtomicU32::new(2),
            fail_add: AtomicBool::new(false),
            fail_up: AtomicBool::new(false),
            fail_delete: AtomicBool::new(false),
            deletes: AtomicUsize::new(0),
        };
        for name in names {
            fake.add_host_interface(name);
        }
        Arc::new(fake)
    }

    pub fn add_host_interface(&self, name: &str) {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.links.lock().unwrap().insert(
            name.to_string(),
            FakeLink {
                index,
                parent: None,
                mode: None,
                mtu: 1500,
                up: true,
            },
        );
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.links.lock().unwrap().get(name).cloned()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.links.lock().unwrap().contains_key(name)
    }

    /// Names of the macvlan links currently present.
    pub fn macvlan_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, l)| l.parent.is_some())
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }
}

impl LinkOps for FakeLinks {
    fn link_index(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.links.lock().unwrap().get(name).map(|l| l.index))
    }

    fn add_macvlan(&self, parent: &str, name: &str, mode: MacvlanMode) -> Result<()> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(DriverError::Provisioning("RTNETLINK answers: Device or resource busy".into()));
        }
        let mut links = self.links.lock().unwrap();
        if !links.contains_key(parent) {
            return Err(DriverError::Provisioning(format!("Cannot find device \"{}\"", parent)));
        }
        if links.contains_key(name) {
            return Err(DriverError::Provisioning("RTNETLINK answers: File exists".into()));
        }
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        links.insert(
            name.to_string(),
            FakeLink {
                index,
                parent: Some(parent.to_string()),
                mode: Some(mode),
                mtu: 1500,
                up: false,
            },
        );
        Ok(())
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(name)
            .ok_or_else(|| DriverError::Provisioning(format!("Cannot find device \"{}\"", name)))?;
        link.mtu = mtu;
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        if self.fail_up.load(Ordering::SeqCst) {
            return Err(DriverError::Provisioning("RTNETLINK answers: Network is down".into()));
        }
        let mut links = self.links.lock().unwrap();
        let link = links
            .get_mut(name)
            .ok_or_else(|| DriverError::Provisioning(format!("Cannot find device \"{}\"", name)))?;
        link.up = true;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(DriverError::Provisioning("RTNETLINK answers: Operation not permitted".into()));
        }
        self.links
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DriverError::Provisioning(format!("Cannot find device \"{}\"", name)))
    }
}

/// `NetworkLister` returning a fixed list
#[derive(Debug, Default)]
pub struct StaticLister {
    pub networks: Mutex<Vec<EngineNetwork>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl StaticLister {
    pub fn new(networks: Vec<EngineNetwork>) -> Arc<Self> {
        Arc::new(Self {
            networks: Mutex::new(networks),
            ..Default::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        let lister = Self::default();
        lister.fail.store(true, Ordering::SeqCst);
        Arc::new(lister)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl NetworkLister for StaticLister {
    fn list_networks(&self) -> AnyResult<Vec<EngineNetwork>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("Cannot connect to the Docker daemon");
        }
        Ok(self.networks.lock().unwrap().clone())
    }
}

pub fn engine_network(
    name: &str,
    id: &str,
    subnet: &str,
    gateway: &str,
    options: &[(&str, &str)],
) -> EngineNetwork {
    EngineNetwork {
        name: name.to_string(),
        id: id.to_string(),
        driver: "macvlan".to_string(),
        ipam: EngineIpam {
            driver: "default".to_string(),
            config: Some(vec![EngineIpamConfig {
                subnet: subnet.to_string(),
                gateway: gateway.to_string(),
            }]),
        },
        options: Some(
            options
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
    }
}

pub const NETWORK_ID: &str = "4ad1b8e3c0a94f0c9c2e2d7f5b9f0d11";
pub const ENDPOINT_ID: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90";

pub fn config() -> DriverConfig {
    DriverConfig::new_default("eth1").unwrap()
}

pub fn driver_with(
    config: DriverConfig,
    links: Arc<FakeLinks>,
    lister: Arc<StaticLister>,
) -> MacvlanDriver {
    MacvlanDriver::new(config, links, lister)
}

/// Driver on a fake host with `eth1` and an engine with no networks.
pub fn driver() -> (MacvlanDriver, Arc<FakeLinks>, Arc<StaticLister>) {
    let links = FakeLinks::with_host_interfaces(&["lo", "eth0", "eth1"]);
    let lister = StaticLister::new(Vec::new());
    (
        driver_with(config(), Arc::clone(&links), Arc::clone(&lister)),
        links,
        lister,
    )
}

pub fn create_network_request(
    id: &str,
    pool: &str,
    gateway: &str,
    host_iface: Option<&str>,
) -> CreateNetworkRequest {
    let mut req = CreateNetworkRequest {
        network_id: id.to_string(),
        ipv4_data: vec![IpamData {
            address_space: "LocalDefault".to_string(),
            pool: pool.to_string(),
            gateway: gateway.to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    if let Some(iface) = host_iface {
        req.options.insert(
            GENERIC_OPTIONS_KEY.to_string(),
            serde_json::json!({ "host_iface": iface }),
        );
    }
    req
}

pub fn create_endpoint_request(network_id: &str, endpoint_id: &str, address: &str) -> CreateEndpointRequest {
    CreateEndpointRequest {
        network_id: network_id.to_string(),
        endpoint_id: endpoint_id.to_string(),
        interface: Some(EndpointInterface {
            address: address.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn join_request(network_id: &str, endpoint_id: &str) -> JoinRequest {
    JoinRequest {
        network_id: network_id.to_string(),
        endpoint_id: endpoint_id.to_string(),
        sandbox_key: format!("/var/run/docker/netns/{}", &endpoint_id[..endpoint_id.len().min(12)]),
        ..Default::default()
    }
}
