// Exercises the real `ip` backend against a dummy parent interface.

use std::process::Command;
use std::sync::Arc;

use macvlan_plugin::config::{DriverConfig, MacvlanMode};
use macvlan_plugin::discovery::{EngineNetwork, NetworkLister};
use macvlan_plugin::link::{IpLinkOps, LinkOps, Provisioner};
use macvlan_plugin::types::{
    CreateEndpointRequest, CreateNetworkRequest, EndpointInterface, EndpointRequest, IpamData,
    JoinRequest, GENERIC_OPTIONS_KEY,
};
use macvlan_plugin::MacvlanDriver;

struct NoEngine;

impl NetworkLister for NoEngine {
    fn list_networks(&self) -> anyhow::Result<Vec<EngineNetwork>> {
        Ok(Vec::new())
    }
}

fn ip(args: &[&str]) -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new("ip").args(args).output()?;
    if !output.status.success() {
        return Err(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(())
}

// Function to create a dummy parent interface
fn create_dummy(name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let _ = Command::new("ip").args(["link", "delete", "dev", name]).output();
    ip(&["link", "add", name, "type", "dummy"])?;
    ip(&["link", "set", "dev", name, "up"])
}

fn delete_dummy(name: &str) {
    let _ = Command::new("ip").args(["link", "delete", "dev", name]).output();
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

// This test requires root privileges to run
#[test]
#[ignore]
fn test_provisioner_with_ip_command() -> Result<(), Box<dyn std::error::Error>> {
    if !is_root() {
        println!("Skipping test_provisioner_with_ip_command: not running as root");
        return Ok(());
    }

    let parent = "mvtest0";
    create_dummy(parent)?;

    let ops = Arc::new(IpLinkOps::new());
    let provisioner = Provisioner::new(ops.clone());

    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        let handle = provisioner.create_link(parent, "mvt01", MacvlanMode::Bridge, 1400)?;
        assert_eq!(handle.name, "mvt01");
        assert_eq!(Some(handle.index), ops.link_index("mvt01")?);

        // Same name again is a stale link.
        assert!(provisioner
            .create_link(parent, "mvt01", MacvlanMode::Bridge, 1400)
            .is_err());

        provisioner.delete_link("mvt01")?;
        assert!(!provisioner.link_exists("mvt01")?);
        assert!(provisioner.delete_link("mvt01").unwrap_err().is_not_found());
        Ok(())
    })();

    delete_dummy(parent);
    result
}

// This test requires root privileges to run
#[test]
#[ignore]
fn test_driver_lifecycle_with_ip_command() -> Result<(), Box<dyn std::error::Error>> {
    if !is_root() {
        println!("Skipping test_driver_lifecycle_with_ip_command: not running as root");
        return Ok(());
    }

    let parent = "mvtest1";
    create_dummy(parent)?;

    let ops = Arc::new(IpLinkOps::new());
    let driver = MacvlanDriver::new(DriverConfig::new_default(parent)?, ops.clone(), Arc::new(NoEngine));
    let endpoint_id = uuid::Uuid::new_v4().simple().to_string();
    let link = &endpoint_id[..5];

    let result = (|| -> Result<(), Box<dyn std::error::Error>> {
        let mut create = CreateNetworkRequest {
            network_id: "integration-net".to_string(),
            ipv4_data: vec![IpamData {
                pool: "10.99.0.0/24".to_string(),
                gateway: "10.99.0.1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        create.options.insert(
            GENERIC_OPTIONS_KEY.to_string(),
            serde_json::json!({ "host_iface": parent }),
        );
        driver.create_network(&create)?;

        driver.create_endpoint(&CreateEndpointRequest {
            network_id: "integration-net".to_string(),
            endpoint_id: endpoint_id.clone(),
            interface: Some(EndpointInterface {
                address: "10.99.0.10/24".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })?;

        let joined = driver.join(&JoinRequest {
            network_id: "integration-net".to_string(),
            endpoint_id: endpoint_id.clone(),
            ..Default::default()
        })?;
        assert_eq!(joined.interface_name.src_name, link);
        assert!(ops.link_index(link)?.is_some());

        driver.delete_endpoint(&EndpointRequest {
            network_id: "integration-net".to_string(),
            endpoint_id: endpoint_id.clone(),
            ..Default::default()
        })?;
        assert!(ops.link_index(link)?.is_none());
        Ok(())
    })();

    let _ = ops.delete(link);
    delete_dummy(parent);
    result
}
