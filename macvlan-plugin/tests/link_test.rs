mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::FakeLinks;
use macvlan_plugin::config::MacvlanMode;
use macvlan_plugin::error::DriverError;
use macvlan_plugin::link::{derive_link_name, IpLinkOps, LinkOps, Provisioner};

#[test]
fn test_derive_link_name() {
    assert_eq!(derive_link_name("a1b2c3d4e5f6"), "a1b2c");
    assert_eq!(derive_link_name("abcde"), "abcde");
    // Short ids must not overrun.
    assert_eq!(derive_link_name("ab"), "ab");
    assert_eq!(derive_link_name(""), "");
    // Characters, not bytes.
    assert_eq!(derive_link_name("éééééé"), "ééééé");
}

#[test]
fn test_create_link() -> Result<(), Box<dyn std::error::Error>> {
    let links = FakeLinks::with_host_interfaces(&["eth1"]);
    let provisioner = Provisioner::new(links.clone());

    let handle = provisioner.create_link("eth1", "a1b2c", MacvlanMode::Bridge, 1500)?;

    assert_eq!(handle.name, "a1b2c");
    assert_eq!(handle.parent, "eth1");
    assert_eq!(handle.parent_index, links.link("eth1").unwrap().index);
    assert_eq!(handle.mtu, 1500);

    let link = links.link("a1b2c").unwrap();
    assert_eq!(link.parent.as_deref(), Some("eth1"));
    assert_eq!(link.mode, Some(MacvlanMode::Bridge));
    assert_eq!(link.mtu, 1500);
    assert!(link.up);
    assert_eq!(link.index, handle.index);

    Ok(())
}

#[test]
fn test_create_link_missing_parent() {
    let links = FakeLinks::with_host_interfaces(&["eth0"]);
    let provisioner = Provisioner::new(links.clone());

    let err = provisioner
        .create_link("eth1", "a1b2c", MacvlanMode::Bridge, 1500)
        .unwrap_err();
    assert!(matches!(err, DriverError::Provisioning(_)));
    assert!(links.macvlan_names().is_empty());
}

#[test]
fn test_create_link_rejects_unsupported_mode() {
    let links = FakeLinks::with_host_interfaces(&["eth1"]);
    let provisioner = Provisioner::new(links.clone());

    for mode in [MacvlanMode::Private, MacvlanMode::Vepa, MacvlanMode::Passthru] {
        let err = provisioner.create_link("eth1", "a1b2c", mode, 1500).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }
    assert!(matches!(
        provisioner.create_link("eth1", "a1b2c", MacvlanMode::Bridge, 67),
        Err(DriverError::Validation(_))
    ));
    assert!(links.macvlan_names().is_empty());
}

#[test]
fn test_create_link_stale_name() {
    let links = FakeLinks::with_host_interfaces(&["eth1"]);
    let provisioner = Provisioner::new(links.clone());
    provisioner
        .create_link("eth1", "a1b2c", MacvlanMode::Bridge, 1500)
        .unwrap();

    let err = provisioner
        .create_link("eth1", "a1b2c", MacvlanMode::Bridge, 1500)
        .unwrap_err();
    assert!(matches!(err, DriverError::Provisioning(_)));
    // The existing link is left alone.
    assert!(links.has_link("a1b2c"));
}

#[test]
fn test_create_link_rolls_back_when_up_fails() {
    let links = FakeLinks::with_host_interfaces(&["eth1"]);
    links.fail_up.store(true, Ordering::SeqCst);
    let provisioner = Provisioner::new(links.clone());

    let err = provisioner
        .create_link("eth1", "a1b2c", MacvlanMode::Bridge, 1500)
        .unwrap_err();
    assert!(matches!(err, DriverError::Provisioning(_)));
    assert!(!links.has_link("a1b2c"));
}

#[test]
fn test_delete_link() -> Result<(), Box<dyn std::error::Error>> {
    let links = FakeLinks::with_host_interfaces(&["eth1"]);
    let provisioner = Provisioner::new(links.clone());
    provisioner.create_link("eth1", "a1b2c", MacvlanMode::Bridge, 9000)?;

    assert!(provisioner.link_exists("a1b2c")?);
    provisioner.delete_link("a1b2c")?;
    assert!(!provisioner.link_exists("a1b2c")?);

    Ok(())
}

#[test]
fn test_delete_missing_link_is_not_found() {
    let links = FakeLinks::with_host_interfaces(&["eth1"]);
    let provisioner = Provisioner::new(links.clone());

    let err = provisioner.delete_link("zzzzz").unwrap_err();
    assert!(err.is_not_found());
    // Existence is checked before any delete call reaches the kernel.
    assert_eq!(links.deletes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_ip_link_ops_missing_interface() -> Result<(), Box<dyn std::error::Error>> {
    let ops: Arc<dyn LinkOps> = Arc::new(IpLinkOps::new());
    assert_eq!(ops.link_index("nosuchif0")?, None);
    Ok(())
}

#[test]
fn test_ip_link_ops_loopback_exists() -> Result<(), Box<dyn std::error::Error>> {
    let ops = IpLinkOps::new();
    assert!(ops.link_index("lo")?.is_some());
    Ok(())
}
