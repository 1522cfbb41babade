//! A small CRB fabric used across tests: one route-reflecting spine
//! gateway and two access leaves.

use super::tests::fq;
use super::*;
use crate::alloc::IdRange;

pub const FABRIC: &str = "fab-1";
pub const SPINE: &str = "pr-spine";
pub const LEAF1: &str = "pr-leaf1";
pub const LEAF2: &str = "pr-leaf2";
pub const ESI: &str = "33:33:33:33:33:33:33:33:33:33";

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn router(uuid: &str, name: &str, role: &str, rb: &[&str], loopback: &str, bgp: &str) -> IntentObject {
    IntentObject::PhysicalRouter(PhysicalRouterObject {
        uuid: uuid.into(),
        fq_name: fq(&["default-global-system-config", name]),
        vendor: "juniper".into(),
        product: "qfx5110".into(),
        device_family: "junos-qfx".into(),
        management_ip: format!("192.168.0.{}", &loopback[loopback.len() - 1..]),
        loopback_ip: Some(loopback.into()),
        physical_role: Some(role.into()),
        routing_bridging_roles: strings(rb),
        fabric: Some(FABRIC.into()),
        node_profile: Some("np-1".into()),
        bgp_router: Some(bgp.into()),
        vnc_managed: true,
        credentials: Some(DeviceCredentials {
            username: "root".into(),
            password: "secret".into(),
        }),
        ..Default::default()
    })
}

fn bgp_router(uuid: &str, address: &str, cluster: Option<u32>, peers: &[&str]) -> IntentObject {
    IntentObject::BgpRouter(BgpRouterObject {
        uuid: uuid.into(),
        fq_name: fq(&["default-domain", "default-project", "ip-fabric", "__default__", uuid]),
        address: Some(address.into()),
        autonomous_system: 64512,
        identifier: Some(address.into()),
        hold_time: Some(90),
        address_families: strings(&["route-target", "inet-vpn", "evpn", "inet-labeled"]),
        cluster_id: cluster,
        peers: peers
            .iter()
            .map(|p| BgpPeering {
                bgp_router: p.to_string(),
                address_families: strings(&["route-target", "evpn", "inet-vpn"]),
                auth_key: None,
            })
            .collect(),
        ..Default::default()
    })
}

fn port(uuid: &str, pr: &str, name: &str, esi: Option<&str>) -> IntentObject {
    IntentObject::PhysicalInterface(PhysicalInterfaceObject {
        uuid: uuid.into(),
        fq_name: fq(&["default-global-system-config", pr, name]),
        physical_router: pr.into(),
        esi: esi.map(str::to_string),
        links: vec![],
    })
}

fn unit(uuid: &str, pi: &str, name: &str, tag: u32, vmi: &str) -> IntentObject {
    IntentObject::LogicalInterface(LogicalInterfaceObject {
        uuid: uuid.into(),
        fq_name: fq(&["default-global-system-config", pi, name]),
        physical_interface: pi.into(),
        vlan_tag: tag,
        virtual_machine_interfaces: vec![vmi.into()],
    })
}

fn vmi(uuid: &str, vn: &str, owner: Option<&str>) -> IntentObject {
    IntentObject::VirtualMachineInterface(VirtualMachineInterfaceObject {
        uuid: uuid.into(),
        fq_name: fq(&["default-domain", "admin", uuid]),
        virtual_network: vn.into(),
        device_owner: owner.map(str::to_string),
    })
}

fn network(uuid: &str, name: &str, nid: u32, vni: u32, rt: &str, subnet: Option<(&str, &str)>) -> IntentObject {
    IntentObject::VirtualNetwork(VirtualNetworkObject {
        uuid: uuid.into(),
        fq_name: fq(&["default-domain", "admin", name]),
        network_id: nid,
        vni: Some(vni),
        forwarding_mode: ForwardingMode::L2L3,
        route_targets: vec![rt.into()],
        subnets: subnet
            .map(|(prefix, gw)| {
                vec![Subnet {
                    prefix: prefix.into(),
                    gateway: Some(gw.into()),
                }]
            })
            .unwrap_or_default(),
        ..Default::default()
    })
}

pub fn fabric_objects() -> Vec<IntentObject> {
    vec![
        IntentObject::Fabric(FabricObject {
            uuid: FABRIC.into(),
            fq_name: fq(&["default-global-system-config", "fab1"]),
            management_subnets: strings(&["192.168.0.0/24"]),
            loopback_subnets: strings(&["10.10.0.0/24"]),
            fabric_subnets: strings(&["10.1.0.0/24"]),
            pnf_servicechain_subnets: strings(&["10.99.0.0/24"]),
            ebgp_asn_pool: vec![IdRange::new(64600, 64699)],
            encapsulation_priorities: strings(&["VXLAN", "MPLSoUDP"]),
            node_profiles: strings(&["np-1"]),
            credentials: None,
        }),
        IntentObject::NodeProfile(NodeProfileObject {
            uuid: "np-1".into(),
            fq_name: fq(&["default-global-system-config", "juniper-qfx5k"]),
            role_configs: vec![],
            job_template: strings(&["default-global-system-config", "fabric_config_template"]),
        }),
        bgp_router("br-spine", "10.10.0.1", Some(100), &["br-leaf1", "br-leaf2"]),
        bgp_router("br-leaf1", "10.10.0.2", None, &["br-spine", "br-leaf2"]),
        bgp_router("br-leaf2", "10.10.0.3", None, &["br-spine", "br-leaf1"]),
        router(SPINE, "spine1", "spine", &["CRB-Gateway", "Route-Reflector"], "10.10.0.1", "br-spine"),
        router(LEAF1, "leaf1", "leaf", &["CRB-Access"], "10.10.0.2", "br-leaf1"),
        router(LEAF2, "leaf2", "leaf", &["CRB-Access"], "10.10.0.3", "br-leaf2"),
        network(
            "vn-1",
            "vn1",
            5,
            2000,
            "target:64512:8000005",
            Some(("10.20.0.0/24", "10.20.0.1")),
        ),
        network("vn-native", "vn-native", 6, 2000, "target:64512:8000006", None),
        network(
            "vn-lr-internal",
            "__contrail_lr_internal_vn_lr-1__",
            10,
            3000,
            "target:64512:8000010",
            None,
        ),
        vmi("vmi-1", "vn-1", None),
        vmi("vmi-2", "vn-1", None),
        vmi("vmi-native", "vn-native", None),
        vmi("vmi-lr", "vn-1", Some("network:router_interface")),
        port("pi-1", LEAF1, "xe-0/0/1", Some(ESI)),
        port("pi-2", LEAF1, "xe-0/0/2", Some(ESI)),
        port("pi-native", LEAF2, "intf-native", None),
        unit("li-1", "pi-1", "xe-0/0/1.100", 100, "vmi-1"),
        unit("li-2", "pi-2", "xe-0/0/2.100", 100, "vmi-2"),
        unit("li-native", "pi-native", "intf-native.0", 0, "vmi-native"),
        IntentObject::LogicalRouter(LogicalRouterObject {
            uuid: "lr-1".into(),
            fq_name: fq(&["default-domain", "admin", "lr1"]),
            virtual_machine_interfaces: strings(&["vmi-lr"]),
            physical_routers: strings(&[SPINE]),
            external_networks: vec![],
            route_table: None,
        }),
    ]
}

pub fn fabric_graph() -> Graph {
    match Graph::build_validated(fabric_objects()) {
        Ok(g) => g,
        Err(e) => panic!("fixture graph is invalid: {}", e),
    }
}
