use serde::{Deserialize, Serialize};

use crate::alloc::IdRange;

fn default_true() -> bool {
    true
}

/// Forwarding mode of a virtual network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForwardingMode {
    #[serde(rename = "l2")]
    L2,
    #[serde(rename = "l3")]
    L3,
    #[default]
    #[serde(rename = "l2_l3")]
    L2L3,
}

impl ForwardingMode {
    pub fn has_l2(self) -> bool {
        matches!(self, ForwardingMode::L2 | ForwardingMode::L2L3)
    }

    pub fn has_l3(self) -> bool {
        matches!(self, ForwardingMode::L3 | ForwardingMode::L2L3)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Fabric with its shared namespaces
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FabricObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub management_subnets: Vec<String>,
    #[serde(default)]
    pub loopback_subnets: Vec<String>,
    #[serde(default)]
    pub fabric_subnets: Vec<String>,
    #[serde(default)]
    pub pnf_servicechain_subnets: Vec<String>,
    #[serde(default)]
    pub ebgp_asn_pool: Vec<IdRange>,
    #[serde(default)]
    pub encapsulation_priorities: Vec<String>,
    #[serde(default)]
    pub node_profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<DeviceCredentials>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalRouterObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub device_family: String,
    #[serde(default)]
    pub management_ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loopback_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataplane_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_role: Option<String>,
    #[serde(default)]
    pub routing_bridging_roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fabric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bgp_router: Option<String>,
    #[serde(default = "default_true")]
    pub vnc_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<DeviceCredentials>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalInterfaceObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    pub physical_router: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub esi: Option<String>,
    /// Peer interfaces discovered by topology import
    #[serde(default)]
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicalInterfaceObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    pub physical_interface: String,
    #[serde(default)]
    pub vlan_tag: u32,
    #[serde(default)]
    pub virtual_machine_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualNetworkObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    pub network_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vni: Option<u32>,
    #[serde(default)]
    pub forwarding_mode: ForwardingMode,
    /// Imported and exported
    #[serde(default)]
    pub route_targets: Vec<String>,
    #[serde(default)]
    pub import_route_targets: Vec<String>,
    #[serde(default)]
    pub export_route_targets: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default)]
    pub router_external: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualMachineInterfaceObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    pub virtual_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_owner: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicalRouterObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub virtual_machine_interfaces: Vec<String>,
    #[serde(default)]
    pub physical_routers: Vec<String>,
    #[serde(default)]
    pub external_networks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_table: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTableObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BgpPeering {
    pub bgp_router: String,
    #[serde(default)]
    pub address_families: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BgpRouterObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub autonomous_system: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_autonomous_system: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub address_families: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
    #[serde(default)]
    pub peers: Vec<BgpPeering>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeProfileObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub role_configs: Vec<RoleConfig>,
    #[serde(default)]
    pub job_template: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceInstanceObject {
    pub uuid: String,
    pub fq_name: Vec<String>,
    #[serde(default)]
    pub physical_routers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_network: Option<String>,
}

/// One decoded intent object, tagged by type
#[derive(Debug, Clone)]
pub enum IntentObject {
    Fabric(FabricObject),
    PhysicalRouter(PhysicalRouterObject),
    PhysicalInterface(PhysicalInterfaceObject),
    LogicalInterface(LogicalInterfaceObject),
    VirtualNetwork(VirtualNetworkObject),
    VirtualMachineInterface(VirtualMachineInterfaceObject),
    LogicalRouter(LogicalRouterObject),
    RouteTable(RouteTableObject),
    BgpRouter(BgpRouterObject),
    NodeProfile(NodeProfileObject),
    ServiceInstance(ServiceInstanceObject),
}

impl IntentObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            IntentObject::Fabric(_) => "fabric",
            IntentObject::PhysicalRouter(_) => "physical-router",
            IntentObject::PhysicalInterface(_) => "physical-interface",
            IntentObject::LogicalInterface(_) => "logical-interface",
            IntentObject::VirtualNetwork(_) => "virtual-network",
            IntentObject::VirtualMachineInterface(_) => "virtual-machine-interface",
            IntentObject::LogicalRouter(_) => "logical-router",
            IntentObject::RouteTable(_) => "route-table",
            IntentObject::BgpRouter(_) => "bgp-router",
            IntentObject::NodeProfile(_) => "node-profile",
            IntentObject::ServiceInstance(_) => "service-instance",
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            IntentObject::Fabric(o) => &o.uuid,
            IntentObject::PhysicalRouter(o) => &o.uuid,
            IntentObject::PhysicalInterface(o) => &o.uuid,
            IntentObject::LogicalInterface(o) => &o.uuid,
            IntentObject::VirtualNetwork(o) => &o.uuid,
            IntentObject::VirtualMachineInterface(o) => &o.uuid,
            IntentObject::LogicalRouter(o) => &o.uuid,
            IntentObject::RouteTable(o) => &o.uuid,
            IntentObject::BgpRouter(o) => &o.uuid,
            IntentObject::NodeProfile(o) => &o.uuid,
            IntentObject::ServiceInstance(o) => &o.uuid,
        }
    }

    pub fn fq_name(&self) -> &[String] {
        match self {
            IntentObject::Fabric(o) => &o.fq_name,
            IntentObject::PhysicalRouter(o) => &o.fq_name,
            IntentObject::PhysicalInterface(o) => &o.fq_name,
            IntentObject::LogicalInterface(o) => &o.fq_name,
            IntentObject::VirtualNetwork(o) => &o.fq_name,
            IntentObject::VirtualMachineInterface(o) => &o.fq_name,
            IntentObject::LogicalRouter(o) => &o.fq_name,
            IntentObject::RouteTable(o) => &o.fq_name,
            IntentObject::BgpRouter(o) => &o.fq_name,
            IntentObject::NodeProfile(o) => &o.fq_name,
            IntentObject::ServiceInstance(o) => &o.fq_name,
        }
    }
}
