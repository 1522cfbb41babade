//! Vendor-neutral device document handed to the job worker.
//!
//! Sets are `BTreeSet` so they serialize sorted. Empty fields and numeric
//! zeros are skipped.
//! The canonical byte form and the fingerprint live in [`canonical`].

pub mod canonical;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use canonical::{canonical_bytes, fingerprint};

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Routing instance flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingInstanceType {
    Vrf,
    L2,
    L3,
}

/// Root of the abstract config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bgp: Vec<BgpGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub physical_interfaces: Vec<PhysicalInterface>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_instances: Vec<RoutingInstance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vlans: Vec<Vlan>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwarding_options: Vec<ForwardingOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub firewall: Vec<FirewallFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_zones: Vec<SecurityZone>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub security_policies: Vec<SecurityPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_policies: Vec<RoutingPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rib_groups: Vec<RibGroup>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_protocols: Vec<RoutingProtocol>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub communities: Vec<Community>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch_options: Option<SwitchOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_options: Option<RoutingOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chassis: Option<Chassis>,
}

impl Device {
    /// True when nothing beyond an empty document was built
    pub fn is_empty(&self) -> bool {
        *self == Device::default()
    }

    pub fn physical_interface(&self, name: &str) -> Option<&PhysicalInterface> {
        self.physical_interfaces.iter().find(|p| p.name == name)
    }

    pub fn routing_instance(&self, name: &str) -> Option<&RoutingInstance> {
        self.routing_instances.iter().find(|r| r.name == name)
    }

    pub fn bgp_group(&self, name: &str) -> Option<&BgpGroup> {
        self.bgp.iter().find(|g| g.name == name)
    }

    /// Every interface name (PI and `pi.unit`) defined in the document
    pub fn interface_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for pi in &self.physical_interfaces {
            names.insert(pi.name.clone());
            for li in &pi.logical_interfaces {
                names.insert(li.name.clone());
            }
        }
        names
    }

    /// Sort every collection by its key
    pub fn sort(&mut self) {
        self.bgp.sort_by(|a, b| a.name.cmp(&b.name));
        for group in &mut self.bgp {
            group.peers.sort_by(|a, b| a.address.cmp(&b.address));
        }
        self.physical_interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        for pi in &mut self.physical_interfaces {
            pi.logical_interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        }
        self.routing_instances.sort_by(|a, b| a.name.cmp(&b.name));
        self.vlans.sort_by(|a, b| a.name.cmp(&b.name));
        self.forwarding_options.sort_by(|a, b| a.family.cmp(&b.family));
        self.firewall.sort_by(|a, b| a.name.cmp(&b.name));
        self.security_zones.sort_by(|a, b| a.name.cmp(&b.name));
        self.security_policies
            .sort_by(|a, b| (&a.from_zone, &a.to_zone).cmp(&(&b.from_zone, &b.to_zone)));
        self.routing_policies.sort_by(|a, b| a.name.cmp(&b.name));
        self.rib_groups.sort_by(|a, b| a.name.cmp(&b.name));
        self.routing_protocols.sort_by(|a, b| a.key().cmp(&b.key()));
        self.communities.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// Device identity and fabric-wide attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct System {
    pub name: String,
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vendor_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub product_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_family: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub management_ip: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub loopback_ip_list: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_role: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub routing_bridging_roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encapsulation_priorities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tunnel_destination_networks: BTreeSet<String>,
    /// Allocated from the fabric eBGP ASN pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub underlay_asn: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_ucast_gateway_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BgpPeer {
    pub address: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub autonomous_system: u32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub families: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_key: Option<String>,
}

/// Peer group keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BgpGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub ip_address: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub autonomous_system: u32,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub families: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub multihop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<BgpPeer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAggregation {
    pub lacp_mode: String,
    pub system_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub admin_key: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub system_priority: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethernet_segment_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_aggregation: Option<LinkAggregation>,
    /// Bundle this member belongs to (ieee-802.3ad)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_aggregation_group: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub flexible_vlan_tagging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encapsulation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logical_interfaces: Vec<LogicalInterface>,
}

impl PhysicalInterface {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn unit(&self, unit: &str) -> Option<&LogicalInterface> {
        self.logical_interfaces.iter().find(|l| l.unit == unit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicalInterface {
    pub name: String,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_vlan_id: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ip_addresses: BTreeSet<String>,
    /// Anycast gateway addresses shared by every IRB of the network
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub virtual_gateway_addresses: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VniOption {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vni: u32,
    pub vrf_target: String,
}

/// EVPN block, either per routing instance or device-wide
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evpn {
    pub encapsulation: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub extended_vni_list: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast_mode: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub proxy_macip_advertisement: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vni_options: Vec<VniOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingInstance {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_instance_type: Option<RoutingInstanceType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_network_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vxlan_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_distinguisher: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub import_targets: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub export_targets: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vrf_import: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vrf_export: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub interfaces: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub prefixes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub auto_export: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vtep_source_interface: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_public_network: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evpn: Option<Evpn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<Vlan>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vlan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u32>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vxlan_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l3_interface: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub interfaces: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingOption {
    pub family: String,
    pub input_filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallTerm {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub destination_prefixes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_instance: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub accept: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallFilter {
    pub name: String,
    pub family: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<FirewallTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityZone {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub interfaces: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub from_zone: String,
    pub to_zone: String,
    pub policy_name: String,
    pub action: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFrom {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub community: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyThen {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_community: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub next_hop_self: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub accept: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTerm {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PolicyFrom>,
    pub then: PolicyThen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terms: Vec<PolicyTerm>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RibGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub import_rib: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicTunnel {
    pub name: String,
    pub source_address: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub destination_networks: BTreeSet<String>,
}

/// Device-wide protocol blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum RoutingProtocol {
    Evpn(Evpn),
    DynamicTunnel(DynamicTunnel),
}

impl RoutingProtocol {
    fn key(&self) -> (u8, String) {
        match self {
            RoutingProtocol::Evpn(_) => (0, String::new()),
            RoutingProtocol::DynamicTunnel(t) => (1, t.name.clone()),
        }
    }
}

/// BGP community; members are never empty
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    pub name: String,
    pub members: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOptions {
    pub vtep_source_interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_distinguisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vrf_target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub vrf_import: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub vrf_export: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autonomous_system: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resolution_ribs: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chassis {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub aggregated_devices_ethernet_device_count: u32,
}
