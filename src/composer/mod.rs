//! Per-device feature composition: builds one abstract-config document for
//! one physical router from an intent snapshot.
//!
//! The build runs in stages that share a [`DeviceBuilder`]: system block,
//! overlay BGP, interfaces and AE bonds, routing instances, service
//! chaining, chassis. Role gating decides which stages contribute.

pub mod addresses;
mod bgp;
mod interfaces;
pub mod naming;
pub mod roles;
mod routing;
mod services;
mod system;

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::abstract_config::{Chassis, Device, LogicalInterface, PhysicalInterface};
use crate::alloc::AeIdPool;
use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};
use crate::intent::{Fabric, Graph, PhysicalRouter, PrId, VnId};
use addresses::AddressBook;
use roles::DeviceRoles;

/// Fabric-level allocations handed to the composer for one device
#[derive(Debug, Clone, Default)]
pub struct DeviceAllocations {
    pub loopback_ip: Option<String>,
    pub underlay_asn: Option<u32>,
}

/// Result of one build: the document plus what the push engine needs to
/// decide what to do with it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureConfig {
    pub device: Device,
    pub features: BTreeSet<String>,
    pub job_template: Vec<String>,
    #[serde(skip)]
    pub warnings: Vec<PipelineError>,
    /// ESIs bonded on this device; everything else is reapable
    #[serde(skip)]
    pub esis: BTreeSet<String>,
    pub no_bgp: bool,
}

impl FeatureConfig {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

pub(crate) struct DeviceBuilder<'a> {
    pub graph: &'a Graph,
    pub pr_id: PrId,
    pub router: &'a PhysicalRouter,
    pub fabric: &'a Fabric,
    pub roles: DeviceRoles,
    pub allocations: &'a DeviceAllocations,
    pub device: Device,
    pub warnings: Vec<PipelineError>,
    pub asn: Option<u32>,
    pub router_id: Option<String>,
    pub peer_addresses: BTreeSet<String>,
    /// Unit names bound to each network on this device
    pub vn_members: BTreeMap<VnId, BTreeSet<String>>,
    pub esis: BTreeSet<String>,
}

impl<'a> DeviceBuilder<'a> {
    pub fn warn(&mut self, message: String) {
        tracing::warn!("{}: {}", self.router.name(), message);
        self.warnings.push(PipelineError::BuildWarning(message));
    }

    pub fn loopback_ip(&self) -> Option<String> {
        self.router
            .props
            .loopback_ip
            .clone()
            .filter(|ip| !ip.is_empty())
            .or_else(|| self.allocations.loopback_ip.clone())
    }

    pub fn interface(&mut self, name: &str) -> &mut PhysicalInterface {
        let pos = match self.device.physical_interfaces.iter().position(|p| p.name == name) {
            Some(pos) => pos,
            None => {
                self.device.physical_interfaces.push(PhysicalInterface::named(name));
                self.device.physical_interfaces.len() - 1
            }
        };
        &mut self.device.physical_interfaces[pos]
    }

    /// Get or create `<pi>.<unit>`
    pub fn unit(&mut self, pi: &str, unit: &str) -> &mut LogicalInterface {
        let name = format!("{}.{}", pi, unit);
        let pi = self.interface(pi);
        let pos = match pi.logical_interfaces.iter().position(|l| l.unit == unit) {
            Some(pos) => pos,
            None => {
                pi.logical_interfaces.push(LogicalInterface {
                    name,
                    unit: unit.to_string(),
                    ..Default::default()
                });
                pi.logical_interfaces.len() - 1
            }
        };
        &mut pi.logical_interfaces[pos]
    }
}

/// Builds abstract configs. Holds the shared allocators so AE ids and IRB
/// addresses stay stable across passes and restarts.
pub struct Composer {
    ae_pool: Arc<AeIdPool>,
    addresses: AddressBook,
}

impl Composer {
    pub fn new(coord: Arc<CoordClient>, max_ae: u64) -> Self {
        Self {
            ae_pool: Arc::new(AeIdPool::new(coord.clone(), max_ae)),
            addresses: AddressBook::new(coord),
        }
    }

    pub fn ae_pool(&self) -> &Arc<AeIdPool> {
        &self.ae_pool
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    /// Build the document for one router.
    ///
    /// Missing fabric or node profile yields an empty document with a
    /// warning; a missing BGP router only skips the overlay stage.
    pub async fn build(
        &self,
        graph: &Graph,
        pr_id: PrId,
        allocations: &DeviceAllocations,
    ) -> Result<FeatureConfig> {
        let router = graph.pr(pr_id);
        let mut out = FeatureConfig::default();

        let Some(fabric_id) = router.fabric else {
            let msg = format!("physical router {} is not in a fabric", router.name());
            tracing::warn!("{}", msg);
            out.warnings.push(PipelineError::BuildWarning(msg));
            return Ok(out);
        };
        let Some(profile_id) = router.node_profile else {
            let msg = format!("physical router {} has no node profile", router.name());
            tracing::warn!("{}", msg);
            out.warnings.push(PipelineError::BuildWarning(msg));
            return Ok(out);
        };
        let profile = graph.node_profile(profile_id);

        let mut b = DeviceBuilder {
            graph,
            pr_id,
            router,
            fabric: graph.fabric(fabric_id),
            roles: DeviceRoles::new(router, profile),
            allocations,
            device: Device::default(),
            warnings: Vec::new(),
            asn: None,
            router_id: None,
            peer_addresses: BTreeSet::new(),
            vn_members: BTreeMap::new(),
            esis: BTreeSet::new(),
        };

        system::build(&mut b);
        let has_bgp = bgp::build(&mut b);

        if !b.roles.is_rr_only() {
            system::build_underlay(&mut b);
            interfaces::build(&mut b, &self.ae_pool).await?;
            routing::build(&mut b, &self.addresses).await?;
            services::build(&mut b);

            let has_ae = b
                .device
                .physical_interfaces
                .iter()
                .any(|p| p.link_aggregation.is_some());
            if has_ae {
                b.device.chassis = Some(Chassis {
                    aggregated_devices_ethernet_device_count: self.ae_pool.max_ae() as u32,
                });
            }
        }

        b.device.sort();
        out.device = b.device;
        out.features = b.roles.features().clone();
        out.job_template = profile.props.job_template.clone();
        out.warnings = b.warnings;
        out.esis = b.esis;
        out.no_bgp = !has_bgp;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abstract_config::{RoutingInstanceType, RoutingProtocol};
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy};
    use crate::intent::fixtures;
    use pretty_assertions::assert_eq;

    async fn composer() -> Composer {
        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        Composer::new(coord, 128)
    }

    async fn build(g: &Graph, uuid: &str) -> FeatureConfig {
        let pr = g.pr_by_uuid(uuid).unwrap();
        composer().await.build(g, pr, &DeviceAllocations::default()).await.unwrap()
    }

    /// Every interface the document refers to is defined in it
    fn assert_refs_resolve(device: &Device) {
        let names = device.interface_names();
        for ri in &device.routing_instances {
            for i in &ri.interfaces {
                assert!(names.contains(i), "routing instance {} refers to {}", ri.name, i);
            }
            if let Some(vtep) = &ri.vtep_source_interface {
                assert!(names.contains(vtep));
            }
        }
        for vlan in &device.vlans {
            for i in vlan.interfaces.iter().chain(vlan.l3_interface.iter()) {
                assert!(names.contains(i), "vlan {} refers to {}", vlan.name, i);
            }
        }
        for zone in &device.security_zones {
            for i in &zone.interfaces {
                assert!(names.contains(i));
            }
        }
    }

    #[tokio::test]
    async fn test_ae_bond_formation() {
        let g = fixtures::fabric_graph();
        let fc = build(&g, fixtures::LEAF1).await;
        let d = &fc.device;

        let bundles: Vec<_> = d
            .physical_interfaces
            .iter()
            .filter(|p| p.link_aggregation.is_some())
            .collect();
        assert_eq!(bundles.len(), 1);
        let ae = bundles[0];
        assert_eq!(ae.name, "ae127");
        assert_eq!(ae.ethernet_segment_identifier.as_deref(), Some(fixtures::ESI));
        let lacp = ae.link_aggregation.as_ref().unwrap();
        assert_eq!(lacp.lacp_mode, "active");
        assert_eq!(lacp.admin_key, 1);
        assert_eq!(lacp.system_id, "33:33:33:33:33:33");

        for member in ["xe-0/0/1", "xe-0/0/2"] {
            let pi = d.physical_interface(member).unwrap();
            assert_eq!(pi.link_aggregation_group.as_deref(), Some("ae127"));
            assert!(pi.logical_interfaces.is_empty());
        }
        assert_eq!(ae.unit("100").unwrap().name, "ae127.100");
        assert_eq!(d.chassis.as_ref().unwrap().aggregated_devices_ethernet_device_count, 128);
        assert!(fc.esis.contains(fixtures::ESI));
        assert_refs_resolve(d);
    }

    #[tokio::test]
    async fn test_native_vlan_unit() {
        let g = fixtures::fabric_graph();
        let fc = build(&g, fixtures::LEAF2).await;
        let d = &fc.device;

        let pi = d.physical_interface("intf-native").unwrap();
        let unit = pi.unit("0").unwrap();
        assert_eq!(unit.name, "intf-native.0");
        assert_eq!(unit.vlan_id, Some(4094));
        assert_eq!(unit.native_vlan_id, Some(4094));
        assert!(pi.flexible_vlan_tagging);
        assert_eq!(pi.encapsulation.as_deref(), Some("extended-vlan-bridge"));

        let vlan = d.vlans.iter().find(|v| v.vxlan_id == 2000).unwrap();
        assert!(vlan.interfaces.contains("intf-native.0"));
        assert_eq!(vlan.vlan_id, Some(4094));
        assert_refs_resolve(d);
    }

    #[tokio::test]
    async fn test_route_reflector_grouping() {
        let g = fixtures::fabric_graph();

        for (leaf, other) in [(fixtures::LEAF1, "10.10.0.3"), (fixtures::LEAF2, "10.10.0.2")] {
            let d = build(&g, leaf).await.device;
            let groups: Vec<_> = d.bgp.iter().map(|g| g.name.as_str()).collect();
            assert_eq!(groups, vec!["_contrail_asn-64512"]);
            let peers: Vec<_> = d.bgp[0].peers.iter().map(|p| p.address.as_str()).collect();
            assert_eq!(peers, vec!["10.10.0.1", other]);
        }

        let d = build(&g, fixtures::SPINE).await.device;
        let groups: Vec<_> = d.bgp.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(groups, vec!["_contrail_asn-64512", "_contrail_asn-64512-rr"]);
        assert!(d.bgp[0].peers.is_empty());
        assert_eq!(d.bgp[1].peers.len(), 2);
        assert_eq!(d.bgp[1].cluster_id, Some(100));
    }

    #[tokio::test]
    async fn test_bgp_families_filtered() {
        let g = fixtures::fabric_graph();
        let d = build(&g, fixtures::SPINE).await.device;
        let families: Vec<_> = d.bgp[1].families.iter().cloned().collect();
        assert_eq!(families, vec!["evpn", "inet-vpn", "route-target"]);
        assert!(d.routing_policies.iter().any(|p| p.name == naming::IBGP_EXPORT_POLICY));
    }

    #[tokio::test]
    async fn test_spine_routes_lr_networks() {
        let g = fixtures::fabric_graph();
        let fc = build(&g, fixtures::SPINE).await;
        let d = &fc.device;

        let l2 = d.routing_instance("_contrail_vn1-l2-5").unwrap();
        assert_eq!(l2.routing_instance_type, Some(RoutingInstanceType::L2));
        assert!(l2.evpn.as_ref().unwrap().proxy_macip_advertisement);
        assert_eq!(l2.vrf_import, vec!["_contrail_vn1-l2-5-import".to_string()]);

        let vrf = d
            .routing_instance("_contrail___contrail_lr_internal_vn_lr-1__-l3-10")
            .unwrap();
        assert_eq!(vrf.routing_instance_type, Some(RoutingInstanceType::Vrf));
        assert!(vrf.interfaces.contains("irb.5"));

        // IRB lives in the LR VRF only
        let holders = d
            .routing_instances
            .iter()
            .filter(|ri| ri.interfaces.contains("irb.5"))
            .count();
        assert_eq!(holders, 1);

        let irb = d.physical_interface("irb").unwrap().unit("5").unwrap();
        assert!(irb.virtual_gateway_addresses.contains("10.20.0.1/24"));
        assert_eq!(irb.ip_addresses.len(), 1);

        let switch = d.switch_options.as_ref().unwrap();
        assert!(switch.vrf_import.contains("_contrail_vn1-l2-5-import"));
        assert_refs_resolve(d);
    }

    #[tokio::test]
    async fn test_leaf_switch_options() {
        let g = fixtures::fabric_graph();
        let d = build(&g, fixtures::LEAF1).await.device;

        let switch = d.switch_options.as_ref().unwrap();
        assert_eq!(switch.vtep_source_interface, "lo0.0");
        assert_eq!(switch.vrf_target.as_deref(), Some("auto"));
        assert!(switch.vrf_export.contains(naming::GLOBAL_EXPORT_POLICY));
        assert_eq!(switch.route_distinguisher.as_deref(), Some("10.10.0.2:1"));

        let evpn = d
            .routing_protocols
            .iter()
            .find_map(|p| match p {
                RoutingProtocol::Evpn(e) => Some(e),
                _ => None,
            })
            .unwrap();
        assert_eq!(evpn.multicast_mode.as_deref(), Some("ingress-replication"));

        let l2 = d.routing_instance("_contrail_vn1-l2-5").unwrap();
        let vni = &l2.evpn.as_ref().unwrap().vni_options[0];
        assert_eq!(vni.vni, 2000);
        assert_eq!(vni.vrf_target, "target:64512:8000005");

        assert!(d.communities.iter().any(|c| c.name == "target_64512_8000005"));
        assert!(d.communities.iter().all(|c| !c.members.is_empty()));
        assert_eq!(d.routing_options.as_ref().unwrap().autonomous_system, Some(64512));
    }

    #[tokio::test]
    async fn test_missing_node_profile_is_warning() {
        let mut objects = fixtures::fabric_objects();
        for obj in objects.iter_mut() {
            if let crate::intent::IntentObject::PhysicalRouter(pr) = obj {
                pr.node_profile = None;
            }
        }
        let g = Graph::build(objects).unwrap();
        let fc = build(&g, fixtures::LEAF1).await;
        assert!(fc.device.is_empty());
        assert_eq!(fc.warnings[0].kind(), "build_warning");
    }

    #[tokio::test]
    async fn test_missing_bgp_router_keeps_l2() {
        let mut objects = fixtures::fabric_objects();
        for obj in objects.iter_mut() {
            if let crate::intent::IntentObject::PhysicalRouter(pr) = obj {
                pr.bgp_router = None;
            }
            if let crate::intent::IntentObject::BgpRouter(br) = obj {
                br.peers.clear();
            }
        }
        let g = Graph::build(objects).unwrap();
        let fc = build(&g, fixtures::LEAF2).await;
        assert!(fc.no_bgp);
        assert!(fc.device.bgp.is_empty());
        assert!(fc.device.physical_interface("intf-native").is_some());
        assert!(fc.warnings.iter().any(|w| w.kind() == "build_warning"));
    }

    #[tokio::test]
    async fn test_rebuild_is_identical() {
        let g = fixtures::fabric_graph();
        let composer = composer().await;
        let pr = g.pr_by_uuid(fixtures::SPINE).unwrap();
        let first = composer.build(&g, pr, &DeviceAllocations::default()).await.unwrap();
        let second = composer.build(&g, pr, &DeviceAllocations::default()).await.unwrap();
        assert_eq!(
            crate::abstract_config::fingerprint(&first.device).unwrap(),
            crate::abstract_config::fingerprint(&second.device).unwrap()
        );
    }

    #[tokio::test]
    async fn test_rr_only_emits_system_and_bgp() {
        let mut objects = fixtures::fabric_objects();
        for obj in objects.iter_mut() {
            if let crate::intent::IntentObject::PhysicalRouter(pr) = obj {
                if pr.uuid == fixtures::SPINE {
                    pr.routing_bridging_roles = vec!["Route-Reflector".into()];
                }
            }
        }
        let g = Graph::build(objects).unwrap();
        let d = build(&g, fixtures::SPINE).await.device;
        assert!(d.system.is_some());
        assert_eq!(d.bgp.len(), 2);
        assert!(d.routing_instances.is_empty());
        assert!(d.physical_interfaces.is_empty());
    }
}
