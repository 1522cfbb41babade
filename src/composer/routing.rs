use std::collections::{BTreeMap, BTreeSet};

use super::addresses::{ip_version, AddressBook};
use super::naming::{self, L3_LOOPBACK_UNIT_OFFSET, SWITCH_COMMUNITY, VTEP_INTERFACE};
use super::roles::feature;
use super::DeviceBuilder;
use crate::abstract_config::{
    Community, Evpn, FirewallFilter, FirewallTerm, ForwardingOption, PolicyFrom, PolicyTerm,
    PolicyThen, RibGroup, RoutingInstance, RoutingInstanceType, RoutingPolicy, RoutingProtocol,
    SwitchOptions, Vlan, VniOption,
};
use crate::error::Result;
use crate::intent::{ForwardingMode, LrId, VnId};

const VXLAN: &str = "vxlan";

/// Collected while walking networks, attached at the end
#[derive(Default)]
struct RoutingState {
    communities: BTreeMap<String, BTreeSet<String>>,
    /// Import/export policies of L2 instances, registered globally on spines
    l2_policies: Vec<String>,
    l2_vnis: BTreeSet<String>,
    public_terms: Vec<FirewallTerm>,
}

/// Routing instances, VLANs, IRBs, communities and policies for every
/// network the device takes part in.
pub(super) async fn build(b: &mut DeviceBuilder<'_>, addresses: &AddressBook) -> Result<()> {
    let graph = b.graph;
    let router = b.router;
    let spine = b.roles.is_spine();

    let mut lr_of_vn: BTreeMap<VnId, LrId> = BTreeMap::new();
    let mut public: BTreeSet<VnId> = BTreeSet::new();
    if spine {
        for lr in &router.logical_routers {
            for vn in graph.lr_networks(*lr) {
                lr_of_vn.entry(vn).or_insert(*lr);
            }
            public.extend(graph.lr(*lr).external_networks.iter().copied());
        }
    }

    let mut candidates: BTreeSet<VnId> = b.vn_members.keys().copied().collect();
    candidates.extend(lr_of_vn.keys().copied());
    candidates.extend(public.iter().copied());

    let mut state = RoutingState::default();
    let mut lr_interfaces: BTreeMap<LrId, BTreeSet<String>> = BTreeMap::new();

    for vn_id in candidates {
        let vn = graph.vn(vn_id);
        if vn.is_internal() {
            continue;
        }
        let l2 = b.roles.is_l2_supported(vn);
        let l3 = b.roles.is_l3_supported(vn);
        if !l2 && !l3 {
            continue;
        }
        if vn.import_targets().is_empty() && vn.export_targets().is_empty() {
            b.warn(format!("virtual network {} has no route targets", vn.name()));
        }

        let irb = if l2 && l3 && vn.props.forwarding_mode == ForwardingMode::L2L3 {
            Some(add_irb(b, addresses, vn_id).await?)
        } else {
            None
        };
        if l2 {
            add_l2_instance(b, &mut state, vn_id, irb.clone());
        }
        if l3 {
            let routed = irb.or_else(|| add_l3_loopback(b, vn_id));
            match lr_of_vn.get(&vn_id) {
                Some(lr) => {
                    lr_interfaces.entry(*lr).or_default().extend(routed);
                }
                None => add_l3_instance(b, &mut state, vn_id, routed, public.contains(&vn_id)),
            }
        }
    }

    for (lr_id, interfaces) in lr_interfaces {
        add_lr_vrf(b, &mut state, lr_id, interfaces);
    }
    finish(b, state);
    Ok(())
}

/// IRB unit `irb.<network_id>` with a per-device address and the anycast
/// gateways of each subnet
async fn add_irb(b: &mut DeviceBuilder<'_>, addresses: &AddressBook, vn_id: VnId) -> Result<String> {
    let graph = b.graph;
    let vn = graph.vn(vn_id);
    let router = b.router;
    let mut ips = BTreeSet::new();
    let mut gateways = BTreeSet::new();
    for subnet in &vn.props.subnets {
        if let Some(ip) = addresses
            .irb_address(&vn.props.uuid, &subnet.prefix, subnet.gateway.as_deref(), router.uuid())
            .await?
        {
            ips.insert(ip);
        }
        if let (Some(gw), Some((_, len))) = (&subnet.gateway, subnet.prefix.split_once('/')) {
            gateways.insert(format!("{}/{}", gw, len));
        }
    }
    let unit = b.unit("irb", &vn.props.network_id.to_string());
    unit.ip_addresses = ips;
    unit.virtual_gateway_addresses = gateways;
    unit.comment = Some(format!("Virtual network {}", vn.name()));
    Ok(unit.name.clone())
}

/// Routed-only networks terminate on a loopback unit holding the gateways
fn add_l3_loopback(b: &mut DeviceBuilder<'_>, vn_id: VnId) -> Option<String> {
    let graph = b.graph;
    let vn = graph.vn(vn_id);
    let addresses: BTreeSet<String> = vn
        .props
        .subnets
        .iter()
        .filter_map(|s| {
            let gw = s.gateway.as_ref()?;
            let len = if ip_version(&s.prefix) == Some(4) { 32 } else { 128 };
            Some(format!("{}/{}", gw, len))
        })
        .collect();
    if addresses.is_empty() {
        return None;
    }
    let unit_id = L3_LOOPBACK_UNIT_OFFSET + vn.props.network_id;
    let unit = b.unit("lo0", &unit_id.to_string());
    unit.ip_addresses = addresses;
    Some(unit.name.clone())
}

/// Community per target, plus the `-import` / `-export` policies
fn attach_policies(
    b: &mut DeviceBuilder<'_>,
    state: &mut RoutingState,
    ri: &mut RoutingInstance,
    imports: Vec<String>,
    exports: Vec<String>,
) {
    let mut community_names = |targets: &[String]| -> Vec<String> {
        targets
            .iter()
            .map(|t| {
                let name = naming::community_name(t);
                state.communities.entry(name.clone()).or_default().insert(t.clone());
                name
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    };
    let import_names = community_names(&imports);
    let export_names = community_names(&exports);

    if !import_names.is_empty() {
        let mut terms = Vec::new();
        if b.asn.is_some() {
            terms.push(PolicyTerm {
                name: "t-switch".to_string(),
                from: Some(PolicyFrom {
                    community: vec![SWITCH_COMMUNITY.to_string()],
                    family: None,
                }),
                then: PolicyThen {
                    accept: true,
                    ..Default::default()
                },
            });
        }
        terms.push(PolicyTerm {
            name: "t1".to_string(),
            from: Some(PolicyFrom {
                community: import_names,
                family: None,
            }),
            then: PolicyThen {
                accept: true,
                ..Default::default()
            },
        });
        let name = naming::import_policy_name(&ri.name);
        b.device.routing_policies.push(RoutingPolicy {
            name: name.clone(),
            terms,
        });
        ri.vrf_import = vec![name];
    }

    if !export_names.is_empty() {
        let name = naming::export_policy_name(&ri.name);
        b.device.routing_policies.push(RoutingPolicy {
            name: name.clone(),
            terms: vec![PolicyTerm {
                name: "t1".to_string(),
                from: None,
                then: PolicyThen {
                    add_community: export_names,
                    accept: true,
                    ..Default::default()
                },
            }],
        });
        ri.vrf_export = vec![name];
    }

    ri.import_targets = imports.into_iter().collect();
    ri.export_targets = exports.into_iter().collect();
}

fn add_l2_instance(b: &mut DeviceBuilder<'_>, state: &mut RoutingState, vn_id: VnId, irb: Option<String>) {
    let graph = b.graph;
    let vn = graph.vn(vn_id);
    let spine = b.roles.is_spine();
    let nid = vn.props.network_id;
    let vni = vn.props.vni.unwrap_or(nid);
    let name = naming::vrf_name(&vn.name(), "l2", nid);

    let members = b.vn_members.get(&vn_id).cloned().unwrap_or_default();
    let vlan_ids: BTreeSet<u32> = b
        .device
        .physical_interfaces
        .iter()
        .flat_map(|pi| pi.logical_interfaces.iter())
        .filter(|li| members.contains(&li.name))
        .filter_map(|li| li.vlan_id)
        .collect();
    let vlan = Vlan {
        name: naming::bridge_domain_name(&vn.name(), vni),
        vlan_id: if vlan_ids.len() == 1 { vlan_ids.into_iter().next() } else { None },
        vxlan_id: vni,
        l3_interface: irb.clone(),
        interfaces: members,
        comment: None,
    };

    let mut evpn = Evpn {
        encapsulation: VXLAN.to_string(),
        extended_vni_list: [vni.to_string()].into_iter().collect(),
        proxy_macip_advertisement: irb.is_some(),
        ..Default::default()
    };
    if !spine {
        if let Some(target) = vn.import_targets().into_iter().next() {
            evpn.vni_options.push(VniOption { vni, vrf_target: target });
        }
    }

    let mut ri = RoutingInstance {
        name,
        routing_instance_type: Some(RoutingInstanceType::L2),
        virtual_network_id: Some(nid),
        vxlan_id: Some(vni),
        route_distinguisher: b.router_id.as_deref().map(|id| naming::route_distinguisher(id, nid)),
        evpn: Some(evpn),
        vlan: Some(vlan.clone()),
        ..Default::default()
    };
    attach_policies(b, state, &mut ri, vn.import_targets(), vn.export_targets());
    if spine {
        state.l2_policies.extend(ri.vrf_import.iter().cloned());
        state.l2_policies.extend(ri.vrf_export.iter().cloned());
    }
    state.l2_vnis.insert(vni.to_string());
    b.device.vlans.push(vlan);
    b.device.routing_instances.push(ri);
}

fn auto_export_families(prefixes: &BTreeSet<String>) -> BTreeSet<String> {
    prefixes
        .iter()
        .filter_map(|p| match ip_version(p) {
            Some(4) => Some("inet".to_string()),
            Some(6) => Some("inet6".to_string()),
            _ => None,
        })
        .collect()
}

fn add_l3_instance(
    b: &mut DeviceBuilder<'_>,
    state: &mut RoutingState,
    vn_id: VnId,
    routed: Option<String>,
    public: bool,
) {
    let graph = b.graph;
    let vn = graph.vn(vn_id);
    let nid = vn.props.network_id;
    let name = naming::vrf_name(&vn.name(), "l3", nid);
    let prefixes: BTreeSet<String> = vn.props.subnets.iter().map(|s| s.prefix.clone()).collect();

    let mut ri = RoutingInstance {
        name: name.clone(),
        routing_instance_type: Some(RoutingInstanceType::L3),
        virtual_network_id: Some(nid),
        vxlan_id: vn.props.vni,
        route_distinguisher: b.router_id.as_deref().map(|id| naming::route_distinguisher(id, nid)),
        interfaces: routed.into_iter().collect(),
        auto_export: auto_export_families(&prefixes),
        prefixes: prefixes.clone(),
        vtep_source_interface: Some(VTEP_INTERFACE.to_string()),
        is_public_network: public,
        ..Default::default()
    };
    attach_policies(b, state, &mut ri, vn.import_targets(), vn.export_targets());

    if public && b.roles.has_feature(feature::DC_GATEWAY) {
        state.public_terms.push(FirewallTerm {
            name: format!("term-{}", name),
            destination_prefixes: prefixes
                .iter()
                .filter(|p| ip_version(p) == Some(4))
                .cloned()
                .collect(),
            routing_instance: Some(name.clone()),
            accept: false,
        });
        b.device.rib_groups.push(RibGroup {
            name: naming::rib_group_name(&name),
            import_rib: vec![format!("{}.inet.0", name), "inet.0".to_string()],
            import_policy: ri.vrf_export.first().cloned(),
        });
    }
    b.device.routing_instances.push(ri);
}

/// VRF of a logical router: its internal network plus the routed
/// interfaces of every member network
fn add_lr_vrf(b: &mut DeviceBuilder<'_>, state: &mut RoutingState, lr_id: LrId, interfaces: BTreeSet<String>) {
    let graph = b.graph;
    let lr = graph.lr(lr_id);
    let Some(ivn_id) = graph.lr_internal_vn(lr_id) else {
        b.warn(format!("logical router {} has no internal network", lr.name()));
        return;
    };
    let ivn = graph.vn(ivn_id);
    let nid = ivn.props.network_id;
    let name = naming::vrf_name(&ivn.name(), "l3", nid);

    let mut prefixes: BTreeSet<String> = BTreeSet::new();
    for vn in graph.lr_networks(lr_id) {
        prefixes.extend(graph.vn(vn).props.subnets.iter().map(|s| s.prefix.clone()));
    }
    let static_routes: BTreeSet<String> = lr
        .route_table
        .map(|rt| graph.route_table(rt).props.routes.iter().map(|r| r.prefix.clone()).collect())
        .unwrap_or_default();

    let evpn = ivn.props.vni.map(|vni| Evpn {
        encapsulation: VXLAN.to_string(),
        extended_vni_list: [vni.to_string()].into_iter().collect(),
        ..Default::default()
    });
    let mut ri = RoutingInstance {
        name,
        routing_instance_type: Some(RoutingInstanceType::Vrf),
        virtual_network_id: Some(nid),
        vxlan_id: ivn.props.vni,
        route_distinguisher: b.router_id.as_deref().map(|id| naming::route_distinguisher(id, nid)),
        interfaces,
        auto_export: auto_export_families(&prefixes),
        prefixes: static_routes,
        vtep_source_interface: Some(VTEP_INTERFACE.to_string()),
        evpn,
        ..Default::default()
    };
    attach_policies(b, state, &mut ri, ivn.import_targets(), ivn.export_targets());
    b.device.routing_instances.push(ri);
}

/// Device-wide blocks derived from what the instances registered
fn finish(b: &mut DeviceBuilder<'_>, state: RoutingState) {
    let spine = b.roles.is_spine();
    let mut communities = state.communities;

    if !state.l2_vnis.is_empty() {
        let mut switch = SwitchOptions {
            vtep_source_interface: VTEP_INTERFACE.to_string(),
            route_distinguisher: b.router_id.as_deref().map(|id| naming::route_distinguisher(id, 1)),
            ..Default::default()
        };
        if let Some(asn) = b.asn {
            communities
                .entry(SWITCH_COMMUNITY.to_string())
                .or_default()
                .insert(naming::switch_target(asn));
        }
        if spine {
            switch.vrf_import = state.l2_policies.iter().filter(|p| p.ends_with("-import")).cloned().collect();
            switch.vrf_export = state.l2_policies.iter().filter(|p| p.ends_with("-export")).cloned().collect();
        } else {
            switch.vrf_target = Some("auto".to_string());
            if b.asn.is_some() {
                switch.vrf_export.insert(naming::GLOBAL_EXPORT_POLICY.to_string());
                b.device.routing_policies.push(RoutingPolicy {
                    name: naming::GLOBAL_EXPORT_POLICY.to_string(),
                    terms: vec![PolicyTerm {
                        name: "t1".to_string(),
                        from: None,
                        then: PolicyThen {
                            add_community: vec![SWITCH_COMMUNITY.to_string()],
                            accept: true,
                            ..Default::default()
                        },
                    }],
                });
            }
        }
        b.device.switch_options = Some(switch);
        b.device.routing_protocols.push(RoutingProtocol::Evpn(Evpn {
            encapsulation: VXLAN.to_string(),
            extended_vni_list: state.l2_vnis,
            multicast_mode: (!spine).then(|| "ingress-replication".to_string()),
            ..Default::default()
        }));
    }

    if !state.public_terms.is_empty() {
        let mut terms = state.public_terms;
        terms.push(FirewallTerm {
            name: "default-term".to_string(),
            accept: true,
            ..Default::default()
        });
        b.device.firewall.push(FirewallFilter {
            name: naming::PUBLIC_VRF_FILTER.to_string(),
            family: "inet".to_string(),
            terms,
        });
        b.device.forwarding_options.push(ForwardingOption {
            family: "inet".to_string(),
            input_filter: naming::PUBLIC_VRF_FILTER.to_string(),
        });
    }

    b.device.communities = communities
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(name, members)| Community { name, members })
        .collect();
}
