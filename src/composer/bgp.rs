use std::collections::{BTreeMap, BTreeSet};

use super::naming::{self, BGP_FAMILIES};
use super::roles::{feature, ROLE_SPINE};
use super::DeviceBuilder;
use crate::abstract_config::{BgpGroup, BgpPeer, PolicyFrom, PolicyTerm, PolicyThen, RoutingPolicy};
use crate::intent::BgpRouter;

fn filter_families<'s>(families: impl Iterator<Item = &'s String>) -> BTreeSet<String> {
    families
        .filter(|f| BGP_FAMILIES.contains(&f.as_str()))
        .cloned()
        .collect()
}

fn group_families(br: &BgpRouter) -> BTreeSet<String> {
    if br.props.address_families.is_empty() {
        BGP_FAMILIES.iter().map(|f| f.to_string()).collect()
    } else {
        filter_families(br.props.address_families.iter())
    }
}

fn ibgp_export_policy() -> RoutingPolicy {
    let term = |family: &str| PolicyTerm {
        name: family.to_string(),
        from: Some(PolicyFrom {
            community: vec![],
            family: Some(family.to_string()),
        }),
        then: PolicyThen {
            next_hop_self: true,
            ..Default::default()
        },
    };
    RoutingPolicy {
        name: naming::IBGP_EXPORT_POLICY.to_string(),
        terms: vec![term("inet-vpn"), term("inet6-vpn")],
    }
}

/// Overlay BGP groups. Returns false when the device has no usable BGP
/// router, in which case the rest of the build goes ahead without it.
pub(super) fn build(b: &mut DeviceBuilder<'_>) -> bool {
    let Some(local_id) = b.router.bgp_router else {
        b.warn(format!("no bgp router for {}", b.router.name()));
        return false;
    };
    let graph = b.graph;
    let local = graph.bgp_router(local_id);
    let Some(local_address) = local.address() else {
        b.warn(format!("bgp router of {} has no address", b.router.name()));
        return false;
    };
    let local_asn = local.asn();
    b.asn = Some(local_asn);
    if !b.roles.has_feature(feature::OVERLAY_BGP) {
        return true;
    }

    let families = group_families(local);
    let new_group = |name: String, group_type: &str| BgpGroup {
        name,
        group_type: group_type.to_string(),
        ip_address: local_address.to_string(),
        autonomous_system: local_asn,
        families: families.clone(),
        hold_time: local.props.hold_time,
        authentication_key: local.props.auth_key.clone(),
        ..Default::default()
    };

    let mut groups: BTreeMap<String, BgpGroup> = BTreeMap::new();
    let internal = naming::bgp_group_name(local_asn, None);
    if local.is_route_reflector() {
        // The reflector always carries the plain group, even with no
        // non-client peers
        groups.insert(internal.clone(), new_group(internal.clone(), "internal"));
    }

    for (peer_id, peering) in &local.peers {
        let peer = graph.bgp_router(*peer_id);
        let Some(address) = peer.address() else {
            continue;
        };
        let peer_asn = peer.asn();
        let peer_is_spine = peer
            .physical_router
            .map(|pr| graph.pr(pr).props.physical_role.as_deref() == Some(ROLE_SPINE))
            .unwrap_or(false);

        let name = if peer_asn != local_asn {
            naming::bgp_group_name(local_asn, Some("external"))
        } else if local.is_route_reflector() && !peer.is_route_reflector() && !peer_is_spine {
            naming::bgp_group_name(local_asn, Some("rr"))
        } else {
            internal.clone()
        };

        let group = groups.entry(name.clone()).or_insert_with(|| {
            if peer_asn != local_asn {
                let mut g = new_group(name.clone(), "external");
                g.multihop = true;
                g
            } else {
                let mut g = new_group(name.clone(), "internal");
                if name.ends_with("-rr") {
                    g.cluster_id = local.props.cluster_id;
                }
                g
            }
        });

        group.peers.push(BgpPeer {
            address: address.to_string(),
            autonomous_system: peer_asn,
            families: filter_families(peering.address_families.iter()),
            authentication_key: peering
                .auth_key
                .clone()
                .or_else(|| peer.props.auth_key.clone()),
        });
        b.peer_addresses.insert(address.to_string());
    }

    let mut has_internal = false;
    for group in groups.values_mut() {
        if group.group_type == "internal" {
            group.export_policy = Some(naming::IBGP_EXPORT_POLICY.to_string());
            has_internal = true;
        }
    }
    if has_internal {
        b.device.routing_policies.push(ibgp_export_policy());
    }
    b.device.bgp.extend(groups.into_values());
    true
}
