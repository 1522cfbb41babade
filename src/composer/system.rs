use std::collections::BTreeSet;

use super::naming;
use super::DeviceBuilder;
use crate::abstract_config::{Credentials, DynamicTunnel, RoutingOptions, RoutingProtocol, System};

/// Identity block plus routing options
pub(super) fn build(b: &mut DeviceBuilder<'_>) {
    let router = b.router;
    let props = &router.props;
    let credentials = props
        .credentials
        .as_ref()
        .or(b.fabric.props.credentials.as_ref())
        .map(|c| Credentials {
            user_name: c.username.clone(),
            password: c.password.clone(),
        });

    let mut loopback_ip_list = BTreeSet::new();
    if let Some(ip) = b.loopback_ip() {
        loopback_ip_list.insert(ip);
    }

    b.device.system = Some(System {
        name: router.name(),
        uuid: props.uuid.clone(),
        vendor_name: props.vendor.clone(),
        product_name: props.product.clone(),
        device_family: props.device_family.clone(),
        management_ip: props.management_ip.clone(),
        loopback_ip_list,
        physical_role: props.physical_role.clone(),
        routing_bridging_roles: b.roles.rb_roles().clone(),
        credentials,
        encapsulation_priorities: b.fabric.props.encapsulation_priorities.clone(),
        tunnel_ip: None,
        tunnel_destination_networks: BTreeSet::new(),
        is_ucast_gateway_only: b.roles.is_ucast_gateway_only(),
        underlay_asn: b.allocations.underlay_asn,
    });

    b.router_id = router
        .bgp_router
        .map(|id| b.graph.bgp_router(id))
        .and_then(|br| br.props.identifier.clone().or_else(|| br.address().map(str::to_string)))
        .or_else(|| b.loopback_ip());
}

/// Loopback unit, routing options and dynamic tunnels. Runs after the BGP
/// stage so the ASN and peer addresses are known.
pub(super) fn build_underlay(b: &mut DeviceBuilder<'_>) {
    let loopback = b.loopback_ip();
    let lo0 = b.unit("lo0", "0");
    if let Some(ip) = &loopback {
        lo0.ip_addresses.insert(format!("{}/32", ip));
    }

    b.device.routing_options = Some(RoutingOptions {
        router_id: b.router_id.clone(),
        autonomous_system: b.asn,
        resolution_ribs: [naming::RESOLUTION_RIB.to_string()].into_iter().collect(),
    });

    let source = b
        .router
        .props
        .dataplane_ip
        .clone()
        .filter(|ip| !ip.is_empty())
        .or(loopback);
    let Some(source) = source else {
        return;
    };
    let mut destinations: BTreeSet<String> = b.fabric.props.fabric_subnets.iter().cloned().collect();
    destinations.extend(b.peer_addresses.iter().map(|a| format!("{}/32", a)));
    if destinations.is_empty() {
        return;
    }

    if let Some(system) = b.device.system.as_mut() {
        system.tunnel_ip = Some(source.clone());
        system.tunnel_destination_networks = destinations.clone();
    }
    b.device
        .routing_protocols
        .push(RoutingProtocol::DynamicTunnel(DynamicTunnel {
            name: naming::DYNAMIC_TUNNEL.to_string(),
            source_address: source,
            destination_networks: destinations,
        }));
}
