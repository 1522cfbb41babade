//! Names the composer emits. Downstream templates match on these, so they
//! must stay stable across releases.

pub const BGP_GROUP_PREFIX: &str = "_contrail_asn-";
pub const IBGP_EXPORT_POLICY: &str = "_contrail_ibgp_export_policy";
pub const GLOBAL_EXPORT_POLICY: &str = "_contrail_global_export_policy";
pub const SWITCH_COMMUNITY: &str = "_contrail_switch_policy_";
pub const DYNAMIC_TUNNEL: &str = "_contrail_dynamic_tunnel";
pub const PUBLIC_VRF_FILTER: &str = "redirect-to-public-vrf-filter";
pub const RESOLUTION_RIB: &str = "bgp.rtarget.0";
pub const VTEP_INTERFACE: &str = "lo0.0";

/// Families a fabric device may negotiate on overlay sessions
pub const BGP_FAMILIES: [&str; 4] = ["route-target", "inet-vpn", "inet6-vpn", "evpn"];

pub const LACP_ACTIVE: &str = "active";
pub const LACP_ADMIN_KEY: u32 = 1;

/// VLAN id given to untagged units
pub const NATIVE_VLAN_ID: u32 = 4094;

/// Unit offset of per-network loopback units for routed-only networks
pub const L3_LOOPBACK_UNIT_OFFSET: u32 = 1000;

pub fn vrf_name(vn_name: &str, mode: &str, network_id: u32) -> String {
    format!("_contrail_{}-{}-{}", vn_name, mode, network_id)
}

pub fn import_policy_name(ri: &str) -> String {
    format!("{}-import", ri)
}

pub fn export_policy_name(ri: &str) -> String {
    format!("{}-export", ri)
}

/// `target:64512:1` -> `target_64512_1`
pub fn community_name(target: &str) -> String {
    target.replace(':', "_")
}

pub fn switch_target(asn: u32) -> String {
    format!("target:{}:1", asn)
}

pub fn bgp_group_name(asn: u32, suffix: Option<&str>) -> String {
    match suffix {
        Some(s) => format!("{}{}-{}", BGP_GROUP_PREFIX, asn, s),
        None => format!("{}{}", BGP_GROUP_PREFIX, asn),
    }
}

pub fn ae_name(id: u64) -> String {
    format!("ae{}", id)
}

/// LACP system id derived from the ESI's trailing octets
pub fn esi_system_id(esi: &str) -> String {
    let start = esi.len().saturating_sub(17);
    esi[start..].to_string()
}

pub fn bridge_domain_name(vn_name: &str, vni: u32) -> String {
    format!("bd-{}-{}", vn_name, vni)
}

pub fn route_distinguisher(router_id: &str, id: u32) -> String {
    format!("{}:{}", router_id, id)
}

pub fn rib_group_name(ri: &str) -> String {
    format!("{}-rib-group", ri)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(vrf_name("vn1", "l2", 5), "_contrail_vn1-l2-5");
        assert_eq!(community_name("target:64512:8000005"), "target_64512_8000005");
        assert_eq!(bgp_group_name(64512, None), "_contrail_asn-64512");
        assert_eq!(bgp_group_name(64512, Some("rr")), "_contrail_asn-64512-rr");
        assert_eq!(route_distinguisher("10.0.0.1", 1), "10.0.0.1:1");
    }

    #[test]
    fn test_esi_system_id() {
        assert_eq!(esi_system_id("33:33:33:33:33:33:33:33:33:33"), "33:33:33:33:33:33");
        assert_eq!(esi_system_id("00:11:22:33:44:55:66:77:88:99"), "44:55:66:77:88:99");
        assert_eq!(esi_system_id("ab"), "ab");
    }
}
