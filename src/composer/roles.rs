use std::collections::BTreeSet;

use crate::intent::{NodeProfile, PhysicalRouter, VirtualNetwork};

pub const ROLE_SPINE: &str = "spine";
pub const ROLE_PNF: &str = "pnf";
pub const RB_ROUTE_REFLECTOR: &str = "Route-Reflector";
pub const RB_ERB_UCAST_GATEWAY: &str = "ERB-UCAST-Gateway";

/// Feature names a node profile role config can enable
pub mod feature {
    pub const OVERLAY_BGP: &str = "overlay_bgp";
    pub const L2_GATEWAY: &str = "l2_gateway";
    pub const L3_GATEWAY: &str = "l3_gateway";
    pub const DC_GATEWAY: &str = "dc_gateway";
    pub const PNF_SERVICE_CHAIN: &str = "pnf_service_chain";

    pub const ALL: [&str; 5] = [OVERLAY_BGP, L2_GATEWAY, L3_GATEWAY, DC_GATEWAY, PNF_SERVICE_CHAIN];
}

/// Physical and routing/bridging roles of one device, plus the feature
/// list its node profile grants.
#[derive(Debug, Clone)]
pub struct DeviceRoles {
    physical: String,
    rb: BTreeSet<String>,
    features: BTreeSet<String>,
}

impl DeviceRoles {
    /// Role configs are named `<physical>@<rb-role>`; a profile without role
    /// configs grants every feature.
    pub fn new(router: &PhysicalRouter, profile: &NodeProfile) -> Self {
        let physical = router
            .props
            .physical_role
            .clone()
            .unwrap_or_default()
            .to_lowercase();
        let rb: BTreeSet<String> = router.props.routing_bridging_roles.iter().cloned().collect();

        let features = if profile.props.role_configs.is_empty() {
            feature::ALL.iter().map(|f| f.to_string()).collect()
        } else {
            let wanted: BTreeSet<String> = rb
                .iter()
                .map(|r| format!("{}@{}", physical, r).to_lowercase())
                .collect();
            profile
                .props
                .role_configs
                .iter()
                .filter(|rc| wanted.contains(&rc.name.to_lowercase()))
                .flat_map(|rc| rc.features.iter().cloned())
                .collect()
        };

        Self { physical, rb, features }
    }

    pub fn physical(&self) -> &str {
        &self.physical
    }

    pub fn rb_roles(&self) -> &BTreeSet<String> {
        &self.rb
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains(name)
    }

    pub fn is_spine(&self) -> bool {
        self.physical == ROLE_SPINE
    }

    pub fn is_pnf(&self) -> bool {
        self.physical == ROLE_PNF
    }

    /// Devices whose only job is reflecting routes
    pub fn is_rr_only(&self) -> bool {
        self.rb.len() == 1 && self.rb.contains(RB_ROUTE_REFLECTOR)
    }

    pub fn is_ucast_gateway_only(&self) -> bool {
        self.rb.len() == 1 && self.rb.contains(RB_ERB_UCAST_GATEWAY)
    }

    pub fn is_l2_supported(&self, vn: &VirtualNetwork) -> bool {
        vn.props.forwarding_mode.has_l2()
            && !self.is_rr_only()
            && !self.is_pnf()
            && self.has_feature(feature::L2_GATEWAY)
    }

    pub fn is_l3_supported(&self, vn: &VirtualNetwork) -> bool {
        vn.props.forwarding_mode.has_l3() && self.is_spine() && self.has_feature(feature::L3_GATEWAY)
    }
}
