use super::roles::feature;
use super::DeviceBuilder;
use crate::abstract_config::{SecurityPolicy, SecurityZone};
use crate::intent::VnId;

/// Security zones and a permit policy per service instance on a PNF
pub(super) fn build(b: &mut DeviceBuilder<'_>) {
    if !b.roles.is_pnf() || !b.roles.has_feature(feature::PNF_SERVICE_CHAIN) {
        return;
    }
    let graph = b.graph;
    let router = b.router;
    for si_id in &router.service_instances {
        let si = graph.service_instance(*si_id);
        let si_name = si.props.fq_name.last().cloned().unwrap_or_default();
        let zone = |side: &str, vn: Option<VnId>| SecurityZone {
            name: format!("{}-{}", si_name, side),
            interfaces: vn
                .and_then(|vn| b.vn_members.get(&vn))
                .cloned()
                .unwrap_or_default(),
        };
        let left = zone("left", si.left_network);
        let right = zone("right", si.right_network);

        b.device.security_policies.push(SecurityPolicy {
            from_zone: left.name.clone(),
            to_zone: right.name.clone(),
            policy_name: format!("{}-left-right", si_name),
            action: "permit".to_string(),
        });
        b.device.security_policies.push(SecurityPolicy {
            from_zone: right.name.clone(),
            to_zone: left.name.clone(),
            policy_name: format!("{}-right-left", si_name),
            action: "permit".to_string(),
        });
        b.device.security_zones.push(left);
        b.device.security_zones.push(right);
    }
}

#[cfg(test)]
mod tests {
    use crate::composer::{Composer, DeviceAllocations};
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy, CoordClient};
    use crate::intent::fixtures::{self, fabric_objects};
    use crate::intent::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_pnf_zones() {
        let mut objects = fabric_objects();
        objects.push(IntentObject::PhysicalRouter(PhysicalRouterObject {
            uuid: "pr-pnf".into(),
            fq_name: vec!["gsc".into(), "srx1".into()],
            physical_role: Some("pnf".into()),
            routing_bridging_roles: vec!["PNF-Servicechain".into()],
            fabric: Some(fixtures::FABRIC.into()),
            node_profile: Some("np-1".into()),
            vnc_managed: true,
            ..Default::default()
        }));
        objects.push(IntentObject::PhysicalInterface(PhysicalInterfaceObject {
            uuid: "pi-pnf".into(),
            fq_name: vec!["gsc".into(), "srx1".into(), "ge-0/0/0".into()],
            physical_router: "pr-pnf".into(),
            ..Default::default()
        }));
        objects.push(IntentObject::VirtualMachineInterface(VirtualMachineInterfaceObject {
            uuid: "vmi-pnf".into(),
            fq_name: vec!["vmi-pnf".into()],
            virtual_network: "vn-1".into(),
            device_owner: None,
        }));
        objects.push(IntentObject::LogicalInterface(LogicalInterfaceObject {
            uuid: "li-pnf".into(),
            fq_name: vec!["ge-0/0/0.10".into()],
            physical_interface: "pi-pnf".into(),
            vlan_tag: 10,
            virtual_machine_interfaces: vec!["vmi-pnf".into()],
        }));
        objects.push(IntentObject::ServiceInstance(ServiceInstanceObject {
            uuid: "si-1".into(),
            fq_name: vec!["default-domain".into(), "admin".into(), "fw".into()],
            physical_routers: vec!["pr-pnf".into()],
            left_network: Some("vn-1".into()),
            right_network: Some("vn-native".into()),
        }));
        let g = Graph::build_validated(objects).unwrap();

        let coord = CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap();
        let pr = g.pr_by_uuid("pr-pnf").unwrap();
        let d = Composer::new(coord, 128)
            .build(&g, pr, &DeviceAllocations::default())
            .await
            .unwrap()
            .device;

        assert_eq!(d.security_zones.len(), 2);
        let left = d.security_zones.iter().find(|z| z.name == "fw-left").unwrap();
        assert!(left.interfaces.contains("ge-0/0/0.10"));
        assert_eq!(d.security_policies.len(), 2);
        assert!(d.routing_instances.is_empty());
    }
}
