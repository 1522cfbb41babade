use std::collections::BTreeMap;

use super::naming::{self, LACP_ACTIVE, LACP_ADMIN_KEY, NATIVE_VLAN_ID};
use super::DeviceBuilder;
use crate::abstract_config::LinkAggregation;
use crate::alloc::AeIdPool;
use crate::error::{PipelineError, Result};
use crate::intent::{LiId, PiId};

/// Units for bound logical interfaces, and AE bundles for ESI-tagged
/// ports. Records which unit carries which network on `b.vn_members`.
pub(super) async fn build(b: &mut DeviceBuilder<'_>, ae_pool: &AeIdPool) -> Result<()> {
    let graph = b.graph;
    let router = b.router;
    let mut bonds: BTreeMap<String, Vec<PiId>> = BTreeMap::new();

    for pi_id in &router.physical_interfaces {
        let pi = graph.pi(*pi_id);
        let bound: Vec<LiId> = pi
            .logical_interfaces
            .iter()
            .copied()
            .filter(|li| !graph.li(*li).vmis.is_empty())
            .collect();
        if bound.is_empty() {
            continue;
        }
        match pi.esi() {
            Some(esi) => bonds.entry(esi.to_string()).or_default().push(*pi_id),
            None => add_units(b, &pi.name(), &bound),
        }
    }

    for (esi, members) in bonds {
        let ae_id = match ae_pool.ae_id(router.uuid(), &esi).await {
            Ok(id) => id,
            Err(PipelineError::ResourceExhausted(msg)) => {
                b.warn(format!("no AE id left for esi {}: {}", esi, msg));
                continue;
            }
            Err(e) => return Err(e),
        };
        let ae = naming::ae_name(ae_id);

        let bundle = b.interface(&ae);
        bundle.interface_type = Some("lag".to_string());
        bundle.ethernet_segment_identifier = Some(esi.clone());
        bundle.link_aggregation = Some(LinkAggregation {
            lacp_mode: LACP_ACTIVE.to_string(),
            system_id: naming::esi_system_id(&esi),
            admin_key: LACP_ADMIN_KEY,
            system_priority: 0,
        });

        for pi_id in members {
            let pi = graph.pi(pi_id);
            let member = b.interface(&pi.name());
            member.link_aggregation_group = Some(ae.clone());
            let bound: Vec<LiId> = pi
                .logical_interfaces
                .iter()
                .copied()
                .filter(|li| !graph.li(*li).vmis.is_empty())
                .collect();
            add_units(b, &ae, &bound);
        }
        b.esis.insert(esi);
    }
    Ok(())
}

/// Untagged units become unit 0 on the native VLAN
fn add_units(b: &mut DeviceBuilder<'_>, pi_name: &str, lis: &[LiId]) {
    let graph = b.graph;
    for li_id in lis {
        let li = graph.li(*li_id);
        let (unit, vlan_id, native) = match li.props.vlan_tag {
            0 => ("0".to_string(), NATIVE_VLAN_ID, Some(NATIVE_VLAN_ID)),
            tag => (tag.to_string(), tag, None),
        };

        let pi = b.interface(pi_name);
        pi.flexible_vlan_tagging = true;
        pi.encapsulation = Some("extended-vlan-bridge".to_string());
        let unit = b.unit(pi_name, &unit);
        unit.vlan_id = Some(vlan_id);
        unit.native_vlan_id = native;
        let unit_name = unit.name.clone();

        for vmi in &li.vmis {
            let vn = graph.vmi(*vmi).virtual_network;
            b.vn_members.entry(vn).or_default().insert(unit_name.clone());
        }
    }
}
