//! Cross-object checks run at the northbound boundary. The composer
//! assumes a graph that passed these.

use std::collections::BTreeSet;

use super::Graph;
use crate::error::{PipelineError, Result};

/// Owner string of VMIs that belong to compute instances
pub const VM_DEVICE_OWNER: &str = "virtual-machine";

pub fn validate_graph(g: &Graph) -> Result<()> {
    check_route_tables(g)?;
    check_logical_routers(g)?;
    Ok(())
}

/// Two routes in one table may not share a prefix
fn check_route_tables(g: &Graph) -> Result<()> {
    for (_, rt) in g.route_tables() {
        let mut seen = BTreeSet::new();
        for route in &rt.props.routes {
            if !seen.insert(route.prefix.as_str()) {
                return Err(PipelineError::BadRequest(format!(
                    "route table {} has duplicate prefix {}",
                    rt.name(),
                    route.prefix
                )));
            }
        }
    }
    Ok(())
}

fn check_logical_routers(g: &Graph) -> Result<()> {
    for (lr_id, lr) in g.lrs() {
        for vmi in &lr.vmis {
            let vmi = g.vmi(*vmi);
            if vmi.props.device_owner.as_deref() == Some(VM_DEVICE_OWNER) {
                return Err(PipelineError::BadRequest(format!(
                    "virtual machine port {} cannot be attached to logical router {}",
                    vmi.props.uuid,
                    lr.name()
                )));
            }
        }

        let internal: BTreeSet<_> = g.lr_networks(lr_id).into_iter().collect();
        for vn in &lr.external_networks {
            if internal.contains(vn) {
                return Err(PipelineError::BadRequest(format!(
                    "virtual network {} is both internal and external on logical router {}",
                    g.vn(*vn).name(),
                    lr.name()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::tests::{fq, sample_objects};
    use crate::intent::*;

    fn lr(vmis: &[&str], external: &[&str]) -> IntentObject {
        IntentObject::LogicalRouter(LogicalRouterObject {
            uuid: "lr-1".into(),
            fq_name: fq(&["default-domain", "admin", "lr1"]),
            virtual_machine_interfaces: vmis.iter().map(|s| s.to_string()).collect(),
            external_networks: external.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_duplicate_prefix_route_rejected() {
        let mut objects = sample_objects();
        objects.push(IntentObject::RouteTable(RouteTableObject {
            uuid: "rt-1".into(),
            fq_name: fq(&["default-domain", "admin", "rt1"]),
            routes: vec![
                Route { prefix: "1.1.1.1/0".into(), next_hop: None },
                Route { prefix: "1.1.1.1/0".into(), next_hop: Some("10.0.0.1".into()) },
            ],
        }));
        let err = Graph::build_validated(objects).err().unwrap();
        assert_eq!(err.kind(), "bad_request");
        assert!(err.to_string().contains("duplicate prefix 1.1.1.1/0"));
    }

    #[test]
    fn test_vm_port_on_logical_router_rejected() {
        let mut objects = sample_objects();
        if let IntentObject::VirtualMachineInterface(vmi) = &mut objects[5] {
            vmi.device_owner = Some(VM_DEVICE_OWNER.into());
        }
        objects.push(lr(&["vmi-1"], &[]));
        let err = Graph::build_validated(objects).err().unwrap();
        assert_eq!(err.kind(), "bad_request");
    }

    #[test]
    fn test_internal_and_external_overlap_rejected() {
        let mut objects = sample_objects();
        objects.push(lr(&["vmi-1"], &["vn-1"]));
        let err = Graph::build_validated(objects).err().unwrap();
        assert!(err.to_string().contains("both internal and external"));
    }

    #[test]
    fn test_well_formed_logical_router_accepted() {
        let mut objects = sample_objects();
        objects.push(lr(&["vmi-1"], &[]));
        let g = Graph::build_validated(objects).unwrap();
        let (lr_id, _) = g.lrs().next().unwrap();
        assert_eq!(g.lr_networks(lr_id).len(), 1);
        let vn = g.vn_by_name("vn1").unwrap();
        assert_eq!(g.vn(vn).logical_routers, vec![lr_id]);
    }
}
