//! Read-only intent graph.
//!
//! Entities live in per-type arenas and refer to each other through typed
//! handles, with back-references filled in at build time. A built
//! [`Graph`] is immutable; every reconcile pass works on one `Arc<Graph>`
//! snapshot.

#[cfg(test)]
pub(crate) mod fixtures;
pub mod objects;
pub mod registry;
pub mod validate;

use std::collections::HashMap;

use crate::error::{PipelineError, Result};
pub use objects::*;
pub use registry::TypeRegistry;

macro_rules! entity_id {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u32);

            impl $name {
                pub fn index(self) -> usize {
                    self.0 as usize
                }
            }
        )*
    };
}

entity_id!(
    FabricId,
    /// Physical router
    PrId,
    /// Physical interface
    PiId,
    /// Logical interface
    LiId,
    /// Virtual network
    VnId,
    /// Virtual machine interface
    VmiId,
    /// Logical router
    LrId,
    RouteTableId,
    BgpRouterId,
    NodeProfileId,
    /// Service instance
    SiId,
);

/// Name prefix of the per-LR internal network
pub const LR_INTERNAL_VN_PREFIX: &str = "__contrail_lr_internal_vn_";

fn last_name(fq_name: &[String]) -> String {
    fq_name.last().cloned().unwrap_or_default()
}

pub struct Fabric {
    pub props: FabricObject,
    pub physical_routers: Vec<PrId>,
    pub node_profiles: Vec<NodeProfileId>,
}

impl Fabric {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }
}

pub struct PhysicalRouter {
    pub props: PhysicalRouterObject,
    pub fabric: Option<FabricId>,
    pub node_profile: Option<NodeProfileId>,
    pub bgp_router: Option<BgpRouterId>,
    pub physical_interfaces: Vec<PiId>,
    pub logical_routers: Vec<LrId>,
    pub service_instances: Vec<SiId>,
}

impl PhysicalRouter {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }

    pub fn uuid(&self) -> &str {
        &self.props.uuid
    }
}

pub struct PhysicalInterface {
    pub props: PhysicalInterfaceObject,
    pub physical_router: PrId,
    pub logical_interfaces: Vec<LiId>,
    pub links: Vec<PiId>,
}

impl PhysicalInterface {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }

    /// ESI when set to something other than all-zero
    pub fn esi(&self) -> Option<&str> {
        self.props
            .esi
            .as_deref()
            .filter(|e| e.chars().any(|c| c.is_ascii_hexdigit() && c != '0'))
    }
}

pub struct LogicalInterface {
    pub props: LogicalInterfaceObject,
    pub physical_interface: PiId,
    pub vmis: Vec<VmiId>,
}

impl LogicalInterface {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }
}

pub struct VirtualNetwork {
    pub props: VirtualNetworkObject,
    pub vmis: Vec<VmiId>,
    pub logical_routers: Vec<LrId>,
}

impl VirtualNetwork {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }

    pub fn is_internal(&self) -> bool {
        self.name().starts_with(LR_INTERNAL_VN_PREFIX)
    }

    /// Import targets, shared targets first
    pub fn import_targets(&self) -> Vec<String> {
        let mut out = self.props.route_targets.clone();
        out.extend(self.props.import_route_targets.iter().cloned());
        out.retain(|t| !t.trim().is_empty());
        out
    }

    pub fn export_targets(&self) -> Vec<String> {
        let mut out = self.props.route_targets.clone();
        out.extend(self.props.export_route_targets.iter().cloned());
        out.retain(|t| !t.trim().is_empty());
        out
    }
}

pub struct VirtualMachineInterface {
    pub props: VirtualMachineInterfaceObject,
    pub virtual_network: VnId,
    pub logical_interfaces: Vec<LiId>,
    pub logical_routers: Vec<LrId>,
}

pub struct LogicalRouter {
    pub props: LogicalRouterObject,
    pub vmis: Vec<VmiId>,
    pub physical_routers: Vec<PrId>,
    pub external_networks: Vec<VnId>,
    pub route_table: Option<RouteTableId>,
}

impl LogicalRouter {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }

    /// Name of the LR's internal network
    pub fn internal_vn_name(&self) -> String {
        format!("{}{}__", LR_INTERNAL_VN_PREFIX, self.props.uuid)
    }
}

pub struct RouteTable {
    pub props: RouteTableObject,
}

impl RouteTable {
    pub fn name(&self) -> String {
        last_name(&self.props.fq_name)
    }
}

pub struct BgpRouter {
    pub props: BgpRouterObject,
    pub physical_router: Option<PrId>,
    pub peers: Vec<(BgpRouterId, BgpPeering)>,
}

impl BgpRouter {
    /// Local ASN wins over the global one
    pub fn asn(&self) -> u32 {
        self.props
            .local_autonomous_system
            .unwrap_or(self.props.autonomous_system)
    }

    pub fn address(&self) -> Option<&str> {
        self.props.address.as_deref().filter(|a| !a.is_empty())
    }

    pub fn is_route_reflector(&self) -> bool {
        self.props.cluster_id.is_some()
    }
}

pub struct NodeProfile {
    pub props: NodeProfileObject,
}

pub struct ServiceInstance {
    pub props: ServiceInstanceObject,
    pub physical_routers: Vec<PrId>,
    pub left_network: Option<VnId>,
    pub right_network: Option<VnId>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Fabric(FabricId),
    Pr(PrId),
    Pi(PiId),
    Li(LiId),
    Vn(VnId),
    Vmi(VmiId),
    Lr(LrId),
    RouteTable(RouteTableId),
    BgpRouter(BgpRouterId),
    NodeProfile(NodeProfileId),
    Si(SiId),
}

/// Immutable intent snapshot
#[derive(Default)]
pub struct Graph {
    fabrics: Vec<Fabric>,
    routers: Vec<PhysicalRouter>,
    pis: Vec<PhysicalInterface>,
    lis: Vec<LogicalInterface>,
    vns: Vec<VirtualNetwork>,
    vmis: Vec<VirtualMachineInterface>,
    lrs: Vec<LogicalRouter>,
    route_tables: Vec<RouteTable>,
    bgp_routers: Vec<BgpRouter>,
    node_profiles: Vec<NodeProfile>,
    service_instances: Vec<ServiceInstance>,
    by_uuid: HashMap<String, Slot>,
}

macro_rules! resolver {
    ($fn_name:ident, $variant:ident, $id:ty, $type_name:expr) => {
        fn $fn_name(&self, uuid: &str, referrer: &str) -> Result<$id> {
            match self.by_uuid.get(uuid) {
                Some(Slot::$variant(id)) => Ok(*id),
                _ => Err(PipelineError::BadRequest(format!(
                    "{} refers to unknown {} {}",
                    referrer, $type_name, uuid
                ))),
            }
        }
    };
}

impl Graph {
    resolver!(fabric_ref, Fabric, FabricId, "fabric");
    resolver!(pr_ref, Pr, PrId, "physical-router");
    resolver!(pi_ref, Pi, PiId, "physical-interface");
    resolver!(vn_ref, Vn, VnId, "virtual-network");
    resolver!(vmi_ref, Vmi, VmiId, "virtual-machine-interface");
    resolver!(route_table_ref, RouteTable, RouteTableId, "route-table");
    resolver!(bgp_router_ref, BgpRouter, BgpRouterId, "bgp-router");
    resolver!(node_profile_ref, NodeProfile, NodeProfileId, "node-profile");

    /// Build a graph from decoded objects, resolving every ref.
    /// Unknown refs and duplicate uuids are `bad_request`.
    pub fn build(objects: Vec<IntentObject>) -> Result<Graph> {
        let mut g = Graph::default();

        // Pass 1: place every object in its arena
        let mut pending = Vec::with_capacity(objects.len());
        for obj in objects {
            let uuid = obj.uuid().to_string();
            if uuid.is_empty() {
                return Err(PipelineError::BadRequest(format!(
                    "{} {:?} has no uuid",
                    obj.type_name(),
                    obj.fq_name()
                )));
            }
            if g.by_uuid.contains_key(&uuid) {
                return Err(PipelineError::BadRequest(format!("duplicate uuid {}", uuid)));
            }
            let slot = g.place(obj.clone());
            g.by_uuid.insert(uuid, slot);
            pending.push((slot, obj));
        }

        // Pass 2: resolve refs and back-refs
        for (slot, obj) in pending {
            g.link(slot, &obj)?;
        }
        g.finish();
        Ok(g)
    }

    fn place(&mut self, obj: IntentObject) -> Slot {
        match obj {
            IntentObject::Fabric(props) => {
                self.fabrics.push(Fabric {
                    props,
                    physical_routers: Vec::new(),
                    node_profiles: Vec::new(),
                });
                Slot::Fabric(FabricId(self.fabrics.len() as u32 - 1))
            }
            IntentObject::PhysicalRouter(props) => {
                self.routers.push(PhysicalRouter {
                    props,
                    fabric: None,
                    node_profile: None,
                    bgp_router: None,
                    physical_interfaces: Vec::new(),
                    logical_routers: Vec::new(),
                    service_instances: Vec::new(),
                });
                Slot::Pr(PrId(self.routers.len() as u32 - 1))
            }
            IntentObject::PhysicalInterface(props) => {
                self.pis.push(PhysicalInterface {
                    props,
                    physical_router: PrId(0),
                    logical_interfaces: Vec::new(),
                    links: Vec::new(),
                });
                Slot::Pi(PiId(self.pis.len() as u32 - 1))
            }
            IntentObject::LogicalInterface(props) => {
                self.lis.push(LogicalInterface {
                    props,
                    physical_interface: PiId(0),
                    vmis: Vec::new(),
                });
                Slot::Li(LiId(self.lis.len() as u32 - 1))
            }
            IntentObject::VirtualNetwork(props) => {
                self.vns.push(VirtualNetwork {
                    props,
                    vmis: Vec::new(),
                    logical_routers: Vec::new(),
                });
                Slot::Vn(VnId(self.vns.len() as u32 - 1))
            }
            IntentObject::VirtualMachineInterface(props) => {
                self.vmis.push(VirtualMachineInterface {
                    props,
                    virtual_network: VnId(0),
                    logical_interfaces: Vec::new(),
                    logical_routers: Vec::new(),
                });
                Slot::Vmi(VmiId(self.vmis.len() as u32 - 1))
            }
            IntentObject::LogicalRouter(props) => {
                self.lrs.push(LogicalRouter {
                    props,
                    vmis: Vec::new(),
                    physical_routers: Vec::new(),
                    external_networks: Vec::new(),
                    route_table: None,
                });
                Slot::Lr(LrId(self.lrs.len() as u32 - 1))
            }
            IntentObject::RouteTable(props) => {
                self.route_tables.push(RouteTable { props });
                Slot::RouteTable(RouteTableId(self.route_tables.len() as u32 - 1))
            }
            IntentObject::BgpRouter(props) => {
                self.bgp_routers.push(BgpRouter {
                    props,
                    physical_router: None,
                    peers: Vec::new(),
                });
                Slot::BgpRouter(BgpRouterId(self.bgp_routers.len() as u32 - 1))
            }
            IntentObject::NodeProfile(props) => {
                self.node_profiles.push(NodeProfile { props });
                Slot::NodeProfile(NodeProfileId(self.node_profiles.len() as u32 - 1))
            }
            IntentObject::ServiceInstance(props) => {
                self.service_instances.push(ServiceInstance {
                    props,
                    physical_routers: Vec::new(),
                    left_network: None,
                    right_network: None,
                });
                Slot::Si(SiId(self.service_instances.len() as u32 - 1))
            }
        }
    }

    fn link(&mut self, slot: Slot, obj: &IntentObject) -> Result<()> {
        let who = format!("{} {}", obj.type_name(), obj.uuid());
        match (slot, obj) {
            (Slot::Fabric(id), IntentObject::Fabric(o)) => {
                let profiles = o
                    .node_profiles
                    .iter()
                    .map(|u| self.node_profile_ref(u, &who))
                    .collect::<Result<Vec<_>>>()?;
                self.fabrics[id.index()].node_profiles = profiles;
            }
            (Slot::Pr(id), IntentObject::PhysicalRouter(o)) => {
                if let Some(f) = &o.fabric {
                    let fid = self.fabric_ref(f, &who)?;
                    self.routers[id.index()].fabric = Some(fid);
                    self.fabrics[fid.index()].physical_routers.push(id);
                }
                if let Some(np) = &o.node_profile {
                    let npid = self.node_profile_ref(np, &who)?;
                    self.routers[id.index()].node_profile = Some(npid);
                }
                if let Some(b) = &o.bgp_router {
                    let bid = self.bgp_router_ref(b, &who)?;
                    self.routers[id.index()].bgp_router = Some(bid);
                    self.bgp_routers[bid.index()].physical_router = Some(id);
                }
            }
            (Slot::Pi(id), IntentObject::PhysicalInterface(o)) => {
                let pr = self.pr_ref(&o.physical_router, &who)?;
                self.pis[id.index()].physical_router = pr;
                self.routers[pr.index()].physical_interfaces.push(id);
                let links = o
                    .links
                    .iter()
                    .map(|u| self.pi_ref(u, &who))
                    .collect::<Result<Vec<_>>>()?;
                self.pis[id.index()].links = links;
            }
            (Slot::Li(id), IntentObject::LogicalInterface(o)) => {
                let pi = self.pi_ref(&o.physical_interface, &who)?;
                self.lis[id.index()].physical_interface = pi;
                self.pis[pi.index()].logical_interfaces.push(id);
                for vmi in &o.virtual_machine_interfaces {
                    let vid = self.vmi_ref(vmi, &who)?;
                    self.lis[id.index()].vmis.push(vid);
                    self.vmis[vid.index()].logical_interfaces.push(id);
                }
            }
            (Slot::Vmi(id), IntentObject::VirtualMachineInterface(o)) => {
                let vn = self.vn_ref(&o.virtual_network, &who)?;
                self.vmis[id.index()].virtual_network = vn;
                self.vns[vn.index()].vmis.push(id);
            }
            (Slot::Lr(id), IntentObject::LogicalRouter(o)) => {
                for vmi in &o.virtual_machine_interfaces {
                    let vid = self.vmi_ref(vmi, &who)?;
                    self.lrs[id.index()].vmis.push(vid);
                    self.vmis[vid.index()].logical_routers.push(id);
                }
                for pr in &o.physical_routers {
                    let pid = self.pr_ref(pr, &who)?;
                    self.lrs[id.index()].physical_routers.push(pid);
                    self.routers[pid.index()].logical_routers.push(id);
                }
                for vn in &o.external_networks {
                    let vid = self.vn_ref(vn, &who)?;
                    self.lrs[id.index()].external_networks.push(vid);
                }
                if let Some(rt) = &o.route_table {
                    self.lrs[id.index()].route_table = Some(self.route_table_ref(rt, &who)?);
                }
            }
            (Slot::BgpRouter(id), IntentObject::BgpRouter(o)) => {
                let peers = o
                    .peers
                    .iter()
                    .map(|p| Ok((self.bgp_router_ref(&p.bgp_router, &who)?, p.clone())))
                    .collect::<Result<Vec<_>>>()?;
                self.bgp_routers[id.index()].peers = peers;
            }
            (Slot::Si(id), IntentObject::ServiceInstance(o)) => {
                for pr in &o.physical_routers {
                    let pid = self.pr_ref(pr, &who)?;
                    self.service_instances[id.index()].physical_routers.push(pid);
                    self.routers[pid.index()].service_instances.push(id);
                }
                if let Some(vn) = &o.left_network {
                    self.service_instances[id.index()].left_network = Some(self.vn_ref(vn, &who)?);
                }
                if let Some(vn) = &o.right_network {
                    self.service_instances[id.index()].right_network = Some(self.vn_ref(vn, &who)?);
                }
            }
            // VNs, route tables and node profiles carry no outgoing refs
            _ => {}
        }
        Ok(())
    }

    // Back-refs from VMIs to LRs are needed on VNs too
    fn finish(&mut self) {
        for lr_idx in 0..self.lrs.len() {
            let lr_id = LrId(lr_idx as u32);
            let vns: Vec<VnId> = self.lrs[lr_idx]
                .vmis
                .iter()
                .map(|v| self.vmis[v.index()].virtual_network)
                .collect();
            for vn in vns {
                let list = &mut self.vns[vn.index()].logical_routers;
                if !list.contains(&lr_id) {
                    list.push(lr_id);
                }
            }
        }
    }

    /// Build and run cross-object validation
    pub fn build_validated(objects: Vec<IntentObject>) -> Result<Graph> {
        let g = Self::build(objects)?;
        validate::validate_graph(&g)?;
        Ok(g)
    }

    pub fn fabric(&self, id: FabricId) -> &Fabric {
        &self.fabrics[id.index()]
    }

    pub fn pr(&self, id: PrId) -> &PhysicalRouter {
        &self.routers[id.index()]
    }

    pub fn pi(&self, id: PiId) -> &PhysicalInterface {
        &self.pis[id.index()]
    }

    pub fn li(&self, id: LiId) -> &LogicalInterface {
        &self.lis[id.index()]
    }

    pub fn vn(&self, id: VnId) -> &VirtualNetwork {
        &self.vns[id.index()]
    }

    pub fn vmi(&self, id: VmiId) -> &VirtualMachineInterface {
        &self.vmis[id.index()]
    }

    pub fn lr(&self, id: LrId) -> &LogicalRouter {
        &self.lrs[id.index()]
    }

    pub fn route_table(&self, id: RouteTableId) -> &RouteTable {
        &self.route_tables[id.index()]
    }

    pub fn bgp_router(&self, id: BgpRouterId) -> &BgpRouter {
        &self.bgp_routers[id.index()]
    }

    pub fn node_profile(&self, id: NodeProfileId) -> &NodeProfile {
        &self.node_profiles[id.index()]
    }

    pub fn service_instance(&self, id: SiId) -> &ServiceInstance {
        &self.service_instances[id.index()]
    }

    pub fn fabrics(&self) -> impl Iterator<Item = (FabricId, &Fabric)> {
        self.fabrics.iter().enumerate().map(|(i, f)| (FabricId(i as u32), f))
    }

    pub fn routers(&self) -> impl Iterator<Item = (PrId, &PhysicalRouter)> {
        self.routers.iter().enumerate().map(|(i, p)| (PrId(i as u32), p))
    }

    pub fn vns(&self) -> impl Iterator<Item = (VnId, &VirtualNetwork)> {
        self.vns.iter().enumerate().map(|(i, v)| (VnId(i as u32), v))
    }

    pub fn lrs(&self) -> impl Iterator<Item = (LrId, &LogicalRouter)> {
        self.lrs.iter().enumerate().map(|(i, l)| (LrId(i as u32), l))
    }

    pub fn route_tables(&self) -> impl Iterator<Item = (RouteTableId, &RouteTable)> {
        self.route_tables
            .iter()
            .enumerate()
            .map(|(i, r)| (RouteTableId(i as u32), r))
    }

    pub fn service_instances(&self) -> impl Iterator<Item = (SiId, &ServiceInstance)> {
        self.service_instances
            .iter()
            .enumerate()
            .map(|(i, s)| (SiId(i as u32), s))
    }

    pub fn fabric_by_name(&self, name: &str) -> Option<FabricId> {
        self.fabrics().find(|(_, f)| f.name() == name).map(|(id, _)| id)
    }

    pub fn pr_by_uuid(&self, uuid: &str) -> Option<PrId> {
        match self.by_uuid.get(uuid) {
            Some(Slot::Pr(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn pi_by_uuid(&self, uuid: &str) -> Option<PiId> {
        match self.by_uuid.get(uuid) {
            Some(Slot::Pi(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn vn_by_name(&self, name: &str) -> Option<VnId> {
        self.vns().find(|(_, v)| v.name() == name).map(|(id, _)| id)
    }

    /// The LR's internal network, if present in the snapshot
    pub fn lr_internal_vn(&self, lr: LrId) -> Option<VnId> {
        self.vn_by_name(&self.lr(lr).internal_vn_name())
    }

    /// Networks attached to an LR through its VMIs
    pub fn lr_networks(&self, lr: LrId) -> Vec<VnId> {
        let mut out: Vec<VnId> = self
            .lr(lr)
            .vmis
            .iter()
            .map(|v| self.vmi(*v).virtual_network)
            .collect();
        out.sort();
        out.dedup();
        out
    }

    /// Networks reached through VMIs bound to a router's interfaces
    pub fn pr_port_networks(&self, pr: PrId) -> Vec<VnId> {
        let mut out = Vec::new();
        for pi in &self.pr(pr).physical_interfaces {
            for li in &self.pi(*pi).logical_interfaces {
                for vmi in &self.li(*li).vmis {
                    out.push(self.vmi(*vmi).virtual_network);
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    pub fn object_count(&self) -> usize {
        self.by_uuid.len()
    }
}
