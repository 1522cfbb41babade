//! Type registry: intent type name -> constructor + validator.

use regex_lite::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::objects::*;
use super::Graph;
use crate::error::{PipelineError, Result};

type Constructor = fn(Value) -> Result<IntentObject>;
type Validator = fn(&IntentObject) -> Result<()>;

struct Entry {
    construct: Constructor,
    validate: Validator,
}

/// Maps intent type names to typed constructors and per-object validators
pub struct TypeRegistry {
    entries: BTreeMap<&'static str, Entry>,
}

/// One object as it appears in a snapshot document
#[derive(Debug, Deserialize)]
struct RawObject {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(flatten)]
    body: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    objects: Vec<RawObject>,
}

fn decode<T: DeserializeOwned>(type_name: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| PipelineError::BadRequest(format!("invalid {}: {}", type_name, e)))
}

fn is_valid_esi(esi: &str) -> bool {
    static ESI: OnceLock<Option<Regex>> = OnceLock::new();
    ESI.get_or_init(|| Regex::new(r"^([0-9a-fA-F]{2}:){9}[0-9a-fA-F]{2}$").ok())
        .as_ref()
        .map_or(false, |re| re.is_match(esi))
}

fn check_prefix(owner: &str, prefix: &str) -> Result<()> {
    prefix
        .parse::<ipnet::IpNet>()
        .map(|_| ())
        .map_err(|_| PipelineError::BadRequest(format!("{}: invalid prefix {}", owner, prefix)))
}

fn no_checks(_: &IntentObject) -> Result<()> {
    Ok(())
}

fn validate_fabric(obj: &IntentObject) -> Result<()> {
    if let IntentObject::Fabric(f) = obj {
        for prefix in f
            .management_subnets
            .iter()
            .chain(&f.loopback_subnets)
            .chain(&f.fabric_subnets)
            .chain(&f.pnf_servicechain_subnets)
        {
            check_prefix(&f.uuid, prefix)?;
        }
        if !f.ebgp_asn_pool.is_empty() {
            crate::alloc::validate_ranges(&f.ebgp_asn_pool)?;
        }
    }
    Ok(())
}

fn validate_physical_interface(obj: &IntentObject) -> Result<()> {
    if let IntentObject::PhysicalInterface(pi) = obj {
        if let Some(esi) = &pi.esi {
            if !is_valid_esi(esi) {
                return Err(PipelineError::BadRequest(format!(
                    "physical-interface {}: invalid esi {}",
                    pi.uuid, esi
                )));
            }
        }
    }
    Ok(())
}

fn validate_logical_interface(obj: &IntentObject) -> Result<()> {
    if let IntentObject::LogicalInterface(li) = obj {
        if li.vlan_tag > 4094 {
            return Err(PipelineError::BadRequest(format!(
                "logical-interface {}: vlan tag {} out of range",
                li.uuid, li.vlan_tag
            )));
        }
    }
    Ok(())
}

fn validate_virtual_network(obj: &IntentObject) -> Result<()> {
    if let IntentObject::VirtualNetwork(vn) = obj {
        for subnet in &vn.subnets {
            check_prefix(&vn.uuid, &subnet.prefix)?;
        }
        if let Some(vni) = vn.vni {
            if vni == 0 || vni >= 1 << 24 {
                return Err(PipelineError::BadRequest(format!(
                    "virtual-network {}: vni {} out of range",
                    vn.uuid, vni
                )));
            }
        }
    }
    Ok(())
}

fn validate_route_table(obj: &IntentObject) -> Result<()> {
    if let IntentObject::RouteTable(rt) = obj {
        for route in &rt.routes {
            check_prefix(&rt.uuid, &route.prefix)?;
        }
    }
    Ok(())
}

macro_rules! constructor {
    ($variant:ident, $ty:ty, $name:expr) => {
        |value: Value| -> Result<IntentObject> { Ok(IntentObject::$variant(decode::<$ty>($name, value)?)) }
    };
}

impl TypeRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with every intent type the pipeline understands
    pub fn standard() -> Self {
        let mut r = Self::empty();
        r.register("fabric", constructor!(Fabric, FabricObject, "fabric"), validate_fabric);
        r.register(
            "physical-router",
            constructor!(PhysicalRouter, PhysicalRouterObject, "physical-router"),
            no_checks,
        );
        r.register(
            "physical-interface",
            constructor!(PhysicalInterface, PhysicalInterfaceObject, "physical-interface"),
            validate_physical_interface,
        );
        r.register(
            "logical-interface",
            constructor!(LogicalInterface, LogicalInterfaceObject, "logical-interface"),
            validate_logical_interface,
        );
        r.register(
            "virtual-network",
            constructor!(VirtualNetwork, VirtualNetworkObject, "virtual-network"),
            validate_virtual_network,
        );
        r.register(
            "virtual-machine-interface",
            constructor!(
                VirtualMachineInterface,
                VirtualMachineInterfaceObject,
                "virtual-machine-interface"
            ),
            no_checks,
        );
        r.register(
            "logical-router",
            constructor!(LogicalRouter, LogicalRouterObject, "logical-router"),
            no_checks,
        );
        r.register(
            "route-table",
            constructor!(RouteTable, RouteTableObject, "route-table"),
            validate_route_table,
        );
        r.register("bgp-router", constructor!(BgpRouter, BgpRouterObject, "bgp-router"), no_checks);
        r.register(
            "node-profile",
            constructor!(NodeProfile, NodeProfileObject, "node-profile"),
            no_checks,
        );
        r.register(
            "service-instance",
            constructor!(ServiceInstance, ServiceInstanceObject, "service-instance"),
            no_checks,
        );
        r
    }

    pub fn register(&mut self, type_name: &'static str, construct: Constructor, validate: Validator) {
        self.entries.insert(type_name, Entry { construct, validate });
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    /// Construct and validate one object of the named type
    pub fn construct(&self, type_name: &str, body: Value) -> Result<IntentObject> {
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| PipelineError::BadRequest(format!("unknown intent type {}", type_name)))?;
        let obj = (entry.construct)(body)?;
        (entry.validate)(&obj)?;
        Ok(obj)
    }

    /// Decode a snapshot document `{"objects": [{"type": ..., ...}, ...]}`
    pub fn decode_document(&self, json: &str) -> Result<Vec<IntentObject>> {
        let snapshot: Snapshot = serde_json::from_str(json)
            .map_err(|e| PipelineError::BadRequest(format!("invalid intent document: {}", e)))?;
        snapshot
            .objects
            .into_iter()
            .map(|raw| self.construct(&raw.type_name, Value::Object(raw.body)))
            .collect()
    }

    /// Decode, link and validate a snapshot document
    pub fn load_document(&self, json: &str) -> Result<Graph> {
        Graph::build_validated(self.decode_document(json)?)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
