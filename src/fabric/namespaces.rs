//! Fabric namespaces and the allocators carved out of them.
//!
//! Onboarding writes one record per namespace under
//! `<base>/namespaces/<fabric>/<fabric>-<kind>` and opens the eBGP ASN pool
//! and loopback pools under `<base>/id_alloc/{asn,loopback}/<fabric>`.
//! Allocations are owned by the router uuid, so running it twice is a no-op.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::alloc::{IdRange, IndexAllocator};
use crate::composer::addresses::{address_at, host_range, offset_of, subnet_key};
use crate::composer::DeviceAllocations;
use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};
use crate::intent::{Fabric, Graph, PhysicalRouter};

pub mod kind {
    pub const MANAGEMENT_SUBNETS: &str = "management-subnets";
    pub const LOOPBACK_SUBNETS: &str = "loopback-subnets";
    pub const FABRIC_SUBNETS: &str = "fabric-subnets";
    pub const EBGP_ASN_POOL: &str = "ebgp-asn-pool";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum NamespaceValue {
    Ipv4Cidr(Vec<String>),
    AsnRanges(Vec<IdRange>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricNamespace {
    pub fq_name: Vec<String>,
    pub value: NamespaceValue,
}

impl FabricNamespace {
    pub fn name(&self) -> &str {
        self.fq_name.last().map(String::as_str).unwrap_or_default()
    }
}

/// The four namespaces every onboarded fabric carries
pub fn namespaces_for(fabric: &Fabric) -> Vec<FabricNamespace> {
    let name = fabric.name();
    let ns = |kind: &str, value: NamespaceValue| {
        let mut fq_name = fabric.props.fq_name.clone();
        fq_name.push(format!("{}-{}", name, kind));
        FabricNamespace { fq_name, value }
    };
    vec![
        ns(
            kind::MANAGEMENT_SUBNETS,
            NamespaceValue::Ipv4Cidr(fabric.props.management_subnets.clone()),
        ),
        ns(
            kind::LOOPBACK_SUBNETS,
            NamespaceValue::Ipv4Cidr(fabric.props.loopback_subnets.clone()),
        ),
        ns(
            kind::FABRIC_SUBNETS,
            NamespaceValue::Ipv4Cidr(fabric.props.fabric_subnets.clone()),
        ),
        ns(
            kind::EBGP_ASN_POOL,
            NamespaceValue::AsnRanges(fabric.props.ebgp_asn_pool.clone()),
        ),
    ]
}

/// Create `path` holding `value`, or bring an existing node in line with it.
/// Returns true when something was written.
pub(crate) async fn write_json<T: Serialize>(coord: &CoordClient, path: &str, value: &T) -> Result<bool> {
    let bytes = serde_json::to_vec(value)?;
    match coord.create(path, &bytes).await {
        Ok(()) => Ok(true),
        Err(PipelineError::NodeExists(_)) => {
            let current = coord.read(path).await?;
            match current {
                Some(node) if node.value == bytes => Ok(false),
                Some(node) => {
                    coord.update(path, &bytes, Some(node.version)).await?;
                    Ok(true)
                }
                None => {
                    coord.create(path, &bytes).await?;
                    Ok(true)
                }
            }
        }
        Err(e) => Err(e),
    }
}

struct LoopbackPool {
    net: IpNet,
    allocator: Mutex<IndexAllocator>,
}

/// Allocators of one onboarded fabric
pub struct FabricPools {
    pub fabric: String,
    pub namespaces: Vec<FabricNamespace>,
    asn_pool: Option<Mutex<IndexAllocator>>,
    loopbacks: Vec<LoopbackPool>,
}

/// Register the fabric's namespaces and open its pools
pub async fn onboard(coord: &Arc<CoordClient>, graph: &Graph, fabric: &Fabric) -> Result<FabricPools> {
    let name = fabric.name();
    let namespaces = namespaces_for(fabric);
    for ns in &namespaces {
        let path = coord.path(&["namespaces", &name, ns.name()]);
        if write_json(coord, &path, ns).await? {
            tracing::info!("Registered namespace {}", ns.name());
        }
    }

    let asn_pool = if fabric.props.ebgp_asn_pool.is_empty() {
        None
    } else {
        let path = coord.path(&["id_alloc", "asn", &name]);
        let allocator =
            IndexAllocator::new(coord.clone(), &path, &fabric.props.ebgp_asn_pool, false, None).await?;
        Some(Mutex::new(allocator))
    };

    let mut loopbacks = Vec::new();
    for prefix in &fabric.props.loopback_subnets {
        let net: IpNet = prefix
            .parse()
            .map_err(|_| PipelineError::BadRequest(format!("invalid loopback subnet {}", prefix)))?;
        let net = net.trunc();
        let Some(range) = host_range(&net) else {
            tracing::warn!("Loopback subnet {} of {} is too small, skipping", net, name);
            continue;
        };
        let path = coord.path(&["id_alloc", "loopback", &name, &subnet_key(&net)]);
        let allocator = IndexAllocator::new(coord.clone(), &path, &[range], false, None).await?;
        loopbacks.push(LoopbackPool {
            net,
            allocator: Mutex::new(allocator),
        });
    }

    let pools = FabricPools {
        fabric: name,
        namespaces,
        asn_pool,
        loopbacks,
    };
    for pr in &fabric.physical_routers {
        pools.reserve_static_loopback(graph.pr(*pr)).await;
    }
    Ok(pools)
}

impl FabricPools {
    /// Keep statically configured loopbacks out of the pool
    async fn reserve_static_loopback(&self, router: &PhysicalRouter) {
        let Some(ip) = router.props.loopback_ip.as_deref() else {
            return;
        };
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return;
        };
        for pool in &self.loopbacks {
            let Some(offset) = offset_of(&pool.net, addr) else {
                continue;
            };
            let mut allocator = pool.allocator.lock().await;
            if let Err(e) = allocator.reserve(offset, Some(router.uuid())).await {
                tracing::warn!("Loopback {} of {} is already taken: {}", ip, router.name(), e);
            }
        }
    }

    /// eBGP ASN owned by `pr_uuid`, allocated on first use
    pub async fn asn_for(&self, pr_uuid: &str) -> Result<Option<u32>> {
        let Some(ref pool) = self.asn_pool else {
            return Ok(None);
        };
        let mut allocator = pool.lock().await;
        let id = match allocator.find(pr_uuid) {
            Some(id) => id,
            None => allocator.alloc(Some(pr_uuid), None).await?,
        };
        u32::try_from(id)
            .map(Some)
            .map_err(|_| PipelineError::BadRequest(format!("asn {} out of range", id)))
    }

    /// Loopback address owned by `pr_uuid`, allocated on first use
    pub async fn loopback_for(&self, pr_uuid: &str) -> Result<Option<String>> {
        if self.loopbacks.is_empty() {
            return Ok(None);
        }
        for pool in &self.loopbacks {
            let allocator = pool.allocator.lock().await;
            if let Some(offset) = allocator.find(pr_uuid) {
                return Ok(Some(host_part(&address_at(&pool.net, offset))));
            }
        }
        for pool in &self.loopbacks {
            let mut allocator = pool.allocator.lock().await;
            match allocator.alloc(Some(pr_uuid), None).await {
                Ok(offset) => return Ok(Some(host_part(&address_at(&pool.net, offset)))),
                Err(PipelineError::ResourceExhausted(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(PipelineError::ResourceExhausted(format!(
            "no loopback address left in fabric {}",
            self.fabric
        )))
    }

    /// Everything the composer needs from the fabric for one router
    pub async fn allocations_for(&self, router: &PhysicalRouter) -> Result<DeviceAllocations> {
        let loopback_ip = match router.props.loopback_ip {
            Some(_) => None,
            None => self.loopback_for(router.uuid()).await?,
        };
        Ok(DeviceAllocations {
            loopback_ip,
            underlay_asn: self.asn_for(router.uuid()).await?,
        })
    }

    /// Free ASNs and loopbacks held by routers that left the fabric
    pub async fn release_unused(&self, live: &BTreeSet<String>) -> Result<usize> {
        let mut freed = 0;
        if let Some(ref pool) = self.asn_pool {
            freed += pool.lock().await.reap(|v| live.contains(v)).await?.len();
        }
        for pool in &self.loopbacks {
            freed += pool.allocator.lock().await.reap(|v| live.contains(v)).await?.len();
        }
        Ok(freed)
    }
}

fn host_part(cidr: &str) -> String {
    cidr.split('/').next().unwrap_or(cidr).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{memory::MemoryBackend, retry::RetryPolicy};
    use crate::intent::objects::IntentObject;
    use crate::intent::fixtures;

    async fn coord() -> Arc<CoordClient> {
        CoordClient::connect(Arc::new(MemoryBackend::new()), "/fp", RetryPolicy::default())
            .await
            .unwrap()
    }

    fn graph_without_loopback(uuid: &str) -> Graph {
        let objects = fixtures::fabric_objects()
            .into_iter()
            .map(|o| match o {
                IntentObject::PhysicalRouter(mut pr) if pr.uuid == uuid => {
                    pr.loopback_ip = None;
                    IntentObject::PhysicalRouter(pr)
                }
                other => other,
            })
            .collect();
        Graph::build_validated(objects).unwrap()
    }

    #[tokio::test]
    async fn test_onboard_twice_is_idempotent() {
        let c = coord().await;
        let g = fixtures::fabric_graph();
        let fabric = g.fabric(g.fabric_by_name("fab1").unwrap());

        let first = onboard(&c, &g, fabric).await.unwrap();
        let path = c.path(&["namespaces", "fab1"]);
        let names = c.children(&path).await.unwrap();
        let version = c.read(&format!("{}/fab1-ebgp-asn-pool", path)).await.unwrap().unwrap().version;

        let second = onboard(&c, &g, fabric).await.unwrap();
        assert_eq!(first.namespaces, second.namespaces);
        assert_eq!(c.children(&path).await.unwrap(), names);
        assert_eq!(names.len(), 4);
        assert!(names.contains(&"fab1-loopback-subnets".to_string()));
        let again = c.read(&format!("{}/fab1-ebgp-asn-pool", path)).await.unwrap().unwrap();
        assert_eq!(again.version, version);
        assert_eq!(
            first.namespaces[3].fq_name,
            vec!["default-global-system-config", "fab1", "fab1-ebgp-asn-pool"]
        );
    }

    #[tokio::test]
    async fn test_asn_is_stable_per_router() {
        let c = coord().await;
        let g = fixtures::fabric_graph();
        let fabric = g.fabric(g.fabric_by_name("fab1").unwrap());
        let pools = onboard(&c, &g, fabric).await.unwrap();

        let a = pools.asn_for(fixtures::LEAF1).await.unwrap().unwrap();
        let b = pools.asn_for(fixtures::LEAF2).await.unwrap().unwrap();
        assert_eq!(a, 64600);
        assert_eq!(b, 64601);

        // a fresh onboard reads the same allocations back
        let reopened = onboard(&c, &g, fabric).await.unwrap();
        assert_eq!(reopened.asn_for(fixtures::LEAF1).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_loopback_skips_static_addresses() {
        let c = coord().await;
        let g = graph_without_loopback(fixtures::LEAF2);
        let fabric = g.fabric(g.fabric_by_name("fab1").unwrap());
        let pools = onboard(&c, &g, fabric).await.unwrap();

        let leaf2 = g.pr(g.pr_by_uuid(fixtures::LEAF2).unwrap());
        let alloc = pools.allocations_for(leaf2).await.unwrap();
        // .1 and .2 belong to the spine and leaf1
        assert_eq!(alloc.loopback_ip.as_deref(), Some("10.10.0.3"));
        let again = pools.allocations_for(leaf2).await.unwrap();
        assert_eq!(again.loopback_ip, alloc.loopback_ip);

        let leaf1 = g.pr(g.pr_by_uuid(fixtures::LEAF1).unwrap());
        assert_eq!(pools.allocations_for(leaf1).await.unwrap().loopback_ip, None);
    }

    #[tokio::test]
    async fn test_release_unused_frees_departed_routers() {
        let c = coord().await;
        let g = fixtures::fabric_graph();
        let fabric = g.fabric(g.fabric_by_name("fab1").unwrap());
        let pools = onboard(&c, &g, fabric).await.unwrap();
        pools.asn_for(fixtures::LEAF1).await.unwrap();
        pools.asn_for(fixtures::LEAF2).await.unwrap();

        let live: BTreeSet<String> = [fixtures::LEAF1.to_string()].into_iter().collect();
        // leaf2's asn plus the static loopbacks of leaf2 and the spine
        assert_eq!(pools.release_unused(&live).await.unwrap(), 3);
        assert_eq!(pools.asn_for(fixtures::LEAF1).await.unwrap(), Some(64600));
    }
}
