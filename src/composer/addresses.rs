//! Per-device IRB address reservations.
//!
//! Each (network, subnet) gets an index allocator over host offsets at
//! `<base>/id_alloc/irb/<vn_uuid>/<subnet>`; children carry the owning
//! router's uuid so a device keeps its address across passes and restarts.

use ipnet::IpNet;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::alloc::{IdRange, IndexAllocator};
use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};

/// Upper bound on host offsets tracked per subnet
const MAX_HOST_OFFSET: u64 = 4095;

const GATEWAY_OWNER: &str = "gateway";

pub fn ip_version(prefix: &str) -> Option<u8> {
    match prefix.parse::<IpNet>().ok()? {
        IpNet::V4(_) => Some(4),
        IpNet::V6(_) => Some(6),
    }
}

/// Host offsets usable for reservations, or None for subnets too small to
/// spare an address
pub(crate) fn host_range(net: &IpNet) -> Option<IdRange> {
    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    if host_bits < 2 {
        return None;
    }
    let last = if host_bits >= 13 {
        MAX_HOST_OFFSET
    } else {
        (1u64 << host_bits) - 2
    };
    Some(IdRange::new(1, last))
}

pub(crate) fn offset_of(net: &IpNet, addr: IpAddr) -> Option<u64> {
    if !net.contains(&addr) {
        return None;
    }
    match (net.network(), addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => Some(u64::from(u32::from(a) - u32::from(n))),
        (IpAddr::V6(n), IpAddr::V6(a)) => u64::try_from(u128::from(a) - u128::from(n)).ok(),
        _ => None,
    }
}

pub(crate) fn address_at(net: &IpNet, offset: u64) -> String {
    let addr = match net.network() {
        IpAddr::V4(n) => IpAddr::V4(Ipv4Addr::from(u32::from(n).wrapping_add(offset as u32))),
        IpAddr::V6(n) => IpAddr::V6(Ipv6Addr::from(u128::from(n).wrapping_add(u128::from(offset)))),
    };
    format!("{}/{}", addr, net.prefix_len())
}

/// Subnet as a coordination path segment
pub(crate) fn subnet_key(net: &IpNet) -> String {
    net.to_string().replace(['/', ':'], "_")
}

pub struct AddressBook {
    coord: Arc<CoordClient>,
    allocators: Mutex<HashMap<String, Arc<Mutex<IndexAllocator>>>>,
}

impl AddressBook {
    pub fn new(coord: Arc<CoordClient>) -> Self {
        Self {
            coord,
            allocators: Mutex::new(HashMap::new()),
        }
    }

    async fn allocator(
        &self,
        vn_uuid: &str,
        net: &IpNet,
        range: IdRange,
    ) -> Result<Arc<Mutex<IndexAllocator>>> {
        let key = format!("{}/{}", vn_uuid, subnet_key(net));
        let mut allocators = self.allocators.lock().await;
        if let Some(a) = allocators.get(&key) {
            return Ok(a.clone());
        }
        let path = self.coord.path(&["id_alloc", "irb", vn_uuid, &subnet_key(net)]);
        let allocator = IndexAllocator::new(self.coord.clone(), &path, &[range], false, None).await?;
        let allocator = Arc::new(Mutex::new(allocator));
        allocators.insert(key, allocator.clone());
        Ok(allocator)
    }

    /// Address `<ip>/<len>` reserved for `pr_uuid` on one subnet of a
    /// network. The gateway is never handed out.
    pub async fn irb_address(
        &self,
        vn_uuid: &str,
        prefix: &str,
        gateway: Option<&str>,
        pr_uuid: &str,
    ) -> Result<Option<String>> {
        let net: IpNet = prefix
            .parse()
            .map_err(|_| PipelineError::BadRequest(format!("invalid prefix {}", prefix)))?;
        let net = net.trunc();
        let Some(range) = host_range(&net) else {
            return Ok(None);
        };

        let allocator = self.allocator(vn_uuid, &net, range).await?;
        let mut allocator = allocator.lock().await;
        if let Some(offset) = allocator.find(pr_uuid) {
            return Ok(Some(address_at(&net, offset)));
        }
        if let Some(gw) = gateway.and_then(|g| g.parse::<IpAddr>().ok()) {
            if let Some(offset) = offset_of(&net, gw).filter(|o| range.contains(*o)) {
                if allocator.find(GATEWAY_OWNER).is_none() {
                    allocator.reserve(offset, Some(GATEWAY_OWNER)).await?;
                }
            }
        }
        let offset = allocator.alloc(Some(pr_uuid), None).await?;
        tracing::debug!("Reserved {} for {}", address_at(&net, offset), pr_uuid);
        Ok(Some(address_at(&net, offset)))
    }
}
