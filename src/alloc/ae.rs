use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{IdRange, IndexAllocator};
use crate::coord::CoordClient;
use crate::error::Result;

/// Per-router AE bundle ids, keyed `pr_uuid:esi`.
///
/// Each router gets a reversed allocator over `[0, max_ae - 1]` at
/// `<base>/id_alloc/ae/<pr_uuid>`, so the first bundle on a device is
/// `ae<max_ae - 1>`. Ids survive restarts because lookups go through the
/// stored values before allocating.
pub struct AeIdPool {
    coord: Arc<CoordClient>,
    max_ae: u64,
    allocators: Mutex<HashMap<String, Arc<Mutex<IndexAllocator>>>>,
}

impl AeIdPool {
    pub fn new(coord: Arc<CoordClient>, max_ae: u64) -> Self {
        Self {
            coord,
            max_ae: max_ae.max(1),
            allocators: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_ae(&self) -> u64 {
        self.max_ae
    }

    fn key(pr_uuid: &str, esi: &str) -> String {
        format!("{}:{}", pr_uuid, esi)
    }

    async fn allocator(&self, pr_uuid: &str) -> Result<Arc<Mutex<IndexAllocator>>> {
        let mut allocators = self.allocators.lock().await;
        if let Some(a) = allocators.get(pr_uuid) {
            return Ok(a.clone());
        }
        let path = self.coord.path(&["id_alloc", "ae", pr_uuid]);
        let allocator = IndexAllocator::new(
            self.coord.clone(),
            &path,
            &[IdRange::new(0, self.max_ae - 1)],
            true,
            None,
        )
        .await?;
        let allocator = Arc::new(Mutex::new(allocator));
        allocators.insert(pr_uuid.to_string(), allocator.clone());
        Ok(allocator)
    }

    /// Stable AE id for one ESI on one router
    pub async fn ae_id(&self, pr_uuid: &str, esi: &str) -> Result<u64> {
        let key = Self::key(pr_uuid, esi);
        let allocator = self.allocator(pr_uuid).await?;
        let mut allocator = allocator.lock().await;
        if let Some(id) = allocator.find(&key) {
            return Ok(id);
        }
        let id = allocator.alloc(Some(&key), None).await?;
        tracing::info!("Allocated ae{} for {}", id, key);
        Ok(id)
    }

    /// Free ids whose ESI is no longer bonded on the router
    pub async fn release_unused(&self, pr_uuid: &str, live_esis: &BTreeSet<String>) -> Result<Vec<u64>> {
        let live: BTreeSet<String> = live_esis.iter().map(|e| Self::key(pr_uuid, e)).collect();
        let allocator = self.allocator(pr_uuid).await?;
        let mut allocator = allocator.lock().await;
        allocator.reap(|v| live.contains(v)).await
    }

    /// Drop cached bitmaps so the next lookup re-reads the coordination service
    pub async fn forget(&self) {
        self.allocators.lock().await.clear();
    }
}
