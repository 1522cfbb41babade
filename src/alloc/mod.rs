//! Shared allocators persisted in the coordination service.

pub mod ae;
pub mod counter;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::coord::CoordClient;
use crate::error::{PipelineError, Result};

pub use ae::AeIdPool;
pub use counter::QuotaCounter;

/// Inclusive id range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn size(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    pub fn contains(&self, id: u64) -> bool {
        self.start <= id && id <= self.end
    }
}

pub(crate) fn validate_ranges(ranges: &[IdRange]) -> Result<Vec<IdRange>> {
    if ranges.is_empty() {
        return Err(PipelineError::BadRequest("allocator needs at least one range".into()));
    }
    let mut sorted = ranges.to_vec();
    sorted.sort();
    for r in &sorted {
        if r.start > r.end {
            return Err(PipelineError::BadRequest(format!(
                "invalid range {}-{}",
                r.start, r.end
            )));
        }
    }
    for pair in sorted.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(PipelineError::BadRequest(format!(
                "overlapping ranges {}-{} and {}-{}",
                pair[0].start, pair[0].end, pair[1].start, pair[1].end
            )));
        }
    }
    Ok(sorted)
}

/// Bitmap-backed allocator of dense ids under one coordination path.
///
/// Each allocated id is a child node named by its zero-padded decimal
/// value. Bits are laid out pool by pool (in reverse when `reverse` is
/// set) and the lowest free bit wins, so a reversed allocator hands out
/// the highest id first. The in-memory bitmap is not shared: confine one
/// instance to one task or put it behind a mutex.
pub struct IndexAllocator {
    coord: Arc<CoordClient>,
    path: String,
    pools: Vec<IdRange>,
    reverse: bool,
    max_alloc: Option<usize>,
    in_use: Vec<bool>,
    values: BTreeMap<u64, String>,
}

impl IndexAllocator {
    /// Open the allocator and load ids already present under `path`
    pub async fn new(
        coord: Arc<CoordClient>,
        path: &str,
        ranges: &[IdRange],
        reverse: bool,
        max_alloc: Option<usize>,
    ) -> Result<Self> {
        let pools = validate_ranges(ranges)?;
        let mut allocator = Self {
            coord,
            path: path.to_string(),
            pools,
            reverse,
            max_alloc,
            in_use: Vec::new(),
            values: BTreeMap::new(),
        };
        allocator.reload().await?;
        Ok(allocator)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Rebuild the bitmap from the coordination service
    pub async fn reload(&mut self) -> Result<()> {
        self.in_use.clear();
        self.values.clear();

        for child in self.coord.children(&self.path).await? {
            let id = match child.parse::<u64>() {
                Ok(id) => id,
                Err(_) => {
                    tracing::warn!("Ignoring non-numeric allocator node {}/{}", self.path, child);
                    continue;
                }
            };
            let value = self
                .coord
                .read_string(&self.child_path(id))
                .await?
                .unwrap_or_default();
            match self.bit_of(id) {
                Some(bit) => self.set_bit(bit),
                None => tracing::warn!("Allocated id {} outside pools of {}", id, self.path),
            }
            self.values.insert(id, value);
        }
        Ok(())
    }

    fn total_bits(&self) -> usize {
        self.pools.iter().map(IdRange::size).sum()
    }

    fn limit(&self) -> usize {
        let total = self.total_bits();
        self.max_alloc.map_or(total, |m| m.min(total))
    }

    fn ordered_pools(&self) -> Box<dyn Iterator<Item = &IdRange> + '_> {
        if self.reverse {
            Box::new(self.pools.iter().rev())
        } else {
            Box::new(self.pools.iter())
        }
    }

    fn id_of(&self, bit: usize) -> Option<u64> {
        let mut offset = bit;
        for pool in self.ordered_pools() {
            if offset < pool.size() {
                return Some(if self.reverse {
                    pool.end - offset as u64
                } else {
                    pool.start + offset as u64
                });
            }
            offset -= pool.size();
        }
        None
    }

    fn bit_of(&self, id: u64) -> Option<usize> {
        let mut base = 0;
        for pool in self.ordered_pools() {
            if pool.contains(id) {
                let offset = if self.reverse { pool.end - id } else { id - pool.start };
                return Some(base + offset as usize);
            }
            base += pool.size();
        }
        None
    }

    fn set_bit(&mut self, bit: usize) {
        if bit >= self.in_use.len() {
            self.in_use.resize(bit + 1, false);
        }
        self.in_use[bit] = true;
    }

    fn clear_bit(&mut self, bit: usize) {
        if let Some(b) = self.in_use.get_mut(bit) {
            *b = false;
        }
    }

    fn next_free(&self, restricted: Option<&[IdRange]>) -> Option<usize> {
        (0..self.limit()).find(|&bit| {
            if self.in_use.get(bit).copied().unwrap_or(false) {
                return false;
            }
            match (restricted, self.id_of(bit)) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(pools), Some(id)) => pools.iter().any(|p| p.contains(id)),
            }
        })
    }

    fn child_path(&self, id: u64) -> String {
        format!("{}/{:010}", self.path, id)
    }

    /// Allocate the next free id, optionally only from `restricted_pools`
    pub async fn alloc(
        &mut self,
        value: Option<&str>,
        restricted_pools: Option<&[IdRange]>,
    ) -> Result<u64> {
        let value = value.unwrap_or("");
        loop {
            let bit = self.next_free(restricted_pools).ok_or_else(|| {
                PipelineError::ResourceExhausted(format!("no free id under {}", self.path))
            })?;
            let id = self
                .id_of(bit)
                .ok_or_else(|| PipelineError::ResourceExhausted(self.path.clone()))?;

            match self.coord.create(&self.child_path(id), value.as_bytes()).await {
                Ok(()) => {
                    self.set_bit(bit);
                    self.values.insert(id, value.to_string());
                    return Ok(id);
                }
                Err(PipelineError::NodeExists(_)) => {
                    // Another allocator took it first
                    let stored = self
                        .coord
                        .read_string(&self.child_path(id))
                        .await?
                        .unwrap_or_default();
                    self.set_bit(bit);
                    self.values.insert(id, stored);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Claim a specific id. `None` when the id is outside every pool.
    pub async fn reserve(&mut self, id: u64, value: Option<&str>) -> Result<Option<u64>> {
        let Some(bit) = self.bit_of(id) else {
            return Ok(None);
        };
        let value = value.unwrap_or("");

        match self.coord.create(&self.child_path(id), value.as_bytes()).await {
            Ok(()) => {}
            Err(PipelineError::NodeExists(_)) => {
                let stored = self
                    .coord
                    .read_string(&self.child_path(id))
                    .await?
                    .unwrap_or_default();
                if stored != value {
                    self.set_bit(bit);
                    self.values.insert(id, stored.clone());
                    return Err(PipelineError::Conflict(format!(
                        "id {} under {} is held by '{}'",
                        id, self.path, stored
                    )));
                }
            }
            Err(e) => return Err(e),
        }
        self.set_bit(bit);
        self.values.insert(id, value.to_string());
        Ok(Some(id))
    }

    /// Release an id; deleting a free id is a no-op
    pub async fn delete(&mut self, id: u64) -> Result<()> {
        self.coord.delete(&self.child_path(id), false).await?;
        if let Some(bit) = self.bit_of(id) {
            self.clear_bit(bit);
        }
        self.values.remove(&id);
        Ok(())
    }

    /// Value stored with an allocated id
    pub async fn read(&self, id: u64) -> Result<Option<String>> {
        self.coord.read_string(&self.child_path(id)).await
    }

    /// First id whose stored value equals `value`
    pub fn find(&self, value: &str) -> Option<u64> {
        self.values
            .iter()
            .find(|(_, v)| v.as_str() == value)
            .map(|(id, _)| *id)
    }

    /// Allocated ids with their values
    pub fn allocations(&self) -> &BTreeMap<u64, String> {
        &self.values
    }

    pub fn get_alloc_count(&self) -> usize {
        self.in_use.iter().filter(|b| **b).count()
    }

    pub fn empty(&self) -> bool {
        self.get_alloc_count() == 0
    }

    /// Id at the highest set bit: the largest id, or the smallest when reversed
    pub fn get_last_allocated_id(&self) -> Option<u64> {
        self.in_use
            .iter()
            .rposition(|b| *b)
            .and_then(|bit| self.id_of(bit))
    }

    /// Grow existing pools. Shrinking a pool or changing the pool count fails.
    pub fn reallocate(&mut self, new_ranges: &[IdRange]) -> Result<()> {
        let new_pools = validate_ranges(new_ranges)?;
        if new_pools.len() != self.pools.len() {
            return Err(PipelineError::BadRequest(format!(
                "pool count change from {} to {} is not supported",
                self.pools.len(),
                new_pools.len()
            )));
        }
        for (old, new) in self.pools.iter().zip(&new_pools) {
            if new.start > old.start || new.end < old.end {
                return Err(PipelineError::BadRequest(format!(
                    "pool {}-{} cannot shrink to {}-{}",
                    old.start, old.end, new.start, new.end
                )));
            }
        }

        self.pools = new_pools;
        self.in_use.clear();
        let ids: Vec<u64> = self.values.keys().copied().collect();
        for id in ids {
            if let Some(bit) = self.bit_of(id) {
                self.set_bit(bit);
            }
        }
        Ok(())
    }

    /// Delete every allocation whose value `keep` rejects; returns the ids freed
    pub async fn reap<F>(&mut self, keep: F) -> Result<Vec<u64>>
    where
        F: Fn(&str) -> bool,
    {
        let orphans: Vec<u64> = self
            .values
            .iter()
            .filter(|(_, v)| !keep(v))
            .map(|(id, _)| *id)
            .collect();
        for id in &orphans {
            tracing::info!("Reaping orphaned id {} under {}", id, self.path);
            self.delete(*id).await?;
        }
        Ok(orphans)
    }
}
