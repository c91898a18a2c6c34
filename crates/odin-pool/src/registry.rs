//! Registry of independent pools keyed by pool id.

use crate::data_block::{DataBlock, DataBlockPool, PoolStats};
use crate::error::{PoolError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Owns every [`DataBlockPool`] of a processing context.
///
/// Share it as `Arc<PoolRegistry>` with every component that takes or
/// releases blocks. Pools are created lazily on first use. Operations on
/// different pool ids never contend on the same lock.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<DataBlockPool>>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the pool for `pool_id`, creating it if needed.
    pub fn pool(&self, pool_id: &str) -> Arc<DataBlockPool> {
        if let Some(pool) = self.pools.read().get(pool_id) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write();
        Arc::clone(
            pools
                .entry(pool_id.to_string())
                .or_insert_with(|| DataBlockPool::new(pool_id)),
        )
    }

    /// Get the pool for `pool_id` if it exists.
    #[must_use]
    pub fn get(&self, pool_id: &str) -> Option<Arc<DataBlockPool>> {
        self.pools.read().get(pool_id).cloned()
    }

    /// Bulk-create blocks in the pool `pool_id`.
    pub fn allocate(&self, pool_id: &str, block_count: usize, block_size: usize) {
        self.pool(pool_id).allocate(block_count, block_size);
    }

    /// Take a block of `size` bytes from the pool `pool_id`.
    pub fn take(&self, pool_id: &str, size: usize) -> DataBlock {
        self.pool(pool_id).take(size)
    }

    /// Return `block` to the pool `pool_id`.
    pub fn release(&self, pool_id: &str, block: DataBlock) -> Result<()> {
        match self.get(pool_id) {
            Some(pool) => pool.release(block),
            None => Err(PoolError::ForeignBlock {
                index: block.index(),
                owner: block.pool_id().to_string(),
                pool: pool_id.to_string(),
            }),
        }
    }

    /// Counters of the pool `pool_id`, all zero when it does not exist.
    #[must_use]
    pub fn stats(&self, pool_id: &str) -> PoolStats {
        self.get(pool_id).map(|p| p.stats()).unwrap_or_default()
    }

    /// Ids of all pools, sorted.
    #[must_use]
    pub fn pool_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
