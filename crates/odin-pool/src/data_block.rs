//! Growable pool of byte blocks and the owning [`DataBlock`] handle.
//!
//! # Memory Flow
//!
//! ```text
//! 1. allocate() pre-creates blocks on the free list
//! 2. take(size) pops a block, resizing it when its capacity differs
//! 3. the caller fills the block and hands it to a Frame
//! 4. dropping the DataBlock returns its storage to the free list
//! ```
//!
//! All book-keeping for one pool sits behind a single reentrant lock, so a
//! thread that releases a block while it already holds the pool (for example
//! from inside a resize) does not deadlock.

use crate::error::{PoolError, Result};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage of a single block while it is held on the free list.
struct BlockStorage {
    index: u64,
    data: Vec<u8>,
}

#[derive(Default)]
struct PoolState {
    free_list: VecDeque<BlockStorage>,
    free_blocks: usize,
    used_blocks: usize,
    total_blocks: usize,
    memory_allocated: usize,
}

/// Snapshot of a pool's counters.
///
/// `free + used == total` holds for every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Blocks sitting on the free list
    pub free_blocks: usize,
    /// Blocks currently owned by a [`DataBlock`]
    pub used_blocks: usize,
    /// Every block the pool has ever created
    pub total_blocks: usize,
    /// Sum of the sizes of all blocks, in bytes
    pub memory_allocated: usize,
}

/// A pool of byte blocks that grows on demand.
///
/// `take` never fails: when the free list is empty the pool allocates two
/// blocks if it is empty, otherwise it doubles its block count. Growth is
/// unbounded if callers never release blocks.
pub struct DataBlockPool {
    id: String,
    state: ReentrantMutex<RefCell<PoolState>>,
    next_index: AtomicU64,
}

impl DataBlockPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: ReentrantMutex::new(RefCell::new(PoolState::default())),
            next_index: AtomicU64::new(0),
        })
    }

    /// Identifier of this pool (typically the dataset name).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bulk-create `block_count` blocks of `block_size` bytes on the free list.
    pub fn allocate(&self, block_count: usize, block_size: usize) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        self.grow(&mut state, block_count, block_size);

        info!(
            pool = %self.id,
            block_count,
            block_size,
            total_blocks = state.total_blocks,
            "Allocated data blocks"
        );
    }

    /// Take a block of `size` bytes, growing the pool if the free list is empty.
    pub fn take(self: &Arc<Self>, size: usize) -> DataBlock {
        DataBlock {
            storage: Some(self.take_storage(size)),
            pool: Arc::clone(self),
        }
    }

    /// Return a block to this pool.
    ///
    /// A block issued by another pool is rejected; it still goes back to the
    /// pool it came from when it is dropped.
    pub fn release(&self, block: DataBlock) -> Result<()> {
        if !std::ptr::eq(Arc::as_ptr(&block.pool), self) {
            return Err(PoolError::ForeignBlock {
                index: block.index(),
                owner: block.pool.id.clone(),
                pool: self.id.clone(),
            });
        }
        drop(block);
        Ok(())
    }

    /// Number of blocks on the free list.
    #[must_use]
    pub fn free_blocks(&self) -> usize {
        self.stats().free_blocks
    }

    /// Number of blocks currently handed out.
    #[must_use]
    pub fn used_blocks(&self) -> usize {
        self.stats().used_blocks
    }

    /// Total number of blocks ever created by this pool.
    #[must_use]
    pub fn total_blocks(&self) -> usize {
        self.stats().total_blocks
    }

    /// Bytes held by all blocks of this pool.
    #[must_use]
    pub fn memory_allocated(&self) -> usize {
        self.stats().memory_allocated
    }

    /// Consistent snapshot of all counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let guard = self.state.lock();
        let state = guard.borrow();
        PoolStats {
            free_blocks: state.free_blocks,
            used_blocks: state.used_blocks,
            total_blocks: state.total_blocks,
            memory_allocated: state.memory_allocated,
        }
    }

    fn grow(&self, state: &mut PoolState, count: usize, size: usize) {
        for _ in 0..count {
            state.free_list.push_back(BlockStorage {
                index: self.next_index.fetch_add(1, Ordering::Relaxed),
                data: vec![0u8; size],
            });
        }
        state.free_blocks += count;
        state.total_blocks += count;
        state.memory_allocated += count * size;
    }

    fn take_storage(&self, size: usize) -> BlockStorage {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();

        if state.free_list.is_empty() {
            let old_total = state.total_blocks;
            let count = if old_total == 0 { 2 } else { old_total };
            if old_total == 0 {
                debug!(pool = %self.id, count, size, "Pool empty, creating initial blocks");
            } else {
                warn!(
                    pool = %self.id,
                    old_total,
                    new_total = old_total + count,
                    "Pool exhausted! Growing pool. Blocks are taken faster than released."
                );
            }
            self.grow(&mut state, count, size);
        }

        let mut storage = match state.free_list.pop_front() {
            Some(storage) => storage,
            None => {
                // Unreachable in practice: grow() always adds at least two blocks.
                state.free_blocks += 1;
                state.total_blocks += 1;
                state.memory_allocated += size;
                BlockStorage {
                    index: self.next_index.fetch_add(1, Ordering::Relaxed),
                    data: vec![0u8; size],
                }
            }
        };

        let old_size = storage.data.len();
        if old_size != size {
            debug!(
                pool = %self.id,
                block = storage.index,
                old_size,
                new_size = size,
                "Resizing data block"
            );
            storage.data.resize(size, 0);
            state.memory_allocated = state.memory_allocated - old_size + size;
        }

        state.free_blocks -= 1;
        state.used_blocks += 1;
        storage
    }

    fn return_storage(&self, storage: BlockStorage) {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        state.free_list.push_back(storage);
        state.free_blocks += 1;
        state.used_blocks -= 1;
    }
}

impl fmt::Debug for DataBlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlockPool")
            .field("id", &self.id)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Owning handle to a pooled block.
///
/// Dropping the handle returns the block to the pool that issued it.
/// Cloning takes a fresh block from the same pool and copies the bytes.
pub struct DataBlock {
    // Only `None` transiently inside `clone_from` and `drop`.
    storage: Option<BlockStorage>,
    pool: Arc<DataBlockPool>,
}

impl DataBlock {
    /// Pool-unique index of this block.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.storage.as_ref().map_or(0, |s| s.index)
    }

    /// Size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data().len()
    }

    /// Id of the pool that issued this block.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        &self.pool.id
    }

    /// Block contents.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &storage.data,
            None => &[],
        }
    }

    /// Mutable block contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(storage) => &mut storage.data,
            None => &mut [],
        }
    }

    /// Copy `src` into the start of the block.
    pub fn copy_from(&mut self, src: &[u8]) -> Result<()> {
        let size = self.size();
        if src.len() > size {
            return Err(PoolError::CopyOverflow {
                index: self.index(),
                requested: src.len(),
                size,
            });
        }
        self.data_mut()[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

impl Clone for DataBlock {
    fn clone(&self) -> Self {
        let mut block = self.pool.take(self.size());
        block.data_mut().copy_from_slice(self.data());
        block
    }

    /// Release the current block first, then take one sized to `source`
    /// from `source`'s pool and copy into it.
    fn clone_from(&mut self, source: &Self) {
        if let Some(old) = self.storage.take() {
            self.pool.return_storage(old);
        }
        let mut fresh = source.pool.take_storage(source.size());
        fresh.data.copy_from_slice(source.data());
        self.storage = Some(fresh);
        self.pool = Arc::clone(&source.pool);
    }
}

impl Drop for DataBlock {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.return_storage(storage);
        }
    }
}

impl fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBlock")
            .field("pool", &self.pool.id)
            .field("index", &self.index())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_balanced(pool: &DataBlockPool) {
        let stats = pool.stats();
        assert_eq!(stats.free_blocks + stats.used_blocks, stats.total_blocks);
    }

    #[test]
    fn test_allocate_populates_free_list() {
        let pool = DataBlockPool::new("raw");
        pool.allocate(4, 1024);

        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.total_blocks, 4);
        assert_eq!(stats.memory_allocated, 4096);
    }

    #[test]
    fn test_take_from_empty_pool_creates_two_blocks() {
        let pool = DataBlockPool::new("raw");
        let block = pool.take(100);

        assert_eq!(block.size(), 100);
        assert_eq!(pool.total_blocks(), 2);
        assert_eq!(pool.used_blocks(), 1);
        assert_eq!(pool.free_blocks(), 1);
        assert_balanced(&pool);
    }

    #[test]
    fn test_growth_doubles_total() {
        let pool = DataBlockPool::new("raw");
        pool.allocate(3, 64);

        let held: Vec<_> = (0..4).map(|_| pool.take(64)).collect();
        assert_eq!(pool.total_blocks(), 6);
        assert_eq!(pool.used_blocks(), 4);
        assert_balanced(&pool);

        drop(held);
        assert_eq!(pool.total_blocks(), 6);
        assert_eq!(pool.free_blocks(), 6);
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_exhaustion_is_logged() {
        let pool = DataBlockPool::new("raw");
        pool.allocate(1, 8);
        let _a = pool.take(8);
        assert!(!logs_contain("Pool exhausted"));

        let _b = pool.take(8);
        assert!(logs_contain("Pool exhausted"));
    }

    #[test]
    fn test_take_release_sequence_keeps_invariant() {
        let pool = DataBlockPool::new("raw");
        let mut held = Vec::new();
        let mut last_total = 0;

        for step in 0..200usize {
            if step % 3 == 2 && !held.is_empty() {
                let block: DataBlock = held.remove(step % held.len());
                pool.release(block).unwrap();
            } else {
                held.push(pool.take(16 + (step % 5)));
            }
            assert_balanced(&pool);
            let total = pool.total_blocks();
            assert!(total >= last_total, "total shrank from {last_total} to {total}");
            last_total = total;
        }
    }

    #[test]
    fn test_resize_adjusts_memory_allocated() {
        let pool = DataBlockPool::new("raw");
        pool.allocate(1, 100);

        let block = pool.take(250);
        assert_eq!(block.size(), 250);
        assert_eq!(pool.memory_allocated(), 250);

        drop(block);
        let block = pool.take(40);
        assert_eq!(pool.memory_allocated(), 40);
        drop(block);
        assert_eq!(pool.total_blocks(), 1);
    }

    #[test]
    fn test_release_into_wrong_pool_is_rejected() {
        let a = DataBlockPool::new("a");
        let b = DataBlockPool::new("b");

        let block = a.take(8);
        let err = b.release(block).unwrap_err();
        assert!(matches!(err, PoolError::ForeignBlock { .. }));

        // The rejected block still went home.
        assert_eq!(a.used_blocks(), 0);
        assert_eq!(b.total_blocks(), 0);
    }

    #[test]
    fn test_copy_from_overflow_leaves_block_intact() {
        let pool = DataBlockPool::new("raw");
        let mut block = pool.take(4);
        block.copy_from(&[1, 2, 3, 4]).unwrap();

        let err = block.copy_from(&[0; 5]).unwrap_err();
        assert!(matches!(err, PoolError::CopyOverflow { requested: 5, size: 4, .. }));
        assert_eq!(block.data(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_clone_is_deep_copy() {
        let pool = DataBlockPool::new("raw");
        let mut original = pool.take(3);
        original.copy_from(&[7, 8, 9]).unwrap();

        let mut copy = original.clone();
        assert_ne!(copy.index(), original.index());
        copy.data_mut()[0] = 0;

        assert_eq!(original.data(), &[7, 8, 9]);
        assert_eq!(copy.data(), &[0, 8, 9]);
        assert_eq!(pool.used_blocks(), 2);
    }

    #[test]
    fn test_clone_from_releases_before_taking() {
        let small = DataBlockPool::new("small");
        let large = DataBlockPool::new("large");
        let mut target = small.take(2);
        let mut source = large.take(6);
        source.copy_from(&[1, 2, 3, 4, 5, 6]).unwrap();

        target.clone_from(&source);

        assert_eq!(target.data(), source.data());
        assert_eq!(target.pool_id(), "large");
        assert_eq!(small.used_blocks(), 0);
        // The released block of `small` is back on its free list.
        assert_eq!(small.free_blocks(), small.total_blocks());
        assert_eq!(large.used_blocks(), 2);
    }
}
