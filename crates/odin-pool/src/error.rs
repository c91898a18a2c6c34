//! Error types for data block pools.

use thiserror::Error;

/// Errors raised by [`DataBlockPool`](crate::DataBlockPool) and
/// [`PoolRegistry`](crate::PoolRegistry) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// A block was handed back to a pool that did not issue it.
    #[error("Block {index} belongs to pool '{owner}', cannot release into pool '{pool}'")]
    ForeignBlock {
        /// Index of the offending block
        index: u64,
        /// Pool the block was taken from
        owner: String,
        /// Pool the caller tried to release into
        pool: String,
    },

    /// A copy into a block would overrun its capacity.
    #[error("Copy of {requested} bytes exceeds block {index} size of {size} bytes")]
    CopyOverflow {
        /// Index of the target block
        index: u64,
        /// Bytes the caller tried to copy
        requested: usize,
        /// Capacity of the block
        size: usize,
    },
}

/// Convenience alias for pool results.
pub type Result<T> = std::result::Result<T, PoolError>;
