//! Growable data block pools for frame processing.
//!
//! Plugins that build new frames take a block sized to the image, fill it, and
//! hand it to a frame. When the last owner drops the block it returns to its
//! pool, so steady-state processing allocates nothing.
//!
//! - [`DataBlockPool`]: a single pool, serialized by one reentrant lock
//! - [`DataBlock`]: owning handle; drop returns the block, clone deep-copies
//! - [`PoolRegistry`]: explicit map of pool id to pool, shared via `Arc`
//!
//! # Example
//!
//! ```
//! use odin_pool::PoolRegistry;
//! use std::sync::Arc;
//!
//! let pools = Arc::new(PoolRegistry::new());
//! pools.allocate("data", 4, 1024);
//!
//! let mut block = pools.take("data", 1024);
//! block.data_mut()[0] = 42;
//! assert_eq!(pools.stats("data").used_blocks, 1);
//!
//! drop(block);
//! assert_eq!(pools.stats("data").free_blocks, 4);
//! ```

pub mod data_block;
pub mod error;
pub mod registry;

pub use data_block::{DataBlock, DataBlockPool, PoolStats};
pub use error::{PoolError, Result};
pub use registry::PoolRegistry;
