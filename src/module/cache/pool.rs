//! Bump-allocating memory pool for loading-time allocations
//!
//! Allocation advances a cursor inside the active block; individual
//! allocations are never freed. Memory is reclaimed wholesale by [`MemoryPool::reset`]
//! or by dropping the pool. Blocks are heap slices that never move, so the
//! address of an allocation is stable for the lifetime of the pool.
//!
//! The pool is single-writer: `allocate` and `reset` take `&mut self`.
//! Sharing a pool across threads requires the caller to wrap it in a lock.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{GrowthPolicy, PoolConfig};
use crate::module::error::ResourceError;

/// Allocation alignment in bytes
pub const ALIGNMENT: usize = 8;

/// Absolute address of a byte inside a loaded module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub usize);

impl Address {
    pub fn offset(self, by: u64) -> Address {
        Address(self.0.wrapping_add(by as usize))
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle to a region of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    block: usize,
    offset: usize,
    len: usize,
}

impl Allocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub blocks: usize,
    pub capacity: usize,
    pub used: usize,
    pub allocations: u64,
}

pub struct MemoryPool {
    config: PoolConfig,
    blocks: Vec<Box<[u8]>>,
    /// Cursor inside the last block
    cursor: usize,
    used: usize,
    allocations: u64,
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryPool {
    /// Create an empty pool; the first block is allocated on first use
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            cursor: 0,
            used: 0,
            allocations: 0,
        }
    }

    fn block_limit(&self) -> usize {
        match self.config.growth {
            GrowthPolicy::Grow => self.config.max_blocks.max(1),
            GrowthPolicy::Fixed => 1,
        }
    }

    /// Padding needed so that `block[offset + pad]` is 8-byte aligned in memory
    fn padding(block: &[u8], offset: usize) -> usize {
        let addr = block.as_ptr() as usize + offset;
        (ALIGNMENT - addr % ALIGNMENT) % ALIGNMENT
    }

    fn fits(&self, size: usize) -> Option<usize> {
        let block = self.blocks.last()?;
        let start = self.cursor + Self::padding(block, self.cursor);
        (start.checked_add(size)? <= block.len()).then_some(start)
    }

    /// Allocate `size` zeroed bytes, 8-byte aligned
    pub fn allocate(&mut self, size: usize) -> Result<Allocation, ResourceError> {
        let start = match self.fits(size) {
            Some(start) => start,
            None => {
                if self.blocks.len() >= self.block_limit() {
                    let available = self
                        .blocks
                        .last()
                        .map(|b| b.len().saturating_sub(self.cursor))
                        .unwrap_or(0);
                    return Err(ResourceError::PoolExhausted {
                        requested: size,
                        available,
                    });
                }
                // Oversized requests get a dedicated block with room for alignment
                let block_size = self.config.block_size.max(size.saturating_add(ALIGNMENT));
                self.blocks.push(vec![0u8; block_size].into_boxed_slice());
                self.cursor = 0;
                self.fits(size).ok_or(ResourceError::PoolExhausted {
                    requested: size,
                    available: block_size,
                })?
            }
        };

        self.cursor = start + size;
        self.used += size;
        self.allocations += 1;
        Ok(Allocation {
            block: self.blocks.len() - 1,
            offset: start,
            len: size,
        })
    }

    /// Allocate and fill with `bytes`
    pub fn allocate_copy(&mut self, bytes: &[u8]) -> Result<Allocation, ResourceError> {
        let allocation = self.allocate(bytes.len())?;
        let block = &mut self.blocks[allocation.block];
        block[allocation.offset..allocation.offset + allocation.len].copy_from_slice(bytes);
        Ok(allocation)
    }

    pub fn bytes(&self, allocation: &Allocation) -> &[u8] {
        &self.blocks[allocation.block][allocation.offset..allocation.offset + allocation.len]
    }

    pub fn address(&self, allocation: &Allocation) -> Address {
        Address(self.blocks[allocation.block].as_ptr() as usize + allocation.offset)
    }

    /// Drop every allocation. Keeps the first block for reuse; allocations
    /// made before the reset must not be used afterwards.
    pub fn reset(&mut self) {
        self.blocks.truncate(1);
        self.blocks.iter_mut().for_each(|b| b.fill(0));
        self.cursor = 0;
        self.used = 0;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            blocks: self.blocks.len(),
            capacity: self.blocks.iter().map(|b| b.len()).sum(),
            used: self.used,
            allocations: self.allocations,
        }
    }
}
