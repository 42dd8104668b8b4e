//! Symbol cache and loading-time memory pools

pub mod pool;
pub mod symbols;

pub use pool::{Address, Allocation, MemoryPool, PoolStats, ALIGNMENT};
pub use symbols::{djb2, CacheStats, Djb2Hasher, SymbolCache, SymbolKey};
