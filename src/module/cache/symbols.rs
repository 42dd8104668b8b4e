//! Symbol address cache
//!
//! Maps `(module, symbol)` to resolved export addresses, falling back to the
//! registry on a miss. Entries are grouped by owning module so a module's
//! entries can be purged in bulk when the registry unloads, swaps or restores
//! it. Capacity is bounded; the oldest entry is evicted first.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use super::pool::Address;
use crate::config::CacheConfig;
use crate::module::registry::{ModuleRegistry, ModuleState, RegistryEvent, RegistryObserver};

/// djb2 string hash (`h * 33 + byte`, seeded with 5381)
pub fn djb2(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(5381u64, |h, &b| h.wrapping_mul(33).wrapping_add(b as u64))
}

/// [`Hasher`] running djb2 over everything written to it
#[derive(Debug, Clone, Copy)]
pub struct Djb2Hasher(u64);

impl Default for Djb2Hasher {
    fn default() -> Self {
        Djb2Hasher(5381)
    }
}

impl Hasher for Djb2Hasher {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.wrapping_mul(33).wrapping_add(b as u64);
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type Djb2Build = BuildHasherDefault<Djb2Hasher>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SymbolKey {
    pub module: String,
    pub symbol: String,
}

impl SymbolKey {
    pub fn new(module: &str, symbol: &str) -> Self {
        Self {
            module: module.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub purges: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    address: Address,
    seq: u64,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<SymbolKey, Entry, Djb2Build>,
    by_module: HashMap<String, HashSet<String>>,
    /// Insertion order; stale items (purged or re-inserted keys) are skipped
    order: VecDeque<(u64, SymbolKey)>,
    next_seq: u64,
}

impl CacheInner {
    fn remove(&mut self, key: &SymbolKey) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        if let Some(symbols) = self.by_module.get_mut(&key.module) {
            symbols.remove(&key.symbol);
            if symbols.is_empty() {
                self.by_module.remove(&key.module);
            }
        }
        true
    }
}

pub struct SymbolCache {
    inner: RwLock<CacheInner>,
    capacity: usize,
    /// Bumped by every purge; lookups drop inserts that raced with one
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    purges: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for SymbolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolCache").field("stats", &self.stats()).finish()
    }
}

impl SymbolCache {
    pub fn new(config: &CacheConfig) -> Self {
        let buckets = config.bucket_hint.min(config.capacity);
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::with_capacity_and_hasher(buckets, Djb2Build::default()),
                by_module: HashMap::new(),
                order: VecDeque::with_capacity(buckets),
                next_seq: 0,
            }),
            capacity: config.capacity.max(1),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            purges: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cached address of `symbol`, resolving through `registry` on a miss
    pub fn lookup(&self, registry: &ModuleRegistry, module: &str, symbol: &str) -> Option<Address> {
        let key = SymbolKey::new(module, symbol);
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = inner.entries.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.address);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let generation = self.generation.load(Ordering::Acquire);
        let address = registry.resolve_export(module, symbol)?;
        self.insert(key, address, generation);
        Some(address)
    }

    fn insert(&self, key: SymbolKey, address: Address, generation: u64) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if self.generation.load(Ordering::Acquire) != generation {
            debug!("Skipping cache insert for {}::{} after purge", key.module, key.symbol);
            return;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner
            .by_module
            .entry(key.module.clone())
            .or_default()
            .insert(key.symbol.clone());
        inner.order.push_back((seq, key.clone()));
        inner.entries.insert(key, Entry { address, seq });

        while inner.entries.len() > self.capacity {
            let Some((seq, oldest)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&oldest).is_some_and(|e| e.seq == seq) && inner.remove(&oldest) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every entry owned by `module`; returns how many were dropped
    pub fn purge_module(&self, module: &str) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let Some(symbols) = inner.by_module.remove(module) else {
            return 0;
        };
        for symbol in &symbols {
            inner.entries.remove(&SymbolKey::new(module, symbol));
        }
        inner.order.retain(|(_, key)| key.module != module);
        self.purges.fetch_add(1, Ordering::Relaxed);
        debug!("Purged {} cached symbols of {}", symbols.len(), module);
        symbols.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        inner.entries.clear();
        inner.by_module.clear();
        inner.order.clear();
        self.purges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl RegistryObserver for SymbolCache {
    fn on_event(&self, event: &RegistryEvent) {
        match event {
            RegistryEvent::Replaced { name, .. } | RegistryEvent::Removed { name, .. } => {
                self.purge_module(name);
            }
            RegistryEvent::StateChanged { name, to, .. }
                if matches!(to, ModuleState::Unloading | ModuleState::Error) =>
            {
                self.purge_module(name);
            }
            RegistryEvent::Restored => self.clear(),
            RegistryEvent::Registered { .. } | RegistryEvent::StateChanged { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::module::format::{Architecture, Export, ModuleMetadata, ModuleType, NativeModule};
    use crate::module::image::{ImageSlot, ModuleImage};
    use crate::module::registry::ModuleRecord;
    use crate::module::resolver::ModuleVersion;
    use std::sync::Arc;

    fn registry_with(names: &[&str]) -> Arc<ModuleRegistry> {
        let registry = Arc::new(ModuleRegistry::new());
        for name in names {
            let module = NativeModule::new(Architecture::X86_64, ModuleType::User)
                .with_code(vec![0; 64])
                .with_export(Export::function("add", 0x10, 4))
                .with_export(Export::function("sub", 0x20, 4));
            let image = ModuleImage::build(name, &module, PoolConfig::default()).unwrap();
            let record = ModuleRecord::new(
                ModuleMetadata::new(*name, ModuleVersion::new(1, 0, 0)),
                0,
                ImageSlot::Resident(Arc::new(image)),
                None,
                true,
            );
            registry.register(record).unwrap();
            registry
                .write()
                .advance(name, &[ModuleState::Loading, ModuleState::Loaded])
                .unwrap();
        }
        registry
    }

    fn cache(capacity: usize) -> SymbolCache {
        SymbolCache::new(&CacheConfig {
            capacity,
            bucket_hint: 8,
        })
    }

    #[test]
    fn test_djb2_known_values() {
        assert_eq!(djb2(b""), 5381);
        assert_eq!(djb2(b"a"), 5381 * 33 + 97);
        let mut hasher = Djb2Hasher::default();
        hasher.write(b"add");
        assert_eq!(hasher.finish(), djb2(b"add"));
    }

    #[test]
    fn test_miss_then_hit() {
        let registry = registry_with(&["m"]);
        let cache = cache(16);
        let first = cache.lookup(&registry, "m", "add").unwrap();
        let second = cache.lookup(&registry, "m", "add").unwrap();
        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!(cache.lookup(&registry, "m", "missing").is_none());
        assert!(cache.lookup(&registry, "other", "add").is_none());
    }

    #[test]
    fn test_purge_is_per_module() {
        let registry = registry_with(&["a", "b"]);
        let cache = cache(16);
        cache.lookup(&registry, "a", "add");
        cache.lookup(&registry, "a", "sub");
        cache.lookup(&registry, "b", "add");
        assert_eq!(cache.purge_module("a"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_module("a"), 0);
    }

    #[test]
    fn test_oldest_entry_evicted() {
        let registry = registry_with(&["a", "b"]);
        let cache = cache(2);
        cache.lookup(&registry, "a", "add");
        cache.lookup(&registry, "a", "sub");
        cache.lookup(&registry, "b", "add");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        // a::add was evicted, so this is a miss
        let misses = cache.stats().misses;
        cache.lookup(&registry, "a", "add");
        assert_eq!(cache.stats().misses, misses + 1);
    }

    #[test]
    fn test_observer_purges_on_unload() {
        let registry = registry_with(&["m"]);
        let cache = Arc::new(cache(16));
        registry.subscribe(cache.clone());
        cache.lookup(&registry, "m", "add").unwrap();

        registry
            .write()
            .advance("m", &[ModuleState::Unloading, ModuleState::Unloaded])
            .unwrap();
        assert!(cache.is_empty());
        assert!(cache.lookup(&registry, "m", "add").is_none());
    }
}
