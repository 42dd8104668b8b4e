//! Dynamic module loader
//!
//! Loads a module together with its dependency closure, all-or-nothing:
//! the closure is resolved, ordered, decoded and initialized without
//! touching the registry, then committed in a single registry transaction.
//! Concurrent loads of the same name share one in-flight operation; every
//! caller then takes its own reference on the committed record.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::config::{LoaderConfig, PoolConfig, RuntimeConfig};
use crate::module::cache::{Address, SymbolCache};
use crate::module::error::{LoadError, ResourceError, StateError, UnloadError};
use crate::module::format::{
    decode, DecodeOptions, NativeModule, Secp256k1TrustAnchor, SignatureVerifier,
};
use crate::module::registry::{
    ModuleDiscovery, ModuleRegistry, ModuleState, RecordHandle, RegistrySnapshot, RegistryTxn,
};
use crate::module::resolver::{dependency_closure, resolve_load_order, HostTarget};
use crate::module::traits::ExecutionEngine;
use crate::utils::{retry_if_retryable, with_custom_timeout};

/// Loader ABI generation; modules requiring a newer loader are rejected
pub const LOADER_VERSION: u32 = 1;

/// Loads of a record that keeps disappearing before it can be referenced
const ACQUIRE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) enum LoadMode {
    /// Decode, initialize and mark ready
    Full,
    /// Decode only; no initialization hooks run
    Preload,
}

type SharedLoad = Shared<BoxFuture<'static, Result<(), LoadError>>>;

/// Loader counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoaderStats {
    pub loads: u64,
    pub unloads: u64,
    pub failed_loads: u64,
    pub decodes: u64,
    pub hot_swaps: u64,
    pub modules: usize,
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub(super) loads: AtomicU64,
    pub(super) unloads: AtomicU64,
    pub(super) failed_loads: AtomicU64,
    pub(super) hot_swaps: AtomicU64,
}

pub(super) struct LoaderInner {
    pub(super) config: LoaderConfig,
    pub(super) pool: PoolConfig,
    pub(super) registry: Arc<ModuleRegistry>,
    pub(super) cache: Arc<SymbolCache>,
    pub(super) discovery: ModuleDiscovery,
    pub(super) host: HostTarget,
    pub(super) verifier: Option<Arc<dyn SignatureVerifier>>,
    pub(super) engine: Option<Arc<dyn ExecutionEngine>>,
    inflight: Mutex<HashMap<(String, LoadMode), SharedLoad>>,
    pub(super) counters: Counters,
    /// Shared with deferred images so lazy decodes are counted too
    pub(super) decodes: Arc<AtomicU64>,
}

/// Builder for [`ModuleLoader`]
pub struct LoaderBuilder {
    config: LoaderConfig,
    pool: PoolConfig,
    cache_config: crate::config::CacheConfig,
    registry: Option<Arc<ModuleRegistry>>,
    cache: Option<Arc<SymbolCache>>,
    host: HostTarget,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    engine: Option<Arc<dyn ExecutionEngine>>,
}

impl LoaderBuilder {
    pub fn registry(mut self, registry: Arc<ModuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache(mut self, cache: Arc<SymbolCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Platform and architecture modules are checked against
    pub fn host(mut self, host: HostTarget) -> Self {
        self.host = host;
        self
    }

    /// Trust anchor; overrides `trusted_keys` from the configuration
    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Engine running initialization hooks
    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Result<ModuleLoader, LoadError> {
        let verifier = match self.verifier {
            Some(verifier) => Some(verifier),
            None if !self.config.trusted_keys.is_empty() => {
                let anchor = Secp256k1TrustAnchor::from_hex_keys(&self.config.trusted_keys)
                    .map_err(|e| LoadError::ValidationFailed(format!("invalid trusted key: {}", e)))?;
                Some(Arc::new(anchor) as Arc<dyn SignatureVerifier>)
            }
            None => None,
        };
        if self.config.require_signatures && verifier.is_none() {
            warn!("Signatures are required but no trust anchor is configured; signatures will not be verified");
        }

        let registry = self.registry.unwrap_or_default();
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(SymbolCache::new(&self.cache_config)));
        registry.subscribe(cache.clone());

        Ok(ModuleLoader {
            inner: Arc::new(LoaderInner {
                discovery: ModuleDiscovery::from_config(&self.config),
                config: self.config,
                pool: self.pool,
                registry,
                cache,
                host: self.host,
                verifier,
                engine: self.engine,
                inflight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                decodes: Arc::new(AtomicU64::new(0)),
            }),
        })
    }
}

/// Cloneable handle to a shared loader
#[derive(Clone)]
pub struct ModuleLoader {
    pub(super) inner: Arc<LoaderInner>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("search_paths", &self.inner.config.search_paths)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ModuleLoader {
    pub fn builder(config: &RuntimeConfig) -> LoaderBuilder {
        LoaderBuilder {
            config: config.loader.clone(),
            pool: config.pool,
            cache_config: config.cache.clone(),
            registry: None,
            cache: None,
            host: HostTarget::current(),
            verifier: None,
            engine: None,
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<SymbolCache> {
        &self.inner.cache
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn discovery(&self) -> &ModuleDiscovery {
        &self.inner.discovery
    }

    pub fn host(&self) -> HostTarget {
        self.inner.host
    }

    pub(super) fn decode_options(&self) -> DecodeOptions<'_> {
        DecodeOptions {
            verifier: self.inner.verifier.as_deref(),
            require_signature: self.inner.config.require_signatures,
        }
    }

    /// Fully decode an image, counting the decode
    pub(super) fn decode_image(&self, name: &str, bytes: &[u8]) -> Result<NativeModule, LoadError> {
        self.inner.decodes.fetch_add(1, Ordering::Relaxed);
        decode(bytes, &self.decode_options()).map_err(|source| LoadError::Format {
            module: name.to_string(),
            source,
        })
    }

    /// Read an image file, retrying transient I/O failures
    pub(super) async fn read_image(&self, path: &Path) -> Result<Vec<u8>, LoadError> {
        let retry = self.inner.config.retry_config();
        retry_if_retryable(&retry, || async move {
            tokio::fs::read(path).await.map_err(ResourceError::from)
        })
        .await
        .map_err(LoadError::from)
    }

    /// Load `name` from the search paths and take a reference on it.
    ///
    /// Loading a module that is already ready only takes another reference.
    pub async fn load(&self, name: &str) -> Result<RecordHandle, LoadError> {
        self.load_with(name, None, LoadMode::Full).await
    }

    /// Load `name` from an explicit image path
    pub async fn load_from_path(
        &self,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<RecordHandle, LoadError> {
        let path = path.as_ref().to_path_buf();
        let existing = self
            .inner
            .registry
            .with_record(name, |r| r.source_path().cloned());
        if let Some(existing) = existing {
            if existing.as_ref() != Some(&path) {
                return Err(LoadError::AlreadyLoaded(name.to_string()));
            }
        }
        if !path.is_file() {
            return Err(LoadError::NotFound(format!("{} ({})", name, path.display())));
        }
        self.load_with(name, Some(path), LoadMode::Full).await
    }

    /// Decode `name` and its dependencies without running initialization
    /// hooks. The record is left `Loaded` with no references.
    pub async fn preload(&self, name: &str) -> Result<RecordHandle, LoadError> {
        if self.inner.registry.contains(name) {
            return Err(LoadError::AlreadyLoaded(name.to_string()));
        }
        self.single_flight(name, None, LoadMode::Preload).await?;
        self.inner
            .registry
            .find(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }

    async fn load_with(
        &self,
        name: &str,
        path: Option<PathBuf>,
        mode: LoadMode,
    ) -> Result<RecordHandle, LoadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.registry.state(name) {
                Some(ModuleState::Ready) => debug!("Module {} already ready", name),
                Some(ModuleState::Error) => {
                    return Err(LoadError::ValidationFailed(format!("module {} is in error state", name)));
                }
                _ => self.single_flight(name, path.clone(), mode).await?,
            }

            // Another caller may tear the record down before the reference
            // is taken; the image is still on disk, so load it again
            match self.inner.registry.acquire(name, self.inner.config.max_reference_count) {
                Err(LoadError::NotFound(_)) if attempt < ACQUIRE_ATTEMPTS => {
                    debug!("Module {} was unloaded before it could be referenced, reloading", name);
                }
                result => {
                    let handle = result?;
                    self.inner.counters.loads.fetch_add(1, Ordering::Relaxed);
                    return Ok(handle);
                }
            }
        }
    }

    /// Join the in-flight load of `name`, or start one
    async fn single_flight(
        &self,
        name: &str,
        path: Option<PathBuf>,
        mode: LoadMode,
    ) -> Result<(), LoadError> {
        let key = (name.to_string(), mode);
        let flight = {
            let mut inflight = self.inner.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get(&key) {
                Some(flight) => {
                    debug!("Joining in-flight load of {}", name);
                    flight.clone()
                }
                None => {
                    let loader = self.clone();
                    let owned_key = key.clone();
                    let flight = async move {
                        let result = loader.run_load(&owned_key.0, path, owned_key.1).await;
                        loader
                            .inner
                            .inflight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    async fn run_load(&self, name: &str, path: Option<PathBuf>, mode: LoadMode) -> Result<(), LoadError> {
        info!("Loading module: {}", name);
        let timeout = self.inner.config.load_timeout();
        let result = match with_custom_timeout(self.resolve_and_commit(name, path, mode), timeout).await {
            Ok(result) => result,
            Err(_) => Err(LoadError::LoadTimeout {
                module: name.to_string(),
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match &result {
            Ok(()) => info!("Module {} loaded", name),
            Err(e) => {
                self.inner.counters.failed_loads.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to load module {}: {}", name, e);
            }
        }
        result
    }

    /// Drop one reference on `name`. The module is torn down once it holds
    /// no references and no registered module depends on it; teardown then
    /// releases its own dependencies in turn.
    pub fn unload(&self, name: &str) -> Result<(), UnloadError> {
        let mut txn = self.inner.registry.write();
        let count = txn
            .record(name)
            .map(|r| r.reference_count())
            .ok_or_else(|| UnloadError::NotLoaded(name.to_string()))?;

        let holders = txn.holders_of(name);
        if count <= holders {
            // Every remaining reference belongs to a dependent
            let dependents = txn.dependents_of(name);
            if !dependents.is_empty() {
                return Err(UnloadError::HasDependents {
                    module: name.to_string(),
                    dependents,
                });
            }
        } else {
            let remaining = txn.release(name)?;
            if remaining > holders {
                debug!("Module {} still has {} references", name, remaining);
                return Ok(());
            }
            let dependents = txn.dependents_of(name);
            if !dependents.is_empty() {
                debug!("Module {} kept alive by {:?}", name, dependents);
                return Ok(());
            }
        }

        let removed = Self::teardown(&mut txn, name)?;
        drop(txn);
        self.inner
            .counters
            .unloads
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        info!("Unloaded {:?}", removed);
        Ok(())
    }

    /// Remove `name` and cascade to dependencies left unreferenced
    fn teardown(txn: &mut RegistryTxn<'_>, name: &str) -> Result<Vec<String>, StateError> {
        let mut removed = Vec::new();
        let mut pending = vec![name.to_string()];

        while let Some(current) = pending.pop() {
            let Some(held) = txn.record(&current).map(|r| r.held_dependencies().to_vec()) else {
                continue;
            };
            txn.advance(&current, &[ModuleState::Unloading, ModuleState::Unloaded])?;
            removed.push(current);

            for dep in held {
                if !txn.contains(&dep) {
                    continue;
                }
                let remaining = match txn.release(&dep) {
                    Ok(remaining) => remaining,
                    Err(StateError::NotReferenced(_)) => 0,
                    Err(e) => return Err(e),
                };
                if remaining == 0 && txn.dependents_of(&dep).is_empty() {
                    pending.push(dep);
                }
            }
        }
        Ok(removed)
    }

    /// Tear down every module with no references and no dependents, such as
    /// preloaded modules that were never used
    pub fn collect_garbage(&self) -> Vec<String> {
        let mut txn = self.inner.registry.write();
        let mut collected = Vec::new();

        loop {
            let idle: Vec<String> = txn
                .names()
                .into_iter()
                .filter(|n| txn.record(n).is_some_and(|r| r.reference_count() == 0))
                .filter(|n| txn.dependents_of(n).is_empty())
                .collect();
            if idle.is_empty() {
                break;
            }
            for name in idle {
                match Self::teardown(&mut txn, &name) {
                    Ok(removed) => collected.extend(removed),
                    Err(e) => {
                        warn!("Garbage collection of {} failed: {}", name, e);
                        drop(txn);
                        return self.finish_collection(collected);
                    }
                }
            }
        }
        drop(txn);
        self.finish_collection(collected)
    }

    fn finish_collection(&self, collected: Vec<String>) -> Vec<String> {
        if !collected.is_empty() {
            info!("Garbage collected {:?}", collected);
            self.inner
                .counters
                .unloads
                .fetch_add(collected.len() as u64, Ordering::Relaxed);
        }
        collected
    }

    /// Drop every record and cached symbol
    pub fn unload_all(&self) -> Vec<String> {
        let removed = self.inner.registry.write().clear();
        self.inner.cache.clear();
        self.inner
            .counters
            .unloads
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Address of an export, through the symbol cache
    pub fn lookup(&self, module: &str, symbol: &str) -> Option<Address> {
        self.inner.cache.lookup(&self.inner.registry, module, symbol)
    }

    /// Deterministic load order for `names` and everything they depend on,
    /// from registered metadata and runtime-declared dependencies
    pub fn resolve_load_order(
        &self,
        names: &[String],
    ) -> Result<Vec<String>, crate::module::error::DependencyError> {
        let registry = &self.inner.registry;
        let nodes = dependency_closure(names, |n| registry.dependencies_of(n));
        Ok(resolve_load_order(&nodes, &self.inner.host)?.load_order)
    }

    pub fn restore(&self, snapshot: RegistrySnapshot) {
        self.inner.registry.restore(snapshot);
    }

    pub fn stats(&self) -> LoaderStats {
        let c = &self.inner.counters;
        LoaderStats {
            loads: c.loads.load(Ordering::Relaxed),
            unloads: c.unloads.load(Ordering::Relaxed),
            failed_loads: c.failed_loads.load(Ordering::Relaxed),
            decodes: self.inner.decodes.load(Ordering::Relaxed),
            hot_swaps: c.hot_swaps.load(Ordering::Relaxed),
            modules: self.inner.registry.len(),
        }
    }
}
