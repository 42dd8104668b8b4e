//! Loaded module images
//!
//! A [`ModuleImage`] holds a module's code and data copied into its own
//! memory pool, so export addresses stay fixed for as long as the image is
//! alive. An [`ImageSlot`] is what a registry record owns: either a resident
//! image or, under lazy loading, the raw bytes to decode on first use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::module::cache::pool::{Address, Allocation, MemoryPool};
use crate::module::error::LoadError;
use crate::module::format::{decode, DecodeOptions, Export, ExportKind, NativeModule};

pub struct ModuleImage {
    name: String,
    exports: Vec<Export>,
    index: HashMap<String, usize>,
    pool: MemoryPool,
    code: Allocation,
    data: Allocation,
}

impl std::fmt::Debug for ModuleImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleImage")
            .field("name", &self.name)
            .field("code_base", &self.code_base())
            .field("code_len", &self.code.len())
            .field("data_len", &self.data.len())
            .field("exports", &self.exports.len())
            .finish()
    }
}

impl ModuleImage {
    /// Copy a decoded module's sections into a fresh pool
    pub fn build(name: &str, module: &NativeModule, pool_config: PoolConfig) -> Result<Self, LoadError> {
        let mut pool = MemoryPool::new(pool_config);
        let code = pool.allocate_copy(&module.code)?;
        let data = pool.allocate_copy(&module.data)?;
        let index = module
            .exports
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        Ok(Self {
            name: name.to_string(),
            exports: module.exports.clone(),
            index,
            pool,
            code,
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_base(&self) -> Address {
        self.pool.address(&self.code)
    }

    pub fn data_base(&self) -> Address {
        self.pool.address(&self.data)
    }

    pub fn code(&self) -> &[u8] {
        self.pool.bytes(&self.code)
    }

    pub fn data(&self) -> &[u8] {
        self.pool.bytes(&self.data)
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn export(&self, symbol: &str) -> Option<&Export> {
        self.index.get(symbol).map(|&i| &self.exports[i])
    }

    /// Absolute address of an export
    pub fn resolve(&self, symbol: &str) -> Option<Address> {
        let export = self.export(symbol)?;
        let base = match export.kind {
            ExportKind::Function => self.code_base(),
            ExportKind::Variable => self.data_base(),
        };
        Some(base.offset(export.offset))
    }

    /// All exports with their absolute addresses
    pub fn symbol_table(&self) -> Vec<(String, Address)> {
        self.exports
            .iter()
            .filter_map(|e| self.resolve(&e.name).map(|a| (e.name.clone(), a)))
            .collect()
    }
}

/// Raw image whose decode is deferred to first use
pub struct DeferredImage {
    name: String,
    bytes: Vec<u8>,
    pool_config: PoolConfig,
    decodes: Arc<AtomicU64>,
    cell: OnceLock<Option<Arc<ModuleImage>>>,
}

impl DeferredImage {
    pub fn new(name: &str, bytes: Vec<u8>, pool_config: PoolConfig, decodes: Arc<AtomicU64>) -> Self {
        Self {
            name: name.to_string(),
            bytes,
            pool_config,
            decodes,
            cell: OnceLock::new(),
        }
    }

    fn materialize(&self) -> Result<Arc<ModuleImage>, LoadError> {
        self.decodes.fetch_add(1, Ordering::Relaxed);
        let module = decode(&self.bytes, &DecodeOptions::default()).map_err(|source| LoadError::Format {
            module: self.name.clone(),
            source,
        })?;
        Ok(Arc::new(ModuleImage::build(&self.name, &module, self.pool_config)?))
    }

    /// Decode once; later calls return the cached outcome
    pub fn get(&self) -> Option<Arc<ModuleImage>> {
        self.cell
            .get_or_init(|| {
                debug!("Decoding deferred module {}", self.name);
                match self.materialize() {
                    Ok(image) => Some(image),
                    Err(e) => {
                        warn!("Deferred decode of {} failed: {}", self.name, e);
                        None
                    }
                }
            })
            .clone()
    }

    /// Whether a decode was attempted and failed
    pub fn failed(&self) -> bool {
        matches!(self.cell.get(), Some(None))
    }

    pub fn resident(&self) -> Option<Arc<ModuleImage>> {
        self.cell.get().cloned().flatten()
    }
}

#[derive(Clone)]
pub enum ImageSlot {
    Resident(Arc<ModuleImage>),
    Deferred(Arc<DeferredImage>),
}

impl std::fmt::Debug for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSlot::Resident(image) => f.debug_tuple("Resident").field(image).finish(),
            ImageSlot::Deferred(d) => f
                .debug_struct("Deferred")
                .field("name", &d.name)
                .field("decoded", &d.resident().is_some())
                .finish(),
        }
    }
}

impl ImageSlot {
    /// Image, decoding a deferred slot if needed
    pub fn image(&self) -> Option<Arc<ModuleImage>> {
        match self {
            ImageSlot::Resident(image) => Some(image.clone()),
            ImageSlot::Deferred(deferred) => deferred.get(),
        }
    }

    /// Image only if already decoded
    pub fn resident(&self) -> Option<Arc<ModuleImage>> {
        match self {
            ImageSlot::Resident(image) => Some(image.clone()),
            ImageSlot::Deferred(deferred) => deferred.resident(),
        }
    }

    pub fn failed(&self) -> bool {
        match self {
            ImageSlot::Resident(_) => false,
            ImageSlot::Deferred(deferred) => deferred.failed(),
        }
    }

    pub fn same_as(&self, other: &ImageSlot) -> bool {
        match (self, other) {
            (ImageSlot::Resident(a), ImageSlot::Resident(b)) => Arc::ptr_eq(a, b),
            (ImageSlot::Deferred(a), ImageSlot::Deferred(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
