//! Hot-swap staging and commit
//!
//! A replacement image is decoded and checked for compatibility while the
//! active version keeps serving. Committing swaps the record in one registry
//! transaction; the cache purges the module's entries on the `Replaced` event.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use super::loader::ModuleLoader;
use crate::module::error::{LoadError, ResourceError};
use crate::module::format::ModuleMetadata;
use crate::module::image::{ImageSlot, ModuleImage};
use crate::module::registry::{ModuleRecord, ModuleState, RecordHandle, RecordView};
use crate::module::resolver::{DependencyKind, ModuleVersion};

/// A validated replacement that is not visible yet
pub struct StagedSwap {
    record: ModuleRecord,
    image: Arc<ModuleImage>,
    previous: RecordView,
    source: PathBuf,
}

impl std::fmt::Debug for StagedSwap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedSwap")
            .field("name", &self.name())
            .field("from", &self.previous.version)
            .field("to", self.version())
            .field("source", &self.source)
            .finish()
    }
}

impl StagedSwap {
    pub fn name(&self) -> &str {
        self.record.name()
    }

    pub fn version(&self) -> &ModuleVersion {
        &self.record.metadata().version
    }

    pub fn metadata(&self) -> &ModuleMetadata {
        self.record.metadata()
    }

    /// Decoded candidate image
    pub fn image(&self) -> &Arc<ModuleImage> {
        &self.image
    }

    /// The active record at staging time
    pub fn previous(&self) -> &RecordView {
        &self.previous
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl ModuleLoader {
    /// Decode and validate a replacement for the ready module `name`.
    ///
    /// The replacement must keep the ABI version, must not lower the API
    /// version, must export every symbol the active version exports with the
    /// same kind, and its dependencies must be satisfied by the registry.
    pub async fn stage_swap(&self, name: &str, path: impl AsRef<Path>) -> Result<StagedSwap, LoadError> {
        let path = path.as_ref().to_path_buf();
        let previous = self
            .inner
            .registry
            .view(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        if previous.state != ModuleState::Ready {
            return Err(LoadError::ValidationFailed(format!(
                "{} is {}, only ready modules can be swapped",
                name, previous.state
            )));
        }
        if !path.is_file() {
            return Err(LoadError::NotFound(format!("{} ({})", name, path.display())));
        }

        let bytes = self.read_image(&path).await?;
        let module = self.decode_image(name, &bytes)?;
        let metadata = self.validate_metadata(name, module.architecture, module.metadata.clone())?;

        let (active, active_image) = self
            .inner
            .registry
            .with_record(name, |r| (r.metadata().clone(), r.image().clone()))
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        if metadata.abi_version != active.abi_version {
            return Err(LoadError::ValidationFailed(format!(
                "{} changes ABI version {} -> {}",
                name, active.abi_version, metadata.abi_version
            )));
        }
        if metadata.api_version < active.api_version {
            return Err(LoadError::ValidationFailed(format!(
                "{} lowers API version {} -> {}",
                name, active.api_version, metadata.api_version
            )));
        }

        let active_image = active_image
            .image()
            .ok_or_else(|| LoadError::ValidationFailed(format!("active image of {} is unavailable", name)))?;
        for export in active_image.exports() {
            match module.export(&export.name) {
                Some(candidate) if candidate.kind == export.kind => {}
                Some(_) => {
                    return Err(LoadError::ValidationFailed(format!(
                        "{} changes the kind of export {}",
                        name, export.name
                    )));
                }
                None => {
                    return Err(LoadError::ValidationFailed(format!(
                        "{} drops export {}",
                        name, export.name
                    )));
                }
            }
        }

        let held = self.swap_dependencies(name, &metadata)?;
        let image = Arc::new(ModuleImage::build(name, &module, self.inner.pool)?);

        if let Some(engine) = &self.inner.engine {
            engine
                .initialize(name, image.clone())
                .await
                .map_err(|e| LoadError::ValidationFailed(format!("initialization of {} failed: {}", name, e)))?;
        }

        let checksum = module.checksum().map_err(|source| LoadError::Format {
            module: name.to_string(),
            source,
        })?;
        let hot_swappable = self.inner.config.hot_swap_allowed(name);
        let mut record = ModuleRecord::new(
            metadata,
            checksum,
            ImageSlot::Resident(image.clone()),
            Some(path.clone()),
            hot_swappable,
        )
        .with_held(held);
        record.state = ModuleState::Ready;

        debug!("Staged {} {} -> {}", name, previous.version, record.metadata().version);
        Ok(StagedSwap {
            record,
            image,
            previous,
            source: path,
        })
    }

    /// Registered dependencies the replacement will hold; every applicable
    /// constraint must be met by what is registered now
    fn swap_dependencies(&self, name: &str, metadata: &ModuleMetadata) -> Result<Vec<String>, LoadError> {
        let host = self.inner.host;
        let mut held = Vec::new();
        let mut missing = Vec::new();
        let mut conflicting = Vec::new();

        for dep in metadata.dependencies.iter().filter(|d| d.applies_to(&host)) {
            let found = self.inner.registry.view(&dep.target).map(|v| v.version);
            match (dep.kind, found) {
                (DependencyKind::Required, None) => missing.push(dep.target.clone()),
                (DependencyKind::Conflicting, Some(version)) if dep.constraint.satisfies(&version) => {
                    conflicting.push(format!("{} conflicts with {} {}", name, dep.target, version));
                }
                (DependencyKind::Required | DependencyKind::Optional, Some(version))
                    if !dep.constraint.satisfies(&version) =>
                {
                    conflicting.push(format!(
                        "{} requires {} {}, found {}",
                        name, dep.target, dep.constraint, version
                    ));
                }
                (kind, Some(_)) if kind.orders_load() => {
                    if !held.contains(&dep.target) {
                        held.push(dep.target.clone());
                    }
                }
                _ => {}
            }
        }

        if !missing.is_empty() || !conflicting.is_empty() {
            return Err(LoadError::DependencyUnsatisfied { missing, conflicting });
        }
        Ok(held)
    }

    /// Make a staged replacement active. Fails without side effects if the
    /// active record changed since staging.
    pub fn commit_swap(&self, staged: StagedSwap) -> Result<RecordHandle, LoadError> {
        let limit = self.inner.config.max_reference_count;
        let name = staged.name().to_string();
        let mut txn = self.inner.registry.write();

        let current = txn
            .record(&name)
            .ok_or_else(|| LoadError::NotFound(name.clone()))?;
        if current.id() != &staged.previous.id
            || current.checksum != staged.previous.checksum
            || current.state() != ModuleState::Ready
        {
            return Err(LoadError::ValidationFailed(format!(
                "{} changed while the swap was staged",
                name
            )));
        }
        let old_held = current.held_dependencies().to_vec();
        let new_held = staged.record.held_dependencies().to_vec();

        for dep in &new_held {
            let count = txn
                .record(dep)
                .map(|r| r.reference_count())
                .ok_or_else(|| LoadError::DependencyUnsatisfied {
                    missing: vec![dep.clone()],
                    conflicting: Vec::new(),
                })?;
            if !old_held.contains(dep) && count >= limit {
                return Err(ResourceError::ReferenceLimit {
                    module: dep.clone(),
                    limit,
                }
                .into());
            }
        }

        let handle = staged.record.handle();
        txn.replace(staged.record)?;
        for dep in &old_held {
            if txn.contains(dep) {
                txn.release(dep)?;
            }
        }
        for dep in &new_held {
            txn.acquire(dep, limit)?;
        }
        drop(txn);

        self.inner.counters.hot_swaps.fetch_add(1, Ordering::Relaxed);
        info!("Swapped {} {} -> {}", name, staged.previous.version, handle.id);
        Ok(handle)
    }
}
