//! Load planning and commit
//!
//! A load runs in three steps. The closure of the requested module is
//! discovered and validated from image headers only; the new members are
//! ordered, decoded and initialized; finally one registry transaction checks
//! everything again and commits. Nothing is visible until that last step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::loader::{LoadMode, ModuleLoader, LOADER_VERSION};
use crate::module::error::{DependencyError, LoadError, ResourceError, StateError};
use crate::module::format::{inspect, verify, Architecture, ModuleMetadata};
use crate::module::image::{DeferredImage, ImageSlot, ModuleImage};
use crate::module::registry::{ModuleRecord, ModuleState, RegistryTxn};
use crate::module::resolver::{DependencyGraph, DependencyKind, DependencySpec, GraphNode, ModuleVersion};

/// A closure member that is not registered yet
struct Candidate {
    name: String,
    path: PathBuf,
    bytes: Vec<u8>,
    checksum: u64,
    metadata: ModuleMetadata,
    /// Metadata plus runtime-declared dependencies
    dependencies: Vec<DependencySpec>,
}

/// A record ready to commit, with the dependencies it will hold
struct Prepared {
    record: ModuleRecord,
    dependencies: Vec<DependencySpec>,
}

impl ModuleLoader {
    pub(super) async fn resolve_and_commit(
        &self,
        root: &str,
        root_path: Option<PathBuf>,
        mode: LoadMode,
    ) -> Result<(), LoadError> {
        let (candidates, promote) = self.resolve_closure(root, root_path, mode).await?;
        let ordered = self.order_candidates(candidates)?;

        let mut prepared = Vec::with_capacity(ordered.len());
        for candidate in ordered {
            prepared.push(self.materialize(candidate)?);
        }

        if mode == LoadMode::Full {
            self.run_init_hooks(&prepared, &promote).await?;
        }

        self.commit(prepared, promote, mode)
    }

    /// Breadth-first walk from `root` through applicable dependencies.
    ///
    /// Returns the unregistered members plus registered members that a full
    /// load must promote from `Loaded` to `Ready`.
    async fn resolve_closure(
        &self,
        root: &str,
        root_path: Option<PathBuf>,
        mode: LoadMode,
    ) -> Result<(Vec<Candidate>, Vec<String>), LoadError> {
        let registry = &self.inner.registry;
        let host = self.inner.host;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut promote = Vec::new();
        let mut missing = Vec::new();
        let mut seen: HashSet<String> = HashSet::from([root.to_string()]);
        let mut queue: VecDeque<(String, Option<PathBuf>)> = VecDeque::from([(root.to_string(), root_path)]);

        while let Some((name, path)) = queue.pop_front() {
            if let Some(state) = registry.state(&name) {
                if mode == LoadMode::Full && state == ModuleState::Loaded {
                    promote.push(name);
                }
                continue;
            }

            let path = match path.or_else(|| self.inner.discovery.find(&name)) {
                Some(path) => path,
                None => return Err(LoadError::NotFound(name)),
            };
            let candidate = self.inspect_candidate(&name, path).await?;

            for dep in candidate.dependencies.iter().filter(|d| d.applies_to(&host)) {
                if !dep.kind.orders_load() || seen.contains(&dep.target) {
                    continue;
                }
                if registry.contains(&dep.target) {
                    seen.insert(dep.target.clone());
                    queue.push_back((dep.target.clone(), None));
                    continue;
                }
                match self.inner.discovery.find(&dep.target) {
                    Some(path) => {
                        seen.insert(dep.target.clone());
                        queue.push_back((dep.target.clone(), Some(path)));
                    }
                    None if dep.kind == DependencyKind::Required => {
                        if !missing.contains(&dep.target) {
                            missing.push(dep.target.clone());
                        }
                    }
                    None => debug!("Skipping unavailable {:?} dependency {}", dep.kind, dep.target),
                }
            }
            candidates.push(candidate);
        }

        let conflicting = self.check_versions(&candidates);
        if !missing.is_empty() || !conflicting.is_empty() {
            return Err(LoadError::DependencyUnsatisfied { missing, conflicting });
        }
        Ok((candidates, promote))
    }

    /// Read, inspect and validate one image without decoding its sections.
    /// A lazily loaded image is never decoded before commit, so its
    /// checksum and export table are verified here instead.
    async fn inspect_candidate(&self, name: &str, path: PathBuf) -> Result<Candidate, LoadError> {
        debug!("Inspecting {} at {}", name, path.display());
        let bytes = self.read_image(&path).await?;
        let options = self.decode_options();
        let summary = if self.inner.config.lazy_loading {
            verify(&bytes, &options)
        } else {
            inspect(&bytes, &options)
        };
        let summary = summary.map_err(|source| LoadError::Format {
            module: name.to_string(),
            source,
        })?;
        let metadata = self.validate_metadata(name, summary.header.architecture, summary.metadata)?;

        let mut dependencies = metadata.dependencies.clone();
        for extra in self.inner.registry.dependencies_of(name).unwrap_or_default() {
            if !dependencies.contains(&extra) {
                dependencies.push(extra);
            }
        }

        Ok(Candidate {
            name: name.to_string(),
            path,
            bytes,
            checksum: summary.header.checksum,
            metadata,
            dependencies,
        })
    }

    /// Host and policy checks shared by loads and hot swaps
    pub(super) fn validate_metadata(
        &self,
        name: &str,
        architecture: Architecture,
        metadata: Option<ModuleMetadata>,
    ) -> Result<ModuleMetadata, LoadError> {
        let metadata = metadata
            .ok_or_else(|| LoadError::ValidationFailed(format!("module {} carries no metadata", name)))?;
        if metadata.name != name {
            return Err(LoadError::ValidationFailed(format!(
                "image for {} declares name {}",
                name, metadata.name
            )));
        }
        if let Some(host) = self.inner.host.architecture {
            if architecture != host {
                return Err(DependencyError::PlatformIncompatible {
                    module: name.to_string(),
                    expected: host.to_string(),
                    found: architecture.to_string(),
                }
                .into());
            }
        }
        if metadata.min_loader_version > LOADER_VERSION {
            return Err(LoadError::ValidationFailed(format!(
                "{} requires loader version {}, this is {}",
                name, metadata.min_loader_version, LOADER_VERSION
            )));
        }
        if metadata.security_level < self.inner.config.minimum_security_level {
            return Err(LoadError::ValidationFailed(format!(
                "{} has security level {}, minimum is {}",
                name, metadata.security_level, self.inner.config.minimum_security_level
            )));
        }
        Ok(metadata)
    }

    /// Version constraints of every candidate against the registry and the
    /// other candidates
    fn check_versions(&self, candidates: &[Candidate]) -> Vec<String> {
        let host = self.inner.host;
        let versions: HashMap<&str, &ModuleVersion> = candidates
            .iter()
            .map(|c| (c.name.as_str(), &c.metadata.version))
            .collect();

        let mut conflicting = Vec::new();
        for candidate in candidates {
            for dep in candidate.dependencies.iter().filter(|d| d.applies_to(&host)) {
                let found = match versions.get(dep.target.as_str()) {
                    Some(version) => Some((*version).clone()),
                    None => self.inner.registry.view(&dep.target).map(|v| v.version),
                };
                let Some(found) = found else { continue };
                let satisfied = dep.constraint.satisfies(&found);
                let problem = match dep.kind {
                    DependencyKind::Required | DependencyKind::Optional if !satisfied => Some(format!(
                        "{} requires {} {}, found {}",
                        candidate.name, dep.target, dep.constraint, found
                    )),
                    DependencyKind::Conflicting if satisfied => Some(format!(
                        "{} conflicts with {} {}",
                        candidate.name, dep.target, found
                    )),
                    _ => None,
                };
                if let Some(problem) = problem {
                    conflicting.push(problem);
                }
            }
        }
        conflicting
    }

    /// Dependencies first; rejects cycles among the new members
    fn order_candidates(&self, candidates: Vec<Candidate>) -> Result<Vec<Candidate>, LoadError> {
        let nodes: Vec<GraphNode> = candidates
            .iter()
            .map(|c| GraphNode::new(c.name.clone(), c.dependencies.clone()))
            .collect();
        let order = DependencyGraph::build(&nodes, &self.inner.host)?.topo_order();

        let mut by_name: HashMap<String, Candidate> =
            candidates.into_iter().map(|c| (c.name.clone(), c)).collect();
        Ok(order.iter().filter_map(|name| by_name.remove(name)).collect())
    }

    fn materialize(&self, candidate: Candidate) -> Result<Prepared, LoadError> {
        let Candidate {
            name,
            path,
            bytes,
            checksum,
            metadata,
            dependencies,
        } = candidate;

        let image = if self.inner.config.lazy_loading {
            debug!("Deferring decode of {}", name);
            ImageSlot::Deferred(Arc::new(DeferredImage::new(
                &name,
                bytes,
                self.inner.pool,
                self.inner.decodes.clone(),
            )))
        } else {
            let module = self.decode_image(&name, &bytes)?;
            ImageSlot::Resident(Arc::new(ModuleImage::build(&name, &module, self.inner.pool)?))
        };

        let hot_swappable = self.inner.config.hot_swap_allowed(&name);
        let record = ModuleRecord::new(metadata, checksum, image, Some(path), hot_swappable);
        Ok(Prepared { record, dependencies })
    }

    /// Initialization hooks for resident new members and promoted modules.
    /// Lazily loaded images are not decoded for this.
    async fn run_init_hooks(&self, prepared: &[Prepared], promote: &[String]) -> Result<(), LoadError> {
        let Some(engine) = &self.inner.engine else {
            return Ok(());
        };

        let mut targets: Vec<(String, Arc<ModuleImage>)> = Vec::new();
        for p in prepared {
            if let Some(image) = p.record.image().resident() {
                targets.push((p.record.name().to_string(), image));
            }
        }
        for name in promote {
            if let Some(image) = self.inner.registry.image(name).and_then(|slot| slot.image()) {
                targets.push((name.clone(), image));
            }
        }

        for (name, image) in targets {
            debug!("Initializing {}", name);
            engine
                .initialize(&name, image)
                .await
                .map_err(|e| LoadError::ValidationFailed(format!("initialization of {} failed: {}", name, e)))?;
        }
        Ok(())
    }

    /// Validate against the live registry, then apply. The validation pass
    /// covers every failure the apply pass can hit, so a commit either
    /// happens completely or not at all.
    fn commit(&self, prepared: Vec<Prepared>, promote: Vec<String>, mode: LoadMode) -> Result<(), LoadError> {
        let host = self.inner.host;
        let limit = self.inner.config.max_reference_count;
        let mut txn = self.inner.registry.write();

        let mut fresh = Vec::with_capacity(prepared.len());
        for p in prepared {
            if txn.contains(p.record.name()) {
                debug!("{} was registered concurrently, keeping existing record", p.record.name());
                continue;
            }
            txn.check_register(&p.record)?;
            fresh.push(p);
        }

        let fresh_names: HashSet<String> = fresh.iter().map(|p| p.record.name().to_string()).collect();
        let mut increments: HashMap<String, u32> = HashMap::new();
        let mut records = Vec::with_capacity(fresh.len());
        for Prepared { record, dependencies } in fresh {
            let mut held: Vec<String> = Vec::new();
            for dep in dependencies.iter().filter(|d| d.kind.orders_load() && d.applies_to(&host)) {
                let present = fresh_names.contains(&dep.target) || txn.contains(&dep.target);
                if present && !held.contains(&dep.target) {
                    held.push(dep.target.clone());
                    *increments.entry(dep.target.clone()).or_default() += 1;
                }
            }
            records.push(record.with_held(held));
        }

        for (target, added) in &increments {
            let current = txn.record(target).map(|r| r.reference_count()).unwrap_or(0);
            if current.saturating_add(*added) > limit {
                return Err(ResourceError::ReferenceLimit {
                    module: target.clone(),
                    limit,
                }
                .into());
            }
        }

        let path: &[ModuleState] = match mode {
            LoadMode::Full => &[
                ModuleState::Loading,
                ModuleState::Loaded,
                ModuleState::Initializing,
                ModuleState::Ready,
            ],
            LoadMode::Preload => &[ModuleState::Loading, ModuleState::Loaded],
        };

        let mut committed = Vec::with_capacity(records.len());
        for record in records {
            let held = record.held_dependencies().to_vec();
            let name = record.name().to_string();
            txn.register(record)?;
            txn.advance(&name, path)?;
            for dep in held {
                txn.acquire(&dep, limit)?;
            }
            committed.push(name);
        }
        Self::promote(&mut txn, &promote)?;

        info!("Committed {:?} ({:?})", committed, mode);
        Ok(())
    }

    fn promote(txn: &mut RegistryTxn<'_>, names: &[String]) -> Result<(), StateError> {
        for name in names {
            if txn.record(name).is_some_and(|r| r.state() == ModuleState::Loaded) {
                debug!("Promoting preloaded {}", name);
                txn.advance(name, &[ModuleState::Initializing, ModuleState::Ready])?;
            }
        }
        Ok(())
    }
}
