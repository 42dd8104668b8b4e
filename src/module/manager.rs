//! Module manager
//!
//! Entry point tying the loader, symbol cache and deployment manager
//! together behind one object. Each manager owns its own registry and cache,
//! so several can coexist in one process.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::module::cache::{Address, CacheStats};
use crate::module::deploy::{DeploymentManager, DeploymentStats, EvolutionId};
use crate::module::error::{DependencyError, DeployError, LoadError, UnloadError};
use crate::module::loader::{LoaderStats, ModuleLoader};
use crate::module::registry::{ModuleRegistry, ModuleState, RecordHandle, RecordView};
use crate::module::resolver::{DependencySpec, HostTarget};
use crate::module::traits::{EventSink, ExecutionEngine, MetricsProbe, SignatureVerifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManagerStats {
    pub loader: LoaderStats,
    pub cache: CacheStats,
    pub deployment: DeploymentStats,
}

pub struct ModuleManagerBuilder {
    config: RuntimeConfig,
    host: Option<HostTarget>,
    engine: Option<Arc<dyn ExecutionEngine>>,
    probe: Option<Arc<dyn MetricsProbe>>,
    sink: Option<Arc<dyn EventSink>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl ModuleManagerBuilder {
    pub fn host(mut self, host: HostTarget) -> Self {
        self.host = Some(host);
        self
    }

    /// Engine for initialization hooks and sandbox runs
    pub fn engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn MetricsProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn build(self) -> Result<ModuleManager, LoadError> {
        let mut loader = ModuleLoader::builder(&self.config);
        if let Some(host) = self.host {
            loader = loader.host(host);
        }
        if let Some(engine) = &self.engine {
            loader = loader.engine(engine.clone());
        }
        if let Some(verifier) = self.verifier {
            loader = loader.verifier(verifier);
        }
        let loader = loader.build()?;

        let mut deployments = DeploymentManager::builder(loader.clone(), &self.config);
        if let Some(engine) = self.engine {
            deployments = deployments.engine(engine);
        }
        if let Some(probe) = self.probe {
            deployments = deployments.probe(probe);
        }
        if let Some(sink) = self.sink {
            deployments = deployments.sink(sink);
        }

        Ok(ModuleManager {
            loader,
            deployments: deployments.build(),
        })
    }
}

/// Module manager coordinates loading, lookup and deployment
pub struct ModuleManager {
    loader: ModuleLoader,
    deployments: DeploymentManager,
}

impl ModuleManager {
    pub fn builder(config: RuntimeConfig) -> ModuleManagerBuilder {
        ModuleManagerBuilder {
            config,
            host: None,
            engine: None,
            probe: None,
            sink: None,
            verifier: None,
        }
    }

    /// Manager with no engine, probe or custom sink
    pub fn new(config: RuntimeConfig) -> Result<Self, LoadError> {
        Self::builder(config).build()
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        self.loader.registry()
    }

    pub fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    pub async fn load(&self, name: &str) -> Result<RecordHandle, LoadError> {
        self.loader.load(name).await
    }

    pub async fn load_from_path(&self, name: &str, path: impl AsRef<Path>) -> Result<RecordHandle, LoadError> {
        self.loader.load_from_path(name, path).await
    }

    pub async fn preload(&self, name: &str) -> Result<RecordHandle, LoadError> {
        self.loader.preload(name).await
    }

    /// Address of `symbol` in the module `handle` names. Lookups follow the
    /// module's current version, so a handle stays usable across hot swaps.
    pub fn get_symbol(&self, handle: &RecordHandle, symbol: &str) -> Option<Address> {
        self.loader.lookup(&handle.name, symbol)
    }

    pub fn get_symbol_by_name(&self, module: &str, symbol: &str) -> Option<Address> {
        self.loader.lookup(module, symbol)
    }

    pub fn unload(&self, name: &str) -> Result<(), UnloadError> {
        self.loader.unload(name)
    }

    /// Run a staged deployment replacing `name` with the image at `path`
    pub async fn hot_swap(&self, name: &str, path: impl AsRef<Path>) -> Result<(), DeployError> {
        self.hot_swap_tracked(name, path).await.map(|_| ())
    }

    /// As [`hot_swap`](Self::hot_swap), returning the evolution id
    pub async fn hot_swap_tracked(&self, name: &str, path: impl AsRef<Path>) -> Result<EvolutionId, DeployError> {
        self.deployments.hot_swap(name, path).await
    }

    pub fn register_dependency(&self, module: &str, spec: DependencySpec) {
        self.loader.registry().register_dependency(module, spec);
    }

    pub fn resolve_load_order(&self, names: &[String]) -> Result<Vec<String>, DependencyError> {
        self.loader.resolve_load_order(names)
    }

    pub fn list_modules(&self) -> Vec<RecordView> {
        self.loader.registry().views()
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.loader.registry().state(name)
    }

    pub fn collect_garbage(&self) -> Vec<String> {
        self.loader.collect_garbage()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            loader: self.loader.stats(),
            cache: self.loader.cache().stats(),
            deployment: self.deployments.stats(),
        }
    }

    /// Drop every module and cached symbol
    pub fn shutdown(&self) -> Vec<String> {
        let removed = self.loader.unload_all();
        info!("Module manager shut down ({} modules released)", removed.len());
        removed
    }
}
