//! Test utilities for module system testing
//!
//! Provides a fixture with an isolated module directory, a builder for
//! `.native` images, and scripted collaborators.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use native_loader::config::{RuntimeConfig, SandboxConfig};
use native_loader::module::format::{encode, Architecture, Export, ModuleType};
use native_loader::module::image::ModuleImage;
use native_loader::module::resolver::{DependencySpec, HostTarget, ModuleVersion, Platform};
use native_loader::module::traits::{
    CollaboratorError, ExecutionEngine, ExecutionMetrics, MetricsProbe, PhaseSample, SampleContext,
};
use native_loader::module::{ModuleManager, ModuleManagerBuilder, ModuleMetadata, NativeModule};

/// Host every fixture manager runs as
pub fn host() -> HostTarget {
    HostTarget::new(Platform::Linux, Architecture::X86_64)
}

/// Description of a module image to write
#[derive(Debug, Clone)]
pub struct TestModule {
    pub name: String,
    pub version: ModuleVersion,
    pub architecture: Architecture,
    pub dependencies: Vec<DependencySpec>,
    pub exports: Vec<Export>,
    pub code_size: usize,
    pub abi_version: u32,
    pub api_version: u32,
    pub security_level: u32,
}

impl TestModule {
    /// Module exporting `add` at 0x10 in 64 bytes of code
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: ModuleVersion::parse(version).unwrap(),
            architecture: Architecture::X86_64,
            dependencies: Vec::new(),
            exports: vec![Export::function("add", 0x10, 4)],
            code_size: 64,
            abi_version: 1,
            api_version: 1,
            security_level: 0,
        }
    }

    pub fn depends_on(mut self, spec: DependencySpec) -> Self {
        self.dependencies.push(spec);
        self
    }

    pub fn export(mut self, export: Export) -> Self {
        self.exports.push(export);
        self
    }

    pub fn without_exports(mut self) -> Self {
        self.exports.clear();
        self
    }

    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn abi(mut self, abi_version: u32) -> Self {
        self.abi_version = abi_version;
        self
    }

    pub fn api(mut self, api_version: u32) -> Self {
        self.api_version = api_version;
        self
    }

    pub fn security_level(mut self, level: u32) -> Self {
        self.security_level = level;
        self
    }

    pub fn build(&self) -> NativeModule {
        let mut metadata = ModuleMetadata::new(self.name.clone(), self.version.clone());
        metadata.abi_version = self.abi_version;
        metadata.api_version = self.api_version;
        metadata.security_level = self.security_level;
        for dep in &self.dependencies {
            metadata = metadata.with_dependency(dep.clone());
        }

        let code: Vec<u8> = (0..self.code_size).map(|i| i as u8).collect();
        let mut module = NativeModule::new(self.architecture, ModuleType::User)
            .with_code(code)
            .with_metadata(metadata);
        for export in &self.exports {
            module = module.with_export(export.clone());
        }
        module
    }

    pub fn encode(&self) -> Vec<u8> {
        encode(&self.build()).unwrap()
    }
}

/// Test fixture for module system tests
pub struct ModuleTestFixture {
    /// Temporary directory for test data
    pub temp_dir: TempDir,
    /// Search path the fixture's managers load from
    pub modules_dir: PathBuf,
    /// Replacement images live here, outside the search path
    pub staging_dir: PathBuf,
    pub config: RuntimeConfig,
}

impl ModuleTestFixture {
    /// Create a new test fixture with isolated directories and short
    /// deployment windows
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = TempDir::new()?;
        let modules_dir = temp_dir.path().join("modules");
        let staging_dir = temp_dir.path().join("staging");
        std::fs::create_dir_all(&modules_dir)?;
        std::fs::create_dir_all(&staging_dir)?;

        let mut config = RuntimeConfig::default();
        config.loader.search_paths = vec![modules_dir.clone()];
        config.loader.load_timeout_ms = 5_000;
        config.deployment.canary_window_ms = 30;
        config.deployment.gradual_window_ms = 30;
        config.deployment.sample_interval_ms = 5;
        config.deployment.sample_timeout_ms = 500;

        Ok(Self {
            temp_dir,
            modules_dir,
            staging_dir,
            config,
        })
    }

    /// Write `module` into the search path as `<name>.native`
    pub fn write_module(&self, module: &TestModule) -> PathBuf {
        let path = self.modules_dir.join(format!("{}.native", module.name));
        self.write_module_at(&path, module);
        path
    }

    /// Write `module` into the staging directory under `file_name`
    pub fn stage_module(&self, file_name: &str, module: &TestModule) -> PathBuf {
        let path = self.staging_dir.join(file_name);
        self.write_module_at(&path, module);
        path
    }

    pub fn write_module_at(&self, path: &Path, module: &TestModule) {
        std::fs::write(path, module.encode()).unwrap();
    }

    pub fn write_raw(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.modules_dir.join(format!("{}.native", name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub fn builder(&self) -> ModuleManagerBuilder {
        ModuleManager::builder(self.config.clone()).host(host())
    }

    pub fn manager(&self) -> ModuleManager {
        self.builder().build().unwrap()
    }
}

/// Engine that records calls and reports fixed metrics
#[derive(Default)]
pub struct RecordingEngine {
    pub initialized: Mutex<Vec<String>>,
    pub executions: AtomicU64,
    pub fail_initialize: Mutex<Option<String>>,
    pub metrics: Mutex<ExecutionMetrics>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        let engine = Self::default();
        *engine.metrics.lock().unwrap() = ExecutionMetrics {
            wall_time: Duration::from_millis(2),
            instructions: 1_000,
            peak_memory_bytes: 4096,
            ..Default::default()
        };
        Arc::new(engine)
    }

    /// Fail initialization of `module`
    pub fn failing(module: &str) -> Arc<Self> {
        let engine = Self::new();
        *engine.fail_initialize.lock().unwrap() = Some(module.to_string());
        engine
    }

    pub fn set_metrics(&self, metrics: ExecutionMetrics) {
        *self.metrics.lock().unwrap() = metrics;
    }

    pub fn initialized(&self) -> Vec<String> {
        self.initialized.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionEngine for RecordingEngine {
    async fn initialize(&self, module: &str, _image: Arc<ModuleImage>) -> Result<(), CollaboratorError> {
        if self.fail_initialize.lock().unwrap().as_deref() == Some(module) {
            return Err(CollaboratorError::Failed(format!("{} init hook failed", module)));
        }
        self.initialized.lock().unwrap().push(module.to_string());
        Ok(())
    }

    async fn execute(
        &self,
        _module: &str,
        _image: Arc<ModuleImage>,
        _limits: &SandboxConfig,
    ) -> Result<ExecutionMetrics, CollaboratorError> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        Ok(*self.metrics.lock().unwrap())
    }
}

/// Probe whose candidate slows down once its traffic share reaches a threshold
pub struct RegressionProbe {
    pub threshold: f64,
    pub slowdown: f64,
}

#[async_trait]
impl MetricsProbe for RegressionProbe {
    async fn sample(&self, context: &SampleContext) -> Result<PhaseSample, CollaboratorError> {
        let baseline = Duration::from_millis(100);
        let candidate = if context.traffic_fraction >= self.threshold {
            baseline.mul_f64(self.slowdown)
        } else {
            baseline
        };
        Ok(PhaseSample {
            baseline_time: baseline,
            candidate_time: candidate,
            requests: 100,
            errors: 0,
            critical_violation: None,
        })
    }
}

/// Probe that reports a critical violation in one phase
pub struct ViolationProbe {
    pub phase: native_loader::module::deploy::DeploymentPhase,
}

#[async_trait]
impl MetricsProbe for ViolationProbe {
    async fn sample(&self, context: &SampleContext) -> Result<PhaseSample, CollaboratorError> {
        let mut sample = PhaseSample {
            baseline_time: Duration::from_millis(10),
            candidate_time: Duration::from_millis(10),
            requests: 10,
            ..Default::default()
        };
        if context.phase == self.phase {
            sample.critical_violation = Some("candidate wrote outside its data segment".to_string());
        }
        Ok(sample)
    }
}
