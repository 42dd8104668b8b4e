//! Collaborator contracts
//!
//! The loader and deployment manager never execute module code themselves.
//! They drive an [`ExecutionEngine`] for initialization hooks and sandboxed
//! runs, read live measurements from a [`MetricsProbe`], and report phase
//! transitions and violations to an [`EventSink`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::SandboxConfig;
use crate::module::deploy::{DeploymentEvent, DeploymentPhase, EvolutionId};
use crate::module::image::ModuleImage;

pub use crate::module::format::SignatureVerifier;

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("Collaborator failed: {0}")]
    Failed(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
}

/// What one execution of a module consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub wall_time: Duration,
    pub instructions: u64,
    pub peak_memory_bytes: u64,
    pub syscalls: u32,
    pub files_opened: u32,
    pub network_connections: u32,
}

/// Runs decoded module code
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Run a module's initialization hooks before it becomes visible
    async fn initialize(&self, module: &str, image: Arc<ModuleImage>) -> Result<(), CollaboratorError>;

    /// Execute a representative workload under `limits`
    async fn execute(
        &self,
        module: &str,
        image: Arc<ModuleImage>,
        limits: &SandboxConfig,
    ) -> Result<ExecutionMetrics, CollaboratorError>;
}

/// Inputs for one metrics sample during a monitored phase
#[derive(Debug, Clone)]
pub struct SampleContext {
    pub module: String,
    pub evolution_id: EvolutionId,
    pub phase: DeploymentPhase,
    /// Share of traffic currently routed to the candidate
    pub traffic_fraction: f64,
    pub active: Option<Arc<ModuleImage>>,
    pub candidate: Arc<ModuleImage>,
}

/// One monitoring observation comparing candidate with baseline
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PhaseSample {
    pub baseline_time: Duration,
    pub candidate_time: Duration,
    /// Requests served by the candidate since the previous sample
    pub requests: u64,
    pub errors: u64,
    /// Set when the observability layer saw a critical violation
    pub critical_violation: Option<String>,
}

impl PhaseSample {
    /// Candidate/baseline execution time; `None` without a usable baseline
    pub fn regression_ratio(&self) -> Option<f64> {
        if self.baseline_time.is_zero() {
            return None;
        }
        Some(self.candidate_time.as_secs_f64() / self.baseline_time.as_secs_f64())
    }

    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

/// Source of live candidate-versus-baseline measurements
#[async_trait]
pub trait MetricsProbe: Send + Sync {
    async fn sample(&self, context: &SampleContext) -> Result<PhaseSample, CollaboratorError>;
}

/// Receiver of structured deployment events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &DeploymentEvent);
}
