//! Sandboxed trial execution
//!
//! Runs the active and candidate images once through the execution engine
//! under the configured caps. A cap breach, a denied capability, an engine
//! failure or a wall-clock overrun of the candidate is a critical violation.

use std::sync::Arc;
use tracing::{debug, warn};

use super::state::EvolutionId;
use super::violation::{SecurityViolation, Severity, ViolationKind};
use crate::config::SandboxConfig;
use crate::module::image::ModuleImage;
use crate::module::traits::{ExecutionEngine, ExecutionMetrics};
use crate::utils::with_custom_timeout;

/// Outcome of one sandbox evaluation
#[derive(Debug, Clone, Default)]
pub struct SandboxReport {
    /// Active version's run; absent for a first deployment or a failed run
    pub baseline: Option<ExecutionMetrics>,
    pub candidate: Option<ExecutionMetrics>,
    pub violations: Vec<SecurityViolation>,
}

impl SandboxReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Candidate/baseline wall time, when both runs completed
    pub fn regression_ratio(&self) -> Option<f64> {
        let baseline = self.baseline?.wall_time;
        let candidate = self.candidate?.wall_time;
        if baseline.is_zero() {
            return None;
        }
        Some(candidate.as_secs_f64() / baseline.as_secs_f64())
    }
}

pub struct Sandbox {
    limits: SandboxConfig,
    engine: Arc<dyn ExecutionEngine>,
}

impl Sandbox {
    pub fn new(limits: SandboxConfig, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { limits, engine }
    }

    pub fn limits(&self) -> &SandboxConfig {
        &self.limits
    }

    pub async fn evaluate(
        &self,
        module: &str,
        evolution_id: EvolutionId,
        active: Option<Arc<ModuleImage>>,
        candidate: Arc<ModuleImage>,
    ) -> SandboxReport {
        let mut report = SandboxReport::default();

        if let Some(active) = active {
            match self.run(module, active).await {
                Ok(metrics) => report.baseline = Some(metrics),
                Err(v) => warn!("Baseline run of {} failed: {}", module, v),
            }
        }

        match self.run(module, candidate).await {
            Ok(metrics) => {
                report.violations = self.check(module, &metrics);
                report.candidate = Some(metrics);
            }
            Err(v) => report.violations.push(v),
        }

        for violation in &mut report.violations {
            violation.evolution_id = Some(evolution_id);
        }
        debug!(
            "Sandbox run of {}: {} violations, regression {:?}",
            module,
            report.violations.len(),
            report.regression_ratio()
        );
        report
    }

    async fn run(&self, module: &str, image: Arc<ModuleImage>) -> Result<ExecutionMetrics, SecurityViolation> {
        let budget = self.limits.max_wall_clock();
        match with_custom_timeout(self.engine.execute(module, image, &self.limits), budget).await {
            Ok(Ok(metrics)) => Ok(metrics),
            Ok(Err(e)) => Err(critical(ViolationKind::Crash, module, e.to_string())),
            Err(_) => Err(critical(
                ViolationKind::WallClockLimit,
                module,
                format!("no result within {}ms", budget.as_millis()),
            )),
        }
    }

    /// Cap and capability checks on a completed run
    pub fn check(&self, module: &str, metrics: &ExecutionMetrics) -> Vec<SecurityViolation> {
        let limits = &self.limits;
        let mut violations = Vec::new();

        if metrics.peak_memory_bytes > limits.max_memory_bytes {
            violations.push(critical(
                ViolationKind::MemoryLimit,
                module,
                format!("{} bytes used, limit {}", metrics.peak_memory_bytes, limits.max_memory_bytes),
            ));
        }
        if metrics.instructions > limits.max_instructions {
            violations.push(critical(
                ViolationKind::InstructionLimit,
                module,
                format!("{} instructions, limit {}", metrics.instructions, limits.max_instructions),
            ));
        }
        if metrics.wall_time > limits.max_wall_clock() {
            violations.push(critical(
                ViolationKind::WallClockLimit,
                module,
                format!("ran {}ms, limit {}ms", metrics.wall_time.as_millis(), limits.max_wall_clock_ms),
            ));
        }
        if metrics.syscalls > 0 && !limits.allow_syscalls {
            violations.push(critical(
                ViolationKind::UnauthorizedSyscall,
                module,
                format!("{} syscalls with syscalls disabled", metrics.syscalls),
            ));
        }
        if metrics.files_opened > 0 && !limits.allow_file_access {
            violations.push(critical(
                ViolationKind::UnauthorizedFileAccess,
                module,
                format!("{} files opened with file access disabled", metrics.files_opened),
            ));
        } else if metrics.files_opened > limits.max_file_descriptors {
            violations.push(critical(
                ViolationKind::UnauthorizedFileAccess,
                module,
                format!("{} files opened, limit {}", metrics.files_opened, limits.max_file_descriptors),
            ));
        }
        if metrics.network_connections > 0 && !limits.allow_network_access {
            violations.push(critical(
                ViolationKind::UnauthorizedNetworkAccess,
                module,
                format!("{} connections with network access disabled", metrics.network_connections),
            ));
        } else if metrics.network_connections > limits.max_network_connections {
            violations.push(critical(
                ViolationKind::UnauthorizedNetworkAccess,
                module,
                format!(
                    "{} connections, limit {}",
                    metrics.network_connections, limits.max_network_connections
                ),
            ));
        }
        violations
    }
}

fn critical(kind: ViolationKind, module: &str, description: String) -> SecurityViolation {
    SecurityViolation::new(kind, Severity::Critical, module, description)
}
