//! Security violations and their bounded log

use serde::{Deserialize, Serialize};
use std::fmt;

use super::state::EvolutionId;
use crate::utils::{current_timestamp_millis, RingBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    MemoryLimit,
    InstructionLimit,
    WallClockLimit,
    UnauthorizedSyscall,
    UnauthorizedFileAccess,
    UnauthorizedNetworkAccess,
    PerformanceRegression,
    ErrorRate,
    Crash,
    /// Raised by the metrics probe or an external observer
    Reported,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ViolationKind::MemoryLimit => "memory limit",
            ViolationKind::InstructionLimit => "instruction limit",
            ViolationKind::WallClockLimit => "wall clock limit",
            ViolationKind::UnauthorizedSyscall => "unauthorized syscall",
            ViolationKind::UnauthorizedFileAccess => "unauthorized file access",
            ViolationKind::UnauthorizedNetworkAccess => "unauthorized network access",
            ViolationKind::PerformanceRegression => "performance regression",
            ViolationKind::ErrorRate => "error rate",
            ViolationKind::Crash => "crash",
            ViolationKind::Reported => "reported violation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub timestamp: u64,
    pub description: String,
    pub module: String,
    pub evolution_id: Option<EvolutionId>,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, severity: Severity, module: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            timestamp: current_timestamp_millis(),
            description: description.into(),
            module: module.into(),
            evolution_id: None,
        }
    }

    pub fn for_evolution(mut self, evolution_id: EvolutionId) -> Self {
        self.evolution_id = Some(evolution_id);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

impl fmt::Display for SecurityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} in {}: {}", self.severity, self.kind, self.module, self.description)
    }
}

/// Most recent violations, oldest evicted first
#[derive(Debug)]
pub struct ViolationLog {
    entries: RingBuffer<SecurityViolation>,
}

impl ViolationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RingBuffer::new(capacity),
        }
    }

    pub fn record(&mut self, violation: SecurityViolation) {
        self.entries.push(violation);
    }

    pub fn all(&self) -> Vec<SecurityViolation> {
        self.entries.iter().cloned().collect()
    }

    pub fn for_evolution(&self, evolution_id: EvolutionId) -> Vec<SecurityViolation> {
        self.entries
            .iter()
            .filter(|v| v.evolution_id == Some(evolution_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
