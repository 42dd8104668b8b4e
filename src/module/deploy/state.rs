//! Deployment phase state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::utils::current_timestamp_millis;

/// Phases of a staged deployment, in rollout order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeploymentPhase {
    Sandbox,
    Canary,
    Gradual,
    Full,
    Rollback,
}

impl DeploymentPhase {
    fn rank(self) -> u8 {
        match self {
            DeploymentPhase::Sandbox => 0,
            DeploymentPhase::Canary => 1,
            DeploymentPhase::Gradual => 2,
            DeploymentPhase::Full => 3,
            DeploymentPhase::Rollback => 4,
        }
    }

    /// Rollout moves forward one phase at a time; gradual steps repeat the
    /// `Gradual` phase. `Rollback` is reachable from every other phase and
    /// ends the deployment.
    pub fn can_advance_to(self, next: DeploymentPhase) -> bool {
        match (self, next) {
            (DeploymentPhase::Rollback, _) => false,
            (_, DeploymentPhase::Rollback) => true,
            (DeploymentPhase::Full, _) => false,
            (DeploymentPhase::Gradual, DeploymentPhase::Gradual) => true,
            (from, to) => to.rank() == from.rank() + 1,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentPhase::Full | DeploymentPhase::Rollback)
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeploymentPhase::Sandbox => "sandbox",
            DeploymentPhase::Canary => "canary",
            DeploymentPhase::Gradual => "gradual",
            DeploymentPhase::Full => "full",
            DeploymentPhase::Rollback => "rollback",
        })
    }
}

/// Identifier of one deployment attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvolutionId(Uuid);

impl EvolutionId {
    pub fn new() -> Self {
        EvolutionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EvolutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EvolutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Progress of one evolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub evolution_id: EvolutionId,
    pub module: String,
    pub phase: DeploymentPhase,
    /// Share of traffic routed to the candidate
    pub traffic_fraction: f64,
    pub started_at: u64,
    pub phase_started_at: u64,
    /// Passing checks over the whole evolution: clean monitor samples and
    /// a passed sandbox run
    pub success_count: u64,
    /// Failed checks: probe errors, timeouts and violating samples
    pub failure_count: u64,
}

impl DeploymentState {
    pub fn new(evolution_id: EvolutionId, module: impl Into<String>) -> Self {
        let now = current_timestamp_millis();
        Self {
            evolution_id,
            module: module.into(),
            phase: DeploymentPhase::Sandbox,
            traffic_fraction: 0.0,
            started_at: now,
            phase_started_at: now,
            success_count: 0,
            failure_count: 0,
        }
    }

    pub fn record(&mut self, successes: u32, failures: u32) {
        self.success_count += u64::from(successes);
        self.failure_count += u64::from(failures);
    }

    /// Move to `next`, returning `false` (and staying put) if the
    /// transition is not allowed
    pub fn advance(&mut self, next: DeploymentPhase, traffic_fraction: f64) -> bool {
        if !self.phase.can_advance_to(next) {
            return false;
        }
        self.phase = next;
        self.traffic_fraction = traffic_fraction;
        self.phase_started_at = current_timestamp_millis();
        true
    }
}
