//! Structured deployment events and the stock sinks

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::state::{DeploymentPhase, EvolutionId};
use super::violation::SecurityViolation;
use crate::module::resolver::ModuleVersion;
use crate::module::traits::EventSink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeploymentEvent {
    PhaseStarted {
        evolution_id: EvolutionId,
        module: String,
        phase: DeploymentPhase,
        traffic_fraction: f64,
    },
    /// Check counts of the phase that just passed
    PhaseCompleted {
        evolution_id: EvolutionId,
        module: String,
        phase: DeploymentPhase,
        successes: u32,
        failures: u32,
    },
    Violation(SecurityViolation),
    RolledBack {
        evolution_id: EvolutionId,
        module: String,
        phase: DeploymentPhase,
        reason: String,
    },
    RollbackFailed {
        evolution_id: EvolutionId,
        module: String,
        reason: String,
    },
    Completed {
        evolution_id: EvolutionId,
        module: String,
        version: ModuleVersion,
    },
}

impl DeploymentEvent {
    pub fn evolution_id(&self) -> Option<EvolutionId> {
        match self {
            DeploymentEvent::PhaseStarted { evolution_id, .. }
            | DeploymentEvent::PhaseCompleted { evolution_id, .. }
            | DeploymentEvent::RolledBack { evolution_id, .. }
            | DeploymentEvent::RollbackFailed { evolution_id, .. }
            | DeploymentEvent::Completed { evolution_id, .. } => Some(*evolution_id),
            DeploymentEvent::Violation(v) => v.evolution_id,
        }
    }

    pub fn module(&self) -> &str {
        match self {
            DeploymentEvent::PhaseStarted { module, .. }
            | DeploymentEvent::PhaseCompleted { module, .. }
            | DeploymentEvent::RolledBack { module, .. }
            | DeploymentEvent::RollbackFailed { module, .. }
            | DeploymentEvent::Completed { module, .. } => module,
            DeploymentEvent::Violation(v) => &v.module,
        }
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &DeploymentEvent) {
        match event {
            DeploymentEvent::PhaseStarted {
                evolution_id,
                module,
                phase,
                traffic_fraction,
            } => info!(
                "Deployment {} of {}: {} phase at {:.1}% traffic",
                evolution_id,
                module,
                phase,
                traffic_fraction * 100.0
            ),
            DeploymentEvent::PhaseCompleted {
                evolution_id,
                module,
                phase,
                successes,
                failures,
            } => info!(
                "Deployment {} of {}: {} phase passed ({} ok, {} failed)",
                evolution_id, module, phase, successes, failures
            ),
            DeploymentEvent::Violation(v) => warn!("Security violation: {}", v),
            DeploymentEvent::RolledBack {
                evolution_id,
                module,
                phase,
                reason,
            } => warn!(
                "Deployment {} of {} rolled back during {}: {}",
                evolution_id, module, phase, reason
            ),
            DeploymentEvent::RollbackFailed {
                evolution_id,
                module,
                reason,
            } => error!("Rollback of {} ({}) failed: {}", module, evolution_id, reason),
            DeploymentEvent::Completed {
                evolution_id,
                module,
                version,
            } => info!("Deployment {} complete: {} {} is active", evolution_id, module, version),
        }
    }
}

/// Sends events down an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<DeploymentEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeploymentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: &DeploymentEvent) {
        // A dropped receiver means nobody is listening any more
        let _ = self.tx.send(event.clone());
    }
}
