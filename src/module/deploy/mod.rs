//! Security and deployment management
//!
//! Staged rollout of module replacements with sandboxing, traffic-split
//! monitoring, violation tracking and snapshot rollback.

pub mod events;
pub mod manager;
pub mod monitor;
pub mod rollback;
pub mod router;
pub mod sandbox;
pub mod state;
pub mod violation;

pub use events::{ChannelEventSink, DeploymentEvent, TracingEventSink};
pub use manager::{DeploymentManager, DeploymentManagerBuilder, DeploymentStats};
pub use monitor::{EngineProbe, MonitorOutcome, PassiveProbe, PhaseMonitor, SampleTally};
pub use rollback::{read_backup_views, RollbackLog, RollbackPoint, RollbackSummary, REGISTRY_BACKUP_FILE};
pub use router::{Route, TrafficRouter};
pub use sandbox::{Sandbox, SandboxReport};
pub use state::{DeploymentPhase, DeploymentState, EvolutionId};
pub use violation::{SecurityViolation, Severity, ViolationKind, ViolationLog};
