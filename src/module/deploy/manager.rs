//! Staged deployment of module replacements
//!
//! A hot swap runs `Sandbox -> Canary -> Gradual -> Full`. The candidate is
//! staged next to the active version and only becomes the registry's record
//! when every phase has passed. A failed phase, a critical violation or a
//! cancellation restores the registry snapshot taken when the deployment
//! started; if that snapshot is gone the failure is fatal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{DeploymentEvent, TracingEventSink};
use super::monitor::{EngineProbe, MonitorOutcome, PassiveProbe, PhaseMonitor, SampleTally};
use super::rollback::{remove_backup, write_backup, RollbackLog, RollbackPoint, RollbackSummary};
use super::router::{Route, TrafficRouter};
use super::sandbox::Sandbox;
use super::state::{DeploymentPhase, DeploymentState, EvolutionId};
use super::violation::{SecurityViolation, ViolationLog};
use crate::config::{DeploymentConfig, RuntimeConfig, SandboxConfig};
use crate::module::cache::Address;
use crate::module::error::{DeployError, LoadError};
use crate::module::image::ModuleImage;
use crate::module::loader::{ModuleLoader, StagedSwap};
use crate::module::traits::{EventSink, ExecutionEngine, MetricsProbe, SampleContext};

/// Deployment counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeploymentStats {
    pub started: u64,
    pub succeeded: u64,
    pub rolled_back: u64,
    pub fatal: u64,
    pub sandbox_runs: u64,
    pub violations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    succeeded: AtomicU64,
    rolled_back: AtomicU64,
    fatal: AtomicU64,
    sandbox_runs: AtomicU64,
    violations: AtomicU64,
}

struct InFlight {
    evolution_id: EvolutionId,
    token: CancellationToken,
    state: DeploymentState,
    candidate: Option<Arc<ModuleImage>>,
}

pub struct DeploymentManagerBuilder {
    loader: ModuleLoader,
    config: DeploymentConfig,
    sandbox: SandboxConfig,
    engine: Option<Arc<dyn ExecutionEngine>>,
    probe: Option<Arc<dyn MetricsProbe>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl DeploymentManagerBuilder {
    /// Engine for sandbox runs; without one the sandbox phase is skipped
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

    pub fn build(self) -> DeploymentManager {
        let probe = match (self.probe, &self.engine) {
            (Some(probe), _) => probe,
            (None, Some(engine)) => Arc::new(EngineProbe::new(engine.clone(), self.sandbox.clone())),
            (None, None) => Arc::new(PassiveProbe),
        };
        DeploymentManager {
            monitor: PhaseMonitor::from_config(&self.config),
            rollbacks: Mutex::new(RollbackLog::new(self.config.rollback_capacity)),
            violations: Mutex::new(ViolationLog::new(self.config.violation_capacity)),
            loader: self.loader,
            config: self.config,
            sandbox: self.sandbox,
            engine: self.engine,
            probe,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingEventSink)),
            router: TrafficRouter::new(),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }
}

pub struct DeploymentManager {
    loader: ModuleLoader,
    config: DeploymentConfig,
    sandbox: SandboxConfig,
    engine: Option<Arc<dyn ExecutionEngine>>,
    probe: Arc<dyn MetricsProbe>,
    sink: Arc<dyn EventSink>,
    monitor: PhaseMonitor,
    router: TrafficRouter,
    rollbacks: Mutex<RollbackLog>,
    violations: Mutex<ViolationLog>,
    /// Keyed by module name; one deployment per module at a time
    inflight: Mutex<HashMap<String, InFlight>>,
    counters: Counters,
}

/// Removes the in-flight entry however the deployment future ends
struct InFlightGuard<'a> {
    manager: &'a DeploymentManager,
    module: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.manager.router.clear(&self.module);
        self.manager
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.module);
    }
}

impl DeploymentManager {
    pub fn builder(loader: ModuleLoader, config: &RuntimeConfig) -> DeploymentManagerBuilder {
        DeploymentManagerBuilder {
            loader,
            config: config.deployment.clone(),
            sandbox: config.sandbox.clone(),
            engine: None,
            probe: None,
            sink: None,
        }
    }

    pub fn router(&self) -> &TrafficRouter {
        &self.router
    }

    /// Replace `name` with the image at `path` through the staged rollout
    pub async fn hot_swap(&self, name: &str, path: impl AsRef<Path>) -> Result<EvolutionId, DeployError> {
        self.hot_swap_with_cancel(name, path, CancellationToken::new()).await
    }

    /// As [`hot_swap`](Self::hot_swap); cancelling `cancel` rolls the
    /// deployment back at the next monitoring boundary
    pub async fn hot_swap_with_cancel(
        &self,
        name: &str,
        path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<EvolutionId, DeployError> {
        if !self.loader.config().hot_swap_allowed(name) {
            return Err(DeployError::Disabled(name.to_string()));
        }

        let evolution_id = EvolutionId::new();
        let token = cancel.child_token();
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if inflight.contains_key(name) {
                return Err(DeployError::InProgress(name.to_string()));
            }
            inflight.insert(
                name.to_string(),
                InFlight {
                    evolution_id,
                    token: token.clone(),
                    state: DeploymentState::new(evolution_id, name),
                    candidate: None,
                },
            );
        }
        let _guard = InFlightGuard {
            manager: self,
            module: name.to_string(),
        };

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        info!("Starting deployment {} of {}", evolution_id, name);
        let result = self.deploy(evolution_id, name, path.as_ref(), &token).await;
        match &result {
            Ok(()) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(DeployError::Fatal(_)) => {
                self.counters.fatal.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result.map(|()| evolution_id)
    }

    async fn deploy(
        &self,
        evolution_id: EvolutionId,
        name: &str,
        path: &Path,
        token: &CancellationToken,
    ) -> Result<(), DeployError> {
        let registry = self.loader.registry();
        let active = registry
            .view(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;

        self.create_rollback_point(evolution_id, name, active.source_path.as_deref())
            .await?;

        let staged = match self.loader.stage_swap(name, path).await {
            Ok(staged) => staged,
            Err(e) => {
                // Nothing became visible; the point is no longer needed
                self.lock_rollbacks().invalidate(evolution_id);
                return Err(e.into());
            }
        };
        self.update(name, |f| f.candidate = Some(staged.image().clone()));
        let active_image = registry.image(name).and_then(|slot| slot.image());

        self.emit_phase(evolution_id, name, DeploymentPhase::Sandbox, 0.0);
        match &self.engine {
            Some(engine) => {
                let sandbox = Sandbox::new(self.sandbox.clone(), engine.clone());
                let report = sandbox
                    .evaluate(name, evolution_id, active_image.clone(), staged.image().clone())
                    .await;
                self.counters.sandbox_runs.fetch_add(1, Ordering::Relaxed);
                if !report.passed() {
                    let reason = report
                        .violations
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    for violation in report.violations {
                        self.record_violation(violation);
                    }
                    self.update(name, |f| f.state.record(0, 1));
                    return self.abort(evolution_id, name, DeploymentPhase::Sandbox, reason);
                }
                self.update(name, |f| f.state.record(1, 0));
                self.emit_completed(evolution_id, name, DeploymentPhase::Sandbox, SampleTally { successes: 1, failures: 0 });
            }
            None => warn!("No execution engine configured; skipping sandbox for {}", name),
        }

        let mut phases = vec![(DeploymentPhase::Canary, self.config.canary_fraction, self.config.canary_window())];
        phases.extend(
            self.config
                .gradual_steps
                .iter()
                .map(|&f| (DeploymentPhase::Gradual, f, self.config.gradual_window())),
        );

        for (phase, fraction, window) in phases {
            if !self.advance(name, phase, fraction) {
                return Err(DeployError::PhaseFailed {
                    phase,
                    reason: "invalid phase transition".to_string(),
                });
            }
            self.router.set_split(name, fraction);
            self.emit_phase(evolution_id, name, phase, fraction);

            let context = SampleContext {
                module: name.to_string(),
                evolution_id,
                phase,
                traffic_fraction: fraction,
                active: active_image.clone(),
                candidate: staged.image().clone(),
            };
            let outcome = self.monitor.watch(self.probe.as_ref(), &context, window, token).await;
            let tally = outcome.tally();
            self.update(name, |f| f.state.record(tally.successes, tally.failures));
            match outcome {
                MonitorOutcome::Passed(tally) => {
                    self.emit_completed(evolution_id, name, phase, tally);
                }
                MonitorOutcome::Failed { violation, .. } => {
                    let reason = violation.to_string();
                    self.record_violation(violation);
                    return self.abort(evolution_id, name, phase, reason);
                }
                MonitorOutcome::Cancelled(_) => return self.cancelled(evolution_id, name, phase),
            }
        }

        self.finish(evolution_id, name, staged)
    }

    fn finish(&self, evolution_id: EvolutionId, name: &str, staged: StagedSwap) -> Result<(), DeployError> {
        let version = staged.version().clone();
        if let Err(e) = self.loader.commit_swap(staged) {
            return self.abort(evolution_id, name, DeploymentPhase::Gradual, e.to_string());
        }
        // The snapshot predates the swap; restoring it later would also undo
        // whatever other callers changed in the registry since
        self.lock_rollbacks().invalidate(evolution_id);
        self.advance(name, DeploymentPhase::Full, 1.0);
        self.router.clear(name);
        self.emit_phase(evolution_id, name, DeploymentPhase::Full, 1.0);
        self.sink.emit(&DeploymentEvent::Completed {
            evolution_id,
            module: name.to_string(),
            version,
        });
        Ok(())
    }

    async fn create_rollback_point(
        &self,
        evolution_id: EvolutionId,
        name: &str,
        source: Option<&Path>,
    ) -> Result<(), DeployError> {
        let registry = self.loader.registry();
        let snapshot = registry.snapshot();
        let mut point = RollbackPoint::new(evolution_id, name, snapshot);

        if let Some(dir) = &self.config.backup_dir {
            let location = write_backup(dir, evolution_id, source, &point.snapshot.views())
                .await
                .map_err(|e| DeployError::PhaseFailed {
                    phase: DeploymentPhase::Sandbox,
                    reason: format!("backup failed: {}", e),
                })?;
            point = point.with_backup(location);
        }

        let evicted = self.lock_rollbacks().push(point);
        if let Some(evicted) = evicted {
            remove_backup(&evicted).await;
        }
        Ok(())
    }

    /// Restore the rollback point and report `reason` as the cause
    fn abort(
        &self,
        evolution_id: EvolutionId,
        name: &str,
        phase: DeploymentPhase,
        reason: String,
    ) -> Result<(), DeployError> {
        self.restore(evolution_id, name, phase, &reason)?;
        Err(DeployError::RolledBack {
            evolution_id,
            phase,
            reason,
        })
    }

    /// Cancellation rolls back too. A critical violation reported while
    /// the deployment ran is the cause if there is one.
    fn cancelled(&self, evolution_id: EvolutionId, name: &str, phase: DeploymentPhase) -> Result<(), DeployError> {
        let critical = self
            .lock_violations()
            .for_evolution(evolution_id)
            .into_iter()
            .rev()
            .find(SecurityViolation::is_critical);
        match critical {
            Some(violation) => self.abort(evolution_id, name, phase, violation.to_string()),
            None => {
                self.restore(evolution_id, name, phase, "cancelled")?;
                Err(DeployError::Cancelled(evolution_id))
            }
        }
    }

    fn restore(
        &self,
        evolution_id: EvolutionId,
        name: &str,
        phase: DeploymentPhase,
        reason: &str,
    ) -> Result<(), DeployError> {
        self.advance(name, DeploymentPhase::Rollback, 0.0);
        self.router.clear(name);
        self.emit_phase(evolution_id, name, DeploymentPhase::Rollback, 0.0);

        let snapshot = {
            let mut rollbacks = self.lock_rollbacks();
            let snapshot = rollbacks.find_valid(evolution_id).map(|p| p.snapshot.clone());
            rollbacks.invalidate(evolution_id);
            snapshot
        };
        let Some(snapshot) = snapshot else {
            let message = format!("no valid rollback point for evolution {} of {}", evolution_id, name);
            error!("{}", message);
            self.sink.emit(&DeploymentEvent::RollbackFailed {
                evolution_id,
                module: name.to_string(),
                reason: message.clone(),
            });
            return Err(DeployError::Fatal(message));
        };

        self.loader.restore(snapshot);
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(&DeploymentEvent::RolledBack {
            evolution_id,
            module: name.to_string(),
            phase,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Roll `evolution_id` back. An in-flight deployment is cancelled and
    /// rolls itself back at its next monitoring boundary. A finished
    /// deployment has no valid rollback point left, completed or not, so
    /// rolling it back is `Fatal`.
    pub fn rollback(&self, evolution_id: EvolutionId) -> Result<(), DeployError> {
        {
            let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(f) = inflight.values().find(|f| f.evolution_id == evolution_id) {
                debug!("Cancelling in-flight deployment {}", evolution_id);
                f.token.cancel();
                return Ok(());
            }
        }

        // Points are invalidated when their deployment ends, so a valid one
        // only exists while the deployment is in flight
        let message = format!("no valid rollback point for evolution {}", evolution_id);
        warn!("{}", message);
        Err(DeployError::Fatal(message))
    }

    /// Record a violation observed outside the manager. A critical one
    /// cancels its evolution's deployment.
    pub fn report_violation(&self, violation: SecurityViolation) {
        let target = violation.evolution_id.filter(|_| violation.is_critical());
        self.record_violation(violation);
        if let Some(evolution_id) = target {
            let inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(f) = inflight.values().find(|f| f.evolution_id == evolution_id) {
                warn!("Critical violation, cancelling deployment {}", evolution_id);
                f.token.cancel();
            }
        }
    }

    fn record_violation(&self, violation: SecurityViolation) {
        self.counters.violations.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(&DeploymentEvent::Violation(violation.clone()));
        self.lock_violations().record(violation);
    }

    pub fn violations(&self) -> Vec<SecurityViolation> {
        self.lock_violations().all()
    }

    pub fn violations_for(&self, evolution_id: EvolutionId) -> Vec<SecurityViolation> {
        self.lock_violations().for_evolution(evolution_id)
    }

    pub fn clear_violations(&self) {
        self.lock_violations().clear();
    }

    pub fn rollback_points(&self) -> Vec<RollbackSummary> {
        self.lock_rollbacks().summaries()
    }

    /// Current state of the deployment running for `module`
    pub fn deployment(&self, module: &str) -> Option<DeploymentState> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .map(|f| f.state.clone())
    }

    /// Resolve `symbol` for one request, honouring the traffic split of a
    /// running deployment
    pub fn resolve_routed(&self, module: &str, symbol: &str) -> Option<Address> {
        if self.router.route(module) == Route::Candidate {
            let candidate = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(module)
                .and_then(|f| f.candidate.clone());
            if let Some(candidate) = candidate {
                return candidate.resolve(symbol);
            }
        }
        self.loader.lookup(module, symbol)
    }

    pub fn stats(&self) -> DeploymentStats {
        let c = &self.counters;
        DeploymentStats {
            started: c.started.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            rolled_back: c.rolled_back.load(Ordering::Relaxed),
            fatal: c.fatal.load(Ordering::Relaxed),
            sandbox_runs: c.sandbox_runs.load(Ordering::Relaxed),
            violations: c.violations.load(Ordering::Relaxed),
        }
    }

    fn advance(&self, name: &str, phase: DeploymentPhase, fraction: f64) -> bool {
        let mut advanced = false;
        self.update(name, |f| advanced = f.state.advance(phase, fraction));
        advanced
    }

    fn update(&self, name: &str, apply: impl FnOnce(&mut InFlight)) {
        if let Some(f) = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
        {
            apply(f);
        }
    }

    fn emit_phase(&self, evolution_id: EvolutionId, name: &str, phase: DeploymentPhase, traffic_fraction: f64) {
        self.sink.emit(&DeploymentEvent::PhaseStarted {
            evolution_id,
            module: name.to_string(),
            phase,
            traffic_fraction,
        });
    }

    fn emit_completed(&self, evolution_id: EvolutionId, name: &str, phase: DeploymentPhase, tally: SampleTally) {
        self.sink.emit(&DeploymentEvent::PhaseCompleted {
            evolution_id,
            module: name.to_string(),
            phase,
            successes: tally.successes,
            failures: tally.failures,
        });
    }

    fn lock_rollbacks(&self) -> std::sync::MutexGuard<'_, RollbackLog> {
        self.rollbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_violations(&self) -> std::sync::MutexGuard<'_, ViolationLog> {
        self.violations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
