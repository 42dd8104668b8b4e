//! Phase monitoring
//!
//! Samples the metrics probe on a fixed interval for the length of a phase
//! window. Cancellation is checked at every iteration boundary; each probe
//! call is bounded by the sample timeout so a stuck probe cannot stall the
//! deployment.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::violation::{SecurityViolation, Severity, ViolationKind};
use crate::config::{DeploymentConfig, SandboxConfig};
use crate::module::traits::{CollaboratorError, ExecutionEngine, MetricsProbe, PhaseSample, SampleContext};
use crate::utils::with_custom_timeout;

/// Samples taken during one window. A probe error or timeout counts as a
/// failure; so does the sample that raised a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleTally {
    pub successes: u32,
    pub failures: u32,
}

impl SampleTally {
    pub fn samples(&self) -> u32 {
        self.successes + self.failures
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    /// The window elapsed without a violating sample
    Passed(SampleTally),
    Failed {
        violation: SecurityViolation,
        tally: SampleTally,
    },
    Cancelled(SampleTally),
}

impl MonitorOutcome {
    pub fn tally(&self) -> SampleTally {
        match self {
            MonitorOutcome::Passed(tally)
            | MonitorOutcome::Failed { tally, .. }
            | MonitorOutcome::Cancelled(tally) => *tally,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseMonitor {
    interval: Duration,
    sample_timeout: Duration,
    max_regression_ratio: f64,
    max_error_rate: f64,
}

impl PhaseMonitor {
    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self {
            interval: config.sample_interval(),
            sample_timeout: config.sample_timeout(),
            max_regression_ratio: config.max_regression_ratio,
            max_error_rate: config.max_error_rate,
        }
    }

    /// Sample `probe` until `window` elapses. The first sample is taken
    /// immediately, so every window sees at least one.
    pub async fn watch(
        &self,
        probe: &dyn MetricsProbe,
        context: &SampleContext,
        window: Duration,
        cancel: &CancellationToken,
    ) -> MonitorOutcome {
        let deadline = Instant::now() + window;
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tally = SampleTally::default();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Monitoring of {} cancelled", context.module);
                    return MonitorOutcome::Cancelled(tally);
                }
                _ = ticker.tick() => {}
            }

            match with_custom_timeout(probe.sample(context), self.sample_timeout).await {
                Ok(Ok(sample)) => match self.evaluate(context, &sample) {
                    Some(violation) => {
                        tally.failures += 1;
                        return MonitorOutcome::Failed { violation, tally };
                    }
                    None => tally.successes += 1,
                },
                Ok(Err(e)) => {
                    tally.failures += 1;
                    warn!("Metrics probe failed for {}: {}", context.module, e);
                }
                Err(_) => {
                    tally.failures += 1;
                    warn!(
                        "Metrics probe for {} timed out after {}ms",
                        context.module,
                        self.sample_timeout.as_millis()
                    );
                }
            }

            if Instant::now() >= deadline {
                return MonitorOutcome::Passed(tally);
            }
        }
    }

    /// Violation raised by one sample, if any
    pub fn evaluate(&self, context: &SampleContext, sample: &PhaseSample) -> Option<SecurityViolation> {
        let violation = |kind, description: String| {
            Some(
                SecurityViolation::new(kind, Severity::Critical, context.module.as_str(), description)
                    .for_evolution(context.evolution_id),
            )
        };

        if let Some(reported) = &sample.critical_violation {
            return violation(ViolationKind::Reported, reported.clone());
        }
        if let Some(ratio) = sample.regression_ratio() {
            if ratio > self.max_regression_ratio {
                return violation(
                    ViolationKind::PerformanceRegression,
                    format!(
                        "execution time {:.2}x baseline at {:.0}% traffic, limit {:.2}x",
                        ratio,
                        context.traffic_fraction * 100.0,
                        self.max_regression_ratio
                    ),
                );
            }
        }
        let error_rate = sample.error_rate();
        if error_rate > self.max_error_rate {
            return violation(
                ViolationKind::ErrorRate,
                format!("error rate {:.3}, limit {:.3}", error_rate, self.max_error_rate),
            );
        }
        None
    }
}

/// Probe that measures by executing both versions through the engine
pub struct EngineProbe {
    engine: Arc<dyn ExecutionEngine>,
    limits: SandboxConfig,
}

impl EngineProbe {
    pub fn new(engine: Arc<dyn ExecutionEngine>, limits: SandboxConfig) -> Self {
        Self { engine, limits }
    }
}

#[async_trait]
impl MetricsProbe for EngineProbe {
    async fn sample(&self, context: &SampleContext) -> Result<PhaseSample, CollaboratorError> {
        let baseline_time = match &context.active {
            Some(active) => self
                .engine
                .execute(&context.module, active.clone(), &self.limits)
                .await
                .map(|m| m.wall_time)
                .unwrap_or_default(),
            None => Duration::ZERO,
        };

        let mut sample = PhaseSample {
            baseline_time,
            requests: 1,
            ..PhaseSample::default()
        };
        match self
            .engine
            .execute(&context.module, context.candidate.clone(), &self.limits)
            .await
        {
            Ok(metrics) => sample.candidate_time = metrics.wall_time,
            Err(e) => {
                debug!("Candidate execution of {} failed: {}", context.module, e);
                sample.errors = 1;
            }
        }
        Ok(sample)
    }
}

/// Probe for deployments with no measurement source; every sample is clean
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveProbe;

#[async_trait]
impl MetricsProbe for PassiveProbe {
    async fn sample(&self, _context: &SampleContext) -> Result<PhaseSample, CollaboratorError> {
        Ok(PhaseSample::default())
    }
}
