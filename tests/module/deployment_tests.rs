//! Deployment tests
//!
//! Staged hot swaps: promotion, rollback on violations and regressions,
//! cancellation, and rollback point bookkeeping.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use native_loader::module::deploy::{
    read_backup_views, ChannelEventSink, DeploymentEvent, DeploymentPhase, SecurityViolation, Severity,
    ViolationKind,
};
use native_loader::module::error::{DeployError, LoadError};
use native_loader::module::format::Export;
use native_loader::module::resolver::ModuleVersion;
use native_loader::module::traits::ExecutionMetrics;
use native_loader::module::ModuleManager;

use super::test_utils::*;

/// Fixture with mathlib 1.0.0 loaded and 1.1.0 staged
async fn loaded_mathlib(fixture: &ModuleTestFixture, manager: &ModuleManager) -> std::path::PathBuf {
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    manager.load("mathlib").await.unwrap();
    fixture.stage_module(
        "mathlib-1.1.0.native",
        &TestModule::new("mathlib", "1.1.0").export(Export::function("mul", 0x20, 4)),
    )
}

fn active_version(manager: &ModuleManager, name: &str) -> ModuleVersion {
    manager.registry().view(name).unwrap().version
}

#[tokio::test]
async fn test_hot_swap_promotes_candidate() {
    let fixture = ModuleTestFixture::new().unwrap();
    let (sink, mut events) = ChannelEventSink::new();
    let manager = fixture.builder().sink(Arc::new(sink)).build().unwrap();
    let candidate = loaded_mathlib(&fixture, &manager).await;
    let handle = manager.registry().find("mathlib").unwrap();
    let before = manager.get_symbol(&handle, "add").unwrap();

    let evolution_id = manager.hot_swap_tracked("mathlib", &candidate).await.unwrap();

    let view = manager.registry().view("mathlib").unwrap();
    assert_eq!(view.version, ModuleVersion::new(1, 1, 0));
    assert_eq!(view.reference_count, 1);
    assert_eq!(view.source_path, Some(candidate.clone()));

    // The old handle follows the module to its new image
    let after = manager.get_symbol(&handle, "add").unwrap();
    assert_ne!(after, before);
    assert_eq!(after, view.code_base.unwrap().offset(0x10));
    assert!(manager.get_symbol(&handle, "mul").is_some());

    let stats = manager.stats();
    assert_eq!(stats.deployment.started, 1);
    assert_eq!(stats.deployment.succeeded, 1);
    assert_eq!(stats.loader.hot_swaps, 1);
    assert!(manager.deployments().deployment("mathlib").is_none());

    let mut phases = Vec::new();
    let mut passed = Vec::new();
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.evolution_id(), Some(evolution_id));
        match event {
            DeploymentEvent::PhaseStarted { phase, .. } => phases.push(phase),
            DeploymentEvent::PhaseCompleted {
                phase,
                successes,
                failures,
                ..
            } => {
                assert!(successes >= 1);
                assert_eq!(failures, 0);
                passed.push(phase);
            }
            DeploymentEvent::Completed { version, .. } => completed = Some(version),
            _ => {}
        }
    }
    assert_eq!(
        phases,
        vec![
            DeploymentPhase::Sandbox,
            DeploymentPhase::Canary,
            DeploymentPhase::Gradual,
            DeploymentPhase::Gradual,
            DeploymentPhase::Gradual,
            DeploymentPhase::Full,
        ]
    );
    // No engine, so no sandbox run to report
    assert_eq!(
        passed,
        vec![
            DeploymentPhase::Canary,
            DeploymentPhase::Gradual,
            DeploymentPhase::Gradual,
            DeploymentPhase::Gradual,
        ]
    );
    assert_eq!(completed, Some(ModuleVersion::new(1, 1, 0)));
}

#[tokio::test]
async fn test_regression_rolls_back_at_first_gradual_step() {
    let fixture = ModuleTestFixture::new().unwrap();
    let probe = Arc::new(RegressionProbe {
        threshold: 0.10,
        slowdown: 2.5,
    });
    let manager = fixture.builder().probe(probe).build().unwrap();
    let candidate = loaded_mathlib(&fixture, &manager).await;
    let before = manager.list_modules();

    match manager.hot_swap("mathlib", &candidate).await {
        Err(DeployError::RolledBack { phase, reason, .. }) => {
            assert_eq!(phase, DeploymentPhase::Gradual);
            assert!(reason.contains("2.50x baseline"), "{}", reason);
        }
        other => panic!("expected RolledBack, got {:?}", other),
    }

    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));
    assert_eq!(manager.list_modules(), before);
    assert_eq!(manager.stats().deployment.rolled_back, 1);

    let violations = manager.deployments().violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, ViolationKind::PerformanceRegression);
    assert_eq!(violations[0].severity, Severity::Critical);
}

#[tokio::test]
async fn test_canary_violation_restores_registry() {
    let fixture = ModuleTestFixture::new().unwrap();
    let probe = Arc::new(ViolationProbe {
        phase: DeploymentPhase::Canary,
    });
    let manager = fixture.builder().probe(probe).build().unwrap();
    let candidate = loaded_mathlib(&fixture, &manager).await;
    let before = manager.list_modules();

    let result = manager.hot_swap_tracked("mathlib", &candidate).await;
    let evolution_id = match result {
        Err(DeployError::RolledBack {
            evolution_id, phase, ..
        }) => {
            assert_eq!(phase, DeploymentPhase::Canary);
            evolution_id
        }
        other => panic!("expected RolledBack, got {:?}", other),
    };

    assert_eq!(manager.list_modules(), before);
    let violations = manager.deployments().violations_for(evolution_id);
    assert_eq!(violations.len(), 1);
    assert!(violations[0].is_critical());

    // The point was consumed by the rollback
    let points = manager.deployments().rollback_points();
    assert_eq!(points.len(), 1);
    assert!(!points[0].valid);
}

#[tokio::test]
async fn test_sandbox_violation_rolls_back() {
    let fixture = ModuleTestFixture::new().unwrap();
    let engine = RecordingEngine::new();
    let manager = fixture.builder().engine(engine.clone()).build().unwrap();
    let candidate = loaded_mathlib(&fixture, &manager).await;

    engine.set_metrics(ExecutionMetrics {
        wall_time: Duration::from_millis(1),
        syscalls: 3,
        ..Default::default()
    });

    match manager.hot_swap("mathlib", &candidate).await {
        Err(DeployError::RolledBack { phase, .. }) => assert_eq!(phase, DeploymentPhase::Sandbox),
        other => panic!("expected RolledBack, got {:?}", other),
    }
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));
    assert_eq!(manager.stats().deployment.sandbox_runs, 1);
    assert!(manager
        .deployments()
        .violations()
        .iter()
        .any(|v| v.kind == ViolationKind::UnauthorizedSyscall));
}

#[tokio::test]
async fn test_sandbox_pass_with_engine() {
    let fixture = ModuleTestFixture::new().unwrap();
    let engine = RecordingEngine::new();
    let manager = fixture.builder().engine(engine.clone()).build().unwrap();
    let candidate = loaded_mathlib(&fixture, &manager).await;

    manager.hot_swap("mathlib", &candidate).await.unwrap();
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 1, 0));
    assert_eq!(manager.stats().deployment.sandbox_runs, 1);
    // Initialized once at load and once as a candidate
    assert_eq!(engine.initialized(), vec!["mathlib".to_string(), "mathlib".to_string()]);
}

#[tokio::test]
async fn test_cancelled_deployment() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();
    let candidate = loaded_mathlib(&fixture, &manager).await;
    let before = manager.list_modules();

    let token = CancellationToken::new();
    token.cancel();
    let result = manager
        .deployments()
        .hot_swap_with_cancel("mathlib", &candidate, token)
        .await;

    assert!(matches!(result, Err(DeployError::Cancelled(_))));
    assert_eq!(manager.list_modules(), before);
}

#[tokio::test]
async fn test_in_flight_deployment_guards_and_routing() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.deployment.canary_window_ms = 10_000;
    fixture.config.deployment.canary_fraction = 0.5;
    let manager = fixture.manager();
    let candidate = loaded_mathlib(&fixture, &manager).await;
    let active = manager.get_symbol_by_name("mathlib", "add").unwrap();

    let running = manager.hot_swap("mathlib", &candidate);
    let observer = async {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = manager.hot_swap("mathlib", &candidate).await;
        assert!(matches!(second, Err(DeployError::InProgress(_))));

        let state = manager.deployments().deployment("mathlib").unwrap();
        assert_eq!(state.phase, DeploymentPhase::Canary);
        assert_eq!(state.traffic_fraction, 0.5);

        // Half the requests reach the candidate; the registry is untouched
        let routed: Vec<_> = (0..4)
            .map(|_| manager.deployments().resolve_routed("mathlib", "add").unwrap())
            .collect();
        assert_eq!(routed.iter().filter(|a| **a == active).count(), 2);
        assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));

        manager.deployments().rollback(state.evolution_id).unwrap();
    };

    let (result, ()) = tokio::join!(running, observer);
    assert!(matches!(result, Err(DeployError::Cancelled(_))));
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));
    assert!(manager.deployments().deployment("mathlib").is_none());
    assert_eq!(manager.deployments().resolve_routed("mathlib", "add"), Some(active));
}

#[tokio::test]
async fn test_reported_critical_violation_rolls_back() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.deployment.canary_window_ms = 10_000;
    let manager = fixture.manager();
    let candidate = loaded_mathlib(&fixture, &manager).await;

    let running = manager.hot_swap("mathlib", &candidate);
    let reporter = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = manager.deployments().deployment("mathlib").unwrap();
        manager.deployments().report_violation(
            SecurityViolation::new(
                ViolationKind::UnauthorizedNetworkAccess,
                Severity::Critical,
                "mathlib",
                "connection to 203.0.113.7:443",
            )
            .for_evolution(state.evolution_id),
        );
    };

    let (result, ()) = tokio::join!(running, reporter);
    match result {
        Err(DeployError::RolledBack { phase, reason, .. }) => {
            assert_eq!(phase, DeploymentPhase::Canary);
            assert!(reason.contains("203.0.113.7"), "{}", reason);
        }
        other => panic!("expected RolledBack, got {:?}", other),
    }
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));
}

#[tokio::test]
async fn test_incompatible_candidates_are_refused() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();
    loaded_mathlib(&fixture, &manager).await;
    let before = manager.list_modules();

    let abi_break = fixture.stage_module("abi.native", &TestModule::new("mathlib", "2.0.0").abi(2));
    let dropped_export = fixture.stage_module("drop.native", &TestModule::new("mathlib", "1.2.0").without_exports());
    let renamed = fixture.stage_module("renamed.native", &TestModule::new("strlib", "1.0.0"));

    for path in [abi_break, dropped_export, renamed] {
        let result = manager.hot_swap("mathlib", &path).await;
        assert!(
            matches!(result, Err(DeployError::Load(LoadError::ValidationFailed(_)))),
            "{}: {:?}",
            path.display(),
            result
        );
        assert_eq!(manager.list_modules(), before);
    }
    assert_eq!(manager.stats().deployment.succeeded, 0);
}

#[tokio::test]
async fn test_api_version_only_moves_forward() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0").api(3));
    manager.load("mathlib").await.unwrap();

    let older = fixture.stage_module("older.native", &TestModule::new("mathlib", "1.1.0").api(2));
    match manager.hot_swap("mathlib", &older).await {
        Err(DeployError::Load(LoadError::ValidationFailed(reason))) => {
            assert!(reason.contains("lowers API version 3 -> 2"), "{}", reason);
        }
        other => panic!("expected ValidationFailed, got {:?}", other),
    }
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));

    let newer = fixture.stage_module("newer.native", &TestModule::new("mathlib", "1.2.0").api(4));
    manager.hot_swap("mathlib", &newer).await.unwrap();
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 2, 0));
    assert_eq!(manager.registry().view("mathlib").unwrap().api_version, 4);
}

#[tokio::test]
async fn test_hot_swap_unknown_module() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();
    let candidate = fixture.stage_module("ghost.native", &TestModule::new("ghost", "1.0.0"));

    let result = manager.hot_swap("ghost", &candidate).await;
    assert!(matches!(result, Err(DeployError::Load(LoadError::NotFound(_)))));
}

#[tokio::test]
async fn test_hot_swap_disabled() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.loader.hot_swap_overrides.insert("mathlib".to_string(), false);
    let manager = fixture.manager();
    let candidate = loaded_mathlib(&fixture, &manager).await;

    let result = manager.hot_swap("mathlib", &candidate).await;
    assert!(matches!(result, Err(DeployError::Disabled(name)) if name == "mathlib"));
    assert_eq!(manager.stats().deployment.started, 0);
}

#[tokio::test]
async fn test_completed_deployment_cannot_be_rolled_back() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();

    fixture.write_module(&TestModule::new("strlib", "1.0.0"));
    manager.load("strlib").await.unwrap();
    let math_next = loaded_mathlib(&fixture, &manager).await;
    let str_next = fixture.stage_module("strlib-1.1.0.native", &TestModule::new("strlib", "1.1.0"));

    let strlib_swap = manager.hot_swap_tracked("strlib", &str_next).await.unwrap();
    let points = manager.deployments().rollback_points();
    assert_eq!(points.len(), 1);
    assert!(!points[0].valid);

    // Later changes by other callers
    manager.hot_swap("mathlib", &math_next).await.unwrap();
    fixture.write_module(&TestModule::new("extra", "1.0.0"));
    let extra = manager.load("extra").await.unwrap();

    let result = manager.deployments().rollback(strlib_swap);
    assert!(matches!(result, Err(DeployError::Fatal(_))), "{:?}", result);

    assert_eq!(active_version(&manager, "strlib"), ModuleVersion::new(1, 1, 0));
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 1, 0));
    assert!(manager.get_symbol(&extra, "add").is_some());
    assert_eq!(manager.stats().deployment.rolled_back, 0);
}

#[tokio::test]
async fn test_evicted_point_is_fatal() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.deployment.rollback_capacity = 1;
    fixture.config.deployment.canary_window_ms = 10_000;
    let (sink, mut events) = ChannelEventSink::new();
    let manager = fixture.builder().sink(Arc::new(sink)).build().unwrap();

    fixture.write_module(&TestModule::new("strlib", "1.0.0"));
    manager.load("strlib").await.unwrap();
    let math_next = loaded_mathlib(&fixture, &manager).await;
    let str_next = fixture.stage_module("strlib-1.1.0.native", &TestModule::new("strlib", "1.1.0"));

    let math_swap = manager.hot_swap("mathlib", &math_next);
    let str_swap = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.hot_swap("strlib", &str_next).await
    };
    let control = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let first = manager.deployments().deployment("mathlib").unwrap().evolution_id;
        let second = manager.deployments().deployment("strlib").unwrap().evolution_id;

        // The strlib deployment's point evicted the mathlib one
        let points = manager.deployments().rollback_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].evolution_id, second);

        manager.deployments().rollback(first).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.deployments().rollback(second).unwrap();
        first
    };

    let (math_result, str_result, first) = tokio::join!(math_swap, str_swap, control);
    assert!(matches!(math_result, Err(DeployError::Fatal(_))), "{:?}", math_result);
    assert!(matches!(str_result, Err(DeployError::Cancelled(_))), "{:?}", str_result);

    // The mathlib candidate was never committed
    assert_eq!(active_version(&manager, "mathlib"), ModuleVersion::new(1, 0, 0));
    assert_eq!(active_version(&manager, "strlib"), ModuleVersion::new(1, 0, 0));
    assert_eq!(manager.stats().deployment.fatal, 1);

    let mut failed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let DeploymentEvent::RollbackFailed { evolution_id, .. } = event {
            failed.push(evolution_id);
        }
    }
    assert_eq!(failed, vec![first]);
}

#[tokio::test]
async fn test_rollback_point_backup() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    let backup_dir = fixture.temp_dir.path().join("backups");
    fixture.config.deployment.backup_dir = Some(backup_dir.clone());
    let manager = fixture.manager();
    let candidate = loaded_mathlib(&fixture, &manager).await;

    let evolution_id = manager.hot_swap_tracked("mathlib", &candidate).await.unwrap();

    let points = manager.deployments().rollback_points();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].evolution_id, evolution_id);
    assert!(!points[0].valid);
    assert_eq!(points[0].modules, 1);
    let location = points[0].backup_location.clone().unwrap();
    assert!(location.starts_with(&backup_dir));
    assert!(location.join("mathlib.native").is_file());

    let views = read_backup_views(&location).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].name, "mathlib");
    assert_eq!(views[0].version, ModuleVersion::new(1, 0, 0));
}
