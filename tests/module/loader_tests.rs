//! Loader tests
//!
//! Loading, symbol lookup, dependency closures, unloading and garbage
//! collection through the module manager.

use std::sync::Arc;

use native_loader::module::error::{DependencyError, FormatError, LoadError, ResourceError, UnloadError};
use native_loader::module::format::{Architecture, HEADER_SIZE};
use native_loader::module::resolver::{DependencySpec, VersionConstraint};
use native_loader::module::ModuleState;

use super::test_utils::*;

#[tokio::test]
async fn test_load_lookup_unload() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let manager = fixture.manager();

    let handle = manager.load("mathlib").await.unwrap();
    let view = manager.registry().view("mathlib").unwrap();
    assert_eq!(view.state, ModuleState::Ready);
    assert_eq!(view.reference_count, 1);
    assert_eq!(view.id, handle.id);

    let base = view.code_base.unwrap();
    assert_eq!(manager.get_symbol(&handle, "add"), Some(base.offset(0x10)));
    assert_eq!(manager.get_symbol(&handle, "sub"), None);

    manager.unload("mathlib").unwrap();
    assert_eq!(manager.module_state("mathlib"), None);
    assert_eq!(manager.get_symbol(&handle, "add"), None);
    assert!(matches!(manager.unload("mathlib"), Err(UnloadError::NotLoaded(_))));
}

#[tokio::test]
async fn test_load_unknown_module() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();

    let result = manager.load("ghost").await;
    assert!(matches!(result, Err(LoadError::NotFound(name)) if name == "ghost"));
    assert_eq!(manager.stats().loader.failed_loads, 1);
}

#[tokio::test]
async fn test_concurrent_loads_share_one_decode() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let manager = fixture.manager();

    let (first, second) = tokio::join!(manager.load("mathlib"), manager.load("mathlib"));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);

    let view = manager.registry().view("mathlib").unwrap();
    assert_eq!(view.reference_count, 2);
    assert_eq!(manager.stats().loader.decodes, 1);

    // Both references must go before the module does
    manager.unload("mathlib").unwrap();
    assert_eq!(manager.module_state("mathlib"), Some(ModuleState::Ready));
    manager.unload("mathlib").unwrap();
    assert_eq!(manager.module_state("mathlib"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_survives_concurrent_teardown() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let manager = Arc::new(fixture.manager());

    // Each task's unload can tear the module down between another task's
    // readiness check and its reference
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    let handle = manager.load("mathlib").await?;
                    assert_eq!(handle.name, "mathlib");
                    manager.unload("mathlib").map_err(|e| LoadError::ValidationFailed(e.to_string()))?;
                }
                Ok::<_, LoadError>(())
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(manager.module_state("mathlib"), None);
    assert_eq!(manager.stats().loader.loads, 200);
}

#[tokio::test]
async fn test_repeat_load_reuses_record() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let manager = fixture.manager();

    manager.load("mathlib").await.unwrap();
    let before = manager.registry().view("mathlib").unwrap();
    manager.load("mathlib").await.unwrap();
    let after = manager.registry().view("mathlib").unwrap();

    assert_eq!(after.reference_count, 2);
    assert_eq!(after.load_time, before.load_time);
    assert_eq!(after.code_base, before.code_base);
    assert_eq!(manager.stats().loader.decodes, 1);
}

#[tokio::test]
async fn test_reference_limit() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.loader.max_reference_count = 2;
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let manager = fixture.manager();

    manager.load("mathlib").await.unwrap();
    manager.load("mathlib").await.unwrap();
    let third = manager.load("mathlib").await;
    assert!(matches!(
        third,
        Err(LoadError::Resource(ResourceError::ReferenceLimit { limit: 2, .. }))
    ));
    assert_eq!(manager.registry().view("mathlib").unwrap().reference_count, 2);
}

#[tokio::test]
async fn test_dependency_closure_loads_in_order() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("c", "1.0.0"));
    fixture.write_module(
        &TestModule::new("b", "1.2.0").depends_on(DependencySpec::required("c", VersionConstraint::any())),
    );
    fixture.write_module(
        &TestModule::new("a", "1.0.0")
            .depends_on(DependencySpec::required("b", VersionConstraint::parse("^1.0.0").unwrap())),
    );
    let manager = fixture.manager();

    manager.load("a").await.unwrap();

    let names: Vec<String> = manager.list_modules().into_iter().map(|v| v.name).collect();
    assert_eq!(names, vec!["c", "b", "a"]);
    for view in manager.list_modules() {
        assert_eq!(view.state, ModuleState::Ready, "{}", view.name);
        assert_eq!(view.reference_count, 1, "{}", view.name);
    }
}

#[tokio::test]
async fn test_missing_dependency_loads_nothing() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(
        &TestModule::new("b", "1.0.0").depends_on(DependencySpec::required("missing", VersionConstraint::any())),
    );
    fixture.write_module(
        &TestModule::new("a", "1.0.0").depends_on(DependencySpec::required("b", VersionConstraint::any())),
    );
    let manager = fixture.manager();

    match manager.load("a").await {
        Err(LoadError::DependencyUnsatisfied { missing, conflicting }) => {
            assert_eq!(missing, vec!["missing".to_string()]);
            assert!(conflicting.is_empty());
        }
        other => panic!("expected DependencyUnsatisfied, got {:?}", other),
    }
    assert!(manager.registry().is_empty());
    assert_eq!(manager.stats().loader.decodes, 0);
}

#[tokio::test]
async fn test_version_conflict_loads_nothing() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("b", "1.0.0"));
    fixture.write_module(
        &TestModule::new("a", "1.0.0")
            .depends_on(DependencySpec::required("b", VersionConstraint::parse(">=2.0.0").unwrap())),
    );
    let manager = fixture.manager();

    match manager.load("a").await {
        Err(LoadError::DependencyUnsatisfied { missing, conflicting }) => {
            assert!(missing.is_empty());
            assert_eq!(conflicting.len(), 1);
            assert!(conflicting[0].starts_with("a requires b"), "{}", conflicting[0]);
        }
        other => panic!("expected DependencyUnsatisfied, got {:?}", other),
    }
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_corrupt_dependency_loads_nothing() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_raw("b", b"definitely not a native module");
    fixture.write_module(
        &TestModule::new("a", "1.0.0").depends_on(DependencySpec::required("b", VersionConstraint::any())),
    );
    let manager = fixture.manager();

    let result = manager.load("a").await;
    assert!(matches!(result, Err(LoadError::Format { module, .. }) if module == "b"));
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_failed_init_hook_loads_nothing() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("b", "1.0.0"));
    fixture.write_module(
        &TestModule::new("a", "1.0.0").depends_on(DependencySpec::required("b", VersionConstraint::any())),
    );
    let engine = RecordingEngine::failing("a");
    let manager = fixture.builder().engine(engine.clone()).build().unwrap();

    let result = manager.load("a").await;
    assert!(matches!(result, Err(LoadError::ValidationFailed(_))));
    assert!(manager.registry().is_empty());
    assert_eq!(engine.initialized(), vec!["b".to_string()]);
}

#[tokio::test]
async fn test_platform_mismatch() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("armlib", "1.0.0").architecture(Architecture::Arm64));
    let manager = fixture.manager();

    let result = manager.load("armlib").await;
    assert!(matches!(
        result,
        Err(LoadError::Dependency(DependencyError::PlatformIncompatible { .. }))
    ));
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_security_level_floor() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.loader.minimum_security_level = 2;
    fixture.write_module(&TestModule::new("weak", "1.0.0").security_level(1));
    fixture.write_module(&TestModule::new("strong", "1.0.0").security_level(3));
    let manager = fixture.manager();

    assert!(matches!(manager.load("weak").await, Err(LoadError::ValidationFailed(_))));
    assert!(manager.load("strong").await.is_ok());
}

#[tokio::test]
async fn test_unload_cascades_to_dependencies() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("b", "1.0.0"));
    fixture.write_module(
        &TestModule::new("a", "1.0.0").depends_on(DependencySpec::required("b", VersionConstraint::any())),
    );
    let manager = fixture.manager();
    manager.load("a").await.unwrap();

    // The only reference on b belongs to a
    match manager.unload("b") {
        Err(UnloadError::HasDependents { module, dependents }) => {
            assert_eq!(module, "b");
            assert_eq!(dependents, vec!["a".to_string()]);
        }
        other => panic!("expected HasDependents, got {:?}", other),
    }
    assert_eq!(manager.registry().view("b").unwrap().reference_count, 1);

    manager.unload("a").unwrap();
    assert!(manager.registry().is_empty());
    assert_eq!(manager.stats().loader.unloads, 2);
}

#[tokio::test]
async fn test_explicit_reference_on_dependency() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("b", "1.0.0"));
    fixture.write_module(
        &TestModule::new("a", "1.0.0").depends_on(DependencySpec::required("b", VersionConstraint::any())),
    );
    let manager = fixture.manager();
    manager.load("a").await.unwrap();
    manager.load("b").await.unwrap();
    assert_eq!(manager.registry().view("b").unwrap().reference_count, 2);

    // Dropping the caller's reference leaves the one a holds
    manager.unload("b").unwrap();
    assert_eq!(manager.registry().view("b").unwrap().reference_count, 1);

    manager.unload("a").unwrap();
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_load_from_path() {
    let fixture = ModuleTestFixture::new().unwrap();
    let module = TestModule::new("mathlib", "1.0.0");
    let first = fixture.stage_module("mathlib-a.native", &module);
    let second = fixture.stage_module("mathlib-b.native", &module);
    let manager = fixture.manager();

    manager.load_from_path("mathlib", &first).await.unwrap();
    assert_eq!(manager.registry().view("mathlib").unwrap().source_path, Some(first.clone()));

    manager.load_from_path("mathlib", &first).await.unwrap();
    assert_eq!(manager.registry().view("mathlib").unwrap().reference_count, 2);

    let result = manager.load_from_path("mathlib", &second).await;
    assert!(matches!(result, Err(LoadError::AlreadyLoaded(_))));

    let result = manager.load_from_path("other", fixture.staging_dir.join("nope.native")).await;
    assert!(matches!(result, Err(LoadError::NotFound(_))));
}

#[tokio::test]
async fn test_lazy_loading_decodes_on_first_lookup() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.loader.lazy_loading = true;
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let manager = fixture.manager();

    let handle = manager.load("mathlib").await.unwrap();
    let view = manager.registry().view("mathlib").unwrap();
    assert_eq!(view.state, ModuleState::Ready);
    assert_eq!(view.code_base, None);
    assert_eq!(manager.stats().loader.decodes, 0);

    let address = manager.get_symbol(&handle, "add").unwrap();
    assert_eq!(manager.stats().loader.decodes, 1);
    let base = manager.registry().view("mathlib").unwrap().code_base.unwrap();
    assert_eq!(address, base.offset(0x10));

    assert_eq!(manager.get_symbol(&handle, "add"), Some(address));
    assert_eq!(manager.stats().loader.decodes, 1);
}

#[tokio::test]
async fn test_lazy_loading_rejects_corrupt_dependency() {
    let mut fixture = ModuleTestFixture::new().unwrap();
    fixture.config.loader.lazy_loading = true;
    let mut bytes = TestModule::new("mathlib", "1.0.0").encode();
    bytes[HEADER_SIZE] ^= 0x01;
    fixture.write_raw("mathlib", &bytes);
    fixture.write_module(
        &TestModule::new("app", "1.0.0").depends_on(DependencySpec::required("mathlib", VersionConstraint::any())),
    );
    let manager = fixture.manager();

    let result = manager.load("app").await;
    assert!(
        matches!(
            &result,
            Err(LoadError::Format {
                module,
                source: FormatError::ChecksumMismatch { .. },
            }) if module == "mathlib"
        ),
        "{:?}",
        result
    );
    assert!(manager.registry().is_empty());
    assert_eq!(manager.module_state("mathlib"), None);
    assert_eq!(manager.stats().loader.decodes, 0);
}

#[tokio::test]
async fn test_preload_then_load_promotes() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    let engine = RecordingEngine::new();
    let manager = fixture.builder().engine(engine.clone()).build().unwrap();

    manager.preload("mathlib").await.unwrap();
    let view = manager.registry().view("mathlib").unwrap();
    assert_eq!(view.state, ModuleState::Loaded);
    assert_eq!(view.reference_count, 0);
    assert!(engine.initialized().is_empty());
    assert!(manager.get_symbol_by_name("mathlib", "add").is_some());

    assert!(matches!(manager.preload("mathlib").await, Err(LoadError::AlreadyLoaded(_))));

    manager.load("mathlib").await.unwrap();
    let view = manager.registry().view("mathlib").unwrap();
    assert_eq!(view.state, ModuleState::Ready);
    assert_eq!(view.reference_count, 1);
    assert_eq!(engine.initialized(), vec!["mathlib".to_string()]);
    assert_eq!(manager.stats().loader.decodes, 1);
}

#[tokio::test]
async fn test_collect_garbage_removes_idle_modules() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("used", "1.0.0"));
    fixture.write_module(&TestModule::new("idle", "1.0.0"));
    let manager = fixture.manager();

    manager.load("used").await.unwrap();
    manager.preload("idle").await.unwrap();

    let collected = manager.collect_garbage();
    assert_eq!(collected, vec!["idle".to_string()]);
    assert_eq!(manager.module_state("used"), Some(ModuleState::Ready));
    assert_eq!(manager.module_state("idle"), None);
    assert!(manager.collect_garbage().is_empty());
}

#[tokio::test]
async fn test_runtime_dependencies_resolve_in_order() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();

    manager.register_dependency("a", DependencySpec::required("b", VersionConstraint::any()));
    manager.register_dependency("b", DependencySpec::required("c", VersionConstraint::any()));

    let order = manager.resolve_load_order(&["a".to_string()]).unwrap();
    assert_eq!(order, vec!["c", "b", "a"]);
}

#[tokio::test]
async fn test_runtime_dependency_cycle() {
    let fixture = ModuleTestFixture::new().unwrap();
    let manager = fixture.manager();

    manager.register_dependency("a", DependencySpec::required("b", VersionConstraint::any()));
    manager.register_dependency("b", DependencySpec::required("a", VersionConstraint::any()));

    match manager.resolve_load_order(&["a".to_string()]) {
        Err(DependencyError::Circular { members }) => {
            assert!(members.contains(&"a".to_string()));
            assert!(members.contains(&"b".to_string()));
        }
        other => panic!("expected Circular, got {:?}", other),
    }
}

#[tokio::test]
async fn test_shutdown_clears_everything() {
    let fixture = ModuleTestFixture::new().unwrap();
    fixture.write_module(&TestModule::new("mathlib", "1.0.0"));
    fixture.write_module(&TestModule::new("strlib", "1.0.0"));
    let manager = fixture.manager();

    let handle = manager.load("mathlib").await.unwrap();
    manager.load("strlib").await.unwrap();
    assert!(manager.get_symbol(&handle, "add").is_some());

    let removed = manager.shutdown();
    assert_eq!(removed.len(), 2);
    assert!(manager.registry().is_empty());
    assert_eq!(manager.get_symbol(&handle, "add"), None);
}
