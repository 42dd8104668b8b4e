//! Module registry
//!
//! The registry is the single owner of every [`ModuleRecord`]. Other
//! components hold [`RecordHandle`]s and look records up for the duration of
//! one call. Reads take a shared lock and never block each other; every
//! mutation goes through a [`RegistryTxn`], which holds the exclusive lock so
//! that multi-record changes (a load committing its dependency closure, a
//! hot swap, a snapshot restore) are observed all at once or not at all.
//!
//! Observers are notified while the transaction still holds the lock, so an
//! invalidation always lands before any reader can see the new state.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::record::{ModuleRecord, ModuleState, RecordHandle, RecordView};
use super::snapshot::RegistrySnapshot;
use crate::module::cache::pool::Address;
use crate::module::error::{LoadError, ResourceError, StateError};
use crate::module::format::ModuleId;
use crate::module::image::ImageSlot;
use crate::module::resolver::{DependencyKind, DependencySpec, GraphNode};

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered {
        name: String,
        id: ModuleId,
    },
    StateChanged {
        name: String,
        from: ModuleState,
        to: ModuleState,
    },
    Replaced {
        name: String,
        previous: ModuleId,
        current: ModuleId,
    },
    Removed {
        name: String,
        id: ModuleId,
    },
    /// Whole table replaced from a snapshot
    Restored,
}

impl RegistryEvent {
    pub fn module(&self) -> Option<&str> {
        match self {
            RegistryEvent::Registered { name, .. }
            | RegistryEvent::StateChanged { name, .. }
            | RegistryEvent::Replaced { name, .. }
            | RegistryEvent::Removed { name, .. } => Some(name),
            RegistryEvent::Restored => None,
        }
    }
}

/// Synchronous registry listener.
///
/// Called with the registry write lock held: implementations must not call
/// back into the registry.
pub trait RegistryObserver: Send + Sync {
    fn on_event(&self, event: &RegistryEvent);
}

#[derive(Debug, Clone, Default)]
pub(crate) struct RegistryInner {
    records: HashMap<String, ModuleRecord>,
    ids: HashMap<ModuleId, String>,
    /// Dependencies declared at runtime, in addition to module metadata
    extra: HashMap<String, Vec<DependencySpec>>,
    next_seq: u64,
}

impl RegistryInner {
    fn ordered(&self) -> Vec<&ModuleRecord> {
        let mut records: Vec<&ModuleRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    fn declared(&self, name: &str) -> Option<Vec<DependencySpec>> {
        let extra = self.extra.get(name);
        let record = self.records.get(name);
        if record.is_none() && extra.is_none() {
            return None;
        }
        let mut deps: Vec<DependencySpec> = record
            .map(|r| r.metadata.dependencies.clone())
            .unwrap_or_default();
        deps.extend(extra.into_iter().flatten().cloned());
        Some(deps)
    }

    fn dependents_of(&self, name: &str) -> Vec<String> {
        self.ordered()
            .into_iter()
            .filter(|r| r.metadata.name != name)
            .filter(|r| {
                r.held.iter().any(|h| h == name)
                    || self.declared(&r.metadata.name).is_some_and(|deps| {
                        deps.iter()
                            .any(|d| d.target == name && d.kind == DependencyKind::Required)
                    })
            })
            .map(|r| r.metadata.name.clone())
            .collect()
    }

    pub(crate) fn views(&self) -> Vec<RecordView> {
        self.ordered().into_iter().map(ModuleRecord::view).collect()
    }

    pub(crate) fn view(&self, name: &str) -> Option<RecordView> {
        self.records.get(name).map(ModuleRecord::view)
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

/// Table of module records
pub struct ModuleRegistry {
    inner: RwLock<RegistryInner>,
    observers: RwLock<Vec<Arc<dyn RegistryObserver>>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.len())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            observers: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Begin an exclusive transaction
    pub fn write(&self) -> RegistryTxn<'_> {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        RegistryTxn {
            guard: self.inner.write().unwrap_or_else(PoisonError::into_inner),
            observers,
            events: Vec::new(),
        }
    }

    pub fn register(&self, record: ModuleRecord) -> Result<RecordHandle, StateError> {
        self.write().register(record)
    }

    pub fn find(&self, name: &str) -> Option<RecordHandle> {
        self.read().records.get(name).map(ModuleRecord::handle)
    }

    pub fn find_by_id(&self, id: &ModuleId) -> Option<RecordHandle> {
        let inner = self.read();
        let name = inner.ids.get(id)?;
        inner.records.get(name).map(ModuleRecord::handle)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().records.contains_key(name)
    }

    pub fn state(&self, name: &str) -> Option<ModuleState> {
        self.read().records.get(name).map(|r| r.state)
    }

    pub fn view(&self, name: &str) -> Option<RecordView> {
        self.read().view(name)
    }

    /// Every record, in registration order
    pub fn views(&self) -> Vec<RecordView> {
        self.read().views()
    }

    pub fn names(&self) -> Vec<String> {
        self.read()
            .ordered()
            .into_iter()
            .map(|r| r.metadata.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against a record under the read lock. `f` must not call back
    /// into the registry.
    pub fn with_record<R>(&self, name: &str, f: impl FnOnce(&ModuleRecord) -> R) -> Option<R> {
        self.read().records.get(name).map(f)
    }

    pub fn transition(&self, handle: &RecordHandle, to: ModuleState) -> Result<(), StateError> {
        let mut txn = self.write();
        if !txn.record(&handle.name).is_some_and(|r| r.id == handle.id) {
            return Err(StateError::NotFound(handle.name.clone()));
        }
        txn.transition(&handle.name, to)
    }

    pub fn acquire(&self, name: &str, limit: u32) -> Result<RecordHandle, LoadError> {
        let mut txn = self.write();
        txn.acquire(name, limit)?;
        txn.record(name)
            .map(ModuleRecord::handle)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))
    }

    pub fn release(&self, name: &str) -> Result<u32, StateError> {
        self.write().release(name)
    }

    /// Registered modules that depend on `name`
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.read().dependents_of(name)
    }

    /// Declare a dependency in addition to those in the module's metadata.
    /// The module need not be registered yet.
    pub fn register_dependency(&self, module: &str, spec: DependencySpec) {
        debug!("Registering dependency {} -> {} {}", module, spec.target, spec.constraint);
        let mut txn = self.write();
        let deps = txn.guard.extra.entry(module.to_string()).or_default();
        if !deps.contains(&spec) {
            deps.push(spec);
        }
    }

    /// Metadata plus runtime dependencies; `None` when nothing is known about `name`
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<DependencySpec>> {
        self.read().declared(name)
    }

    /// Graph input for every registered module, in registration order
    pub fn graph_nodes(&self) -> Vec<GraphNode> {
        let inner = self.read();
        inner
            .ordered()
            .into_iter()
            .map(|r| {
                let deps = inner.declared(&r.metadata.name).unwrap_or_default();
                GraphNode::new(r.metadata.name.clone(), deps)
            })
            .collect()
    }

    pub fn image(&self, name: &str) -> Option<ImageSlot> {
        self.read().records.get(name).map(|r| r.image.clone())
    }

    /// Absolute address of `symbol` in `module`, decoding a lazily loaded
    /// image on first use. A failed deferred decode moves the module to
    /// `Error`.
    pub fn resolve_export(&self, module: &str, symbol: &str) -> Option<Address> {
        let (address, failed) = {
            let inner = self.read();
            let record = inner.records.get(module)?;
            if !record.state.serves_symbols() {
                return None;
            }
            let address = record.image.image().and_then(|image| image.resolve(symbol));
            (address, record.image.failed())
        };
        if failed {
            self.mark_failed(module);
        }
        address
    }

    fn mark_failed(&self, module: &str) {
        let mut txn = self.write();
        let failed = txn
            .record(module)
            .is_some_and(|r| r.image.failed() && r.state.can_transition_to(ModuleState::Error));
        if failed {
            warn!("Module {} image could not be decoded, marking as error", module);
            let _ = txn.transition(module, ModuleState::Error);
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::new(self.read().clone())
    }

    /// Replace the whole table with `snapshot`
    pub fn restore(&self, snapshot: RegistrySnapshot) {
        self.write().restore(snapshot);
    }
}

/// Exclusive registry transaction
pub struct RegistryTxn<'a> {
    guard: RwLockWriteGuard<'a, RegistryInner>,
    observers: Vec<Arc<dyn RegistryObserver>>,
    events: Vec<RegistryEvent>,
}

impl RegistryTxn<'_> {
    pub fn record(&self, name: &str) -> Option<&ModuleRecord> {
        self.guard.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.guard.records.contains_key(name)
    }

    pub fn owner_of(&self, id: &ModuleId) -> Option<&str> {
        self.guard.ids.get(id).map(String::as_str)
    }

    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.guard.dependents_of(name)
    }

    /// References on `name` owned by other records rather than by callers
    pub fn holders_of(&self, name: &str) -> u32 {
        self.guard
            .records
            .values()
            .filter(|r| r.held.iter().any(|h| h == name))
            .count() as u32
    }

    pub fn names(&self) -> Vec<String> {
        self.guard
            .ordered()
            .into_iter()
            .map(|r| r.metadata.name.clone())
            .collect()
    }

    /// Check that `record` could be registered, without registering it
    pub fn check_register(&self, record: &ModuleRecord) -> Result<(), StateError> {
        let name = record.name();
        if self.guard.records.contains_key(name) {
            return Err(StateError::Duplicate(name.to_string()));
        }
        if let Some(existing) = self.guard.ids.get(&record.id) {
            return Err(StateError::IdCollision {
                id: record.id.to_string(),
                existing: existing.clone(),
            });
        }
        Ok(())
    }

    pub fn register(&mut self, mut record: ModuleRecord) -> Result<RecordHandle, StateError> {
        self.check_register(&record)?;
        record.seq = self.guard.next_seq;
        self.guard.next_seq += 1;

        let handle = record.handle();
        debug!("Registered module {} ({})", handle.name, handle.id);
        self.guard.ids.insert(handle.id.clone(), handle.name.clone());
        self.guard.records.insert(handle.name.clone(), record);
        self.events.push(RegistryEvent::Registered {
            name: handle.name.clone(),
            id: handle.id.clone(),
        });
        Ok(handle)
    }

    /// Move a record along the lifecycle. `Unloading -> Unloaded` removes the
    /// record and requires a zero reference count.
    pub fn transition(&mut self, name: &str, to: ModuleState) -> Result<(), StateError> {
        let record = self
            .guard
            .records
            .get_mut(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        let from = record.state;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                module: name.to_string(),
                from,
                to,
            });
        }
        if to == ModuleState::Unloaded && record.reference_count > 0 {
            return Err(StateError::StillReferenced {
                module: name.to_string(),
                count: record.reference_count,
            });
        }

        record.state = to;
        debug!("Module {} state {} -> {}", name, from, to);
        self.events.push(RegistryEvent::StateChanged {
            name: name.to_string(),
            from,
            to,
        });

        if to == ModuleState::Unloaded {
            if let Some(removed) = self.guard.records.remove(name) {
                self.guard.ids.remove(&removed.id);
                self.events.push(RegistryEvent::Removed {
                    name: name.to_string(),
                    id: removed.id,
                });
            }
        }
        Ok(())
    }

    /// Walk a record through several transitions
    pub fn advance(&mut self, name: &str, path: &[ModuleState]) -> Result<(), StateError> {
        for &state in path {
            self.transition(name, state)?;
        }
        Ok(())
    }

    /// Increment the reference count, bounded by `limit`
    pub fn acquire(&mut self, name: &str, limit: u32) -> Result<u32, LoadError> {
        let record = self
            .guard
            .records
            .get_mut(name)
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        if record.reference_count >= limit {
            return Err(ResourceError::ReferenceLimit {
                module: name.to_string(),
                limit,
            }
            .into());
        }
        record.reference_count += 1;
        Ok(record.reference_count)
    }

    pub fn release(&mut self, name: &str) -> Result<u32, StateError> {
        let record = self
            .guard
            .records
            .get_mut(name)
            .ok_or_else(|| StateError::NotFound(name.to_string()))?;
        if record.reference_count == 0 {
            return Err(StateError::NotReferenced(name.to_string()));
        }
        record.reference_count -= 1;
        Ok(record.reference_count)
    }

    /// Swap in a new record under an existing name, keeping the reference
    /// count and registration order. Returns the previous record.
    pub fn replace(&mut self, mut record: ModuleRecord) -> Result<ModuleRecord, StateError> {
        let name = record.name().to_string();
        let (previous_id, reference_count, seq) = match self.guard.records.get(&name) {
            Some(old) => (old.id.clone(), old.reference_count, old.seq),
            None => return Err(StateError::NotFound(name)),
        };
        if let Some(owner) = self.guard.ids.get(&record.id) {
            if *owner != name {
                return Err(StateError::IdCollision {
                    id: record.id.to_string(),
                    existing: owner.clone(),
                });
            }
        }

        record.reference_count = reference_count;
        record.seq = seq;
        let current = record.id.clone();
        self.guard.ids.remove(&previous_id);
        self.guard.ids.insert(current.clone(), name.clone());
        let old = self.guard.records.insert(name.clone(), record);
        debug!("Replaced module {} ({} -> {})", name, previous_id, current);
        self.events.push(RegistryEvent::Replaced {
            name: name.clone(),
            previous: previous_id,
            current,
        });
        old.ok_or(StateError::NotFound(name))
    }

    pub fn restore(&mut self, snapshot: RegistrySnapshot) {
        *self.guard = snapshot.into_inner();
        debug!("Registry restored ({} modules)", self.guard.records.len());
        self.events.push(RegistryEvent::Restored);
    }

    /// Drop every record regardless of state or references
    pub fn clear(&mut self) -> Vec<String> {
        let names = self.names();
        for name in &names {
            if let Some(record) = self.guard.records.remove(name) {
                self.events.push(RegistryEvent::Removed {
                    name: name.clone(),
                    id: record.id,
                });
            }
        }
        self.guard.ids.clear();
        names
    }
}

impl Drop for RegistryTxn<'_> {
    fn drop(&mut self) {
        for event in self.events.drain(..) {
            for observer in &self.observers {
                observer.on_event(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::module::format::{Architecture, ModuleMetadata, ModuleType, NativeModule};
    use crate::module::image::ModuleImage;
    use crate::module::resolver::{ModuleVersion, VersionConstraint};
    use std::sync::Mutex;

    fn record(name: &str, version: &str) -> ModuleRecord {
        let metadata = ModuleMetadata::new(name, ModuleVersion::parse(version).unwrap());
        let module = NativeModule::new(Architecture::X86_64, ModuleType::User).with_code(vec![0; 8]);
        let image = ModuleImage::build(name, &module, PoolConfig::default()).unwrap();
        ModuleRecord::new(metadata, 0, ImageSlot::Resident(Arc::new(image)), None, true)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<RegistryEvent>>);

    impl RegistryObserver for Recorder {
        fn on_event(&self, event: &RegistryEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_register_and_find() {
        let registry = ModuleRegistry::new();
        let handle = registry.register(record("mathlib", "1.0.0")).unwrap();
        assert_eq!(registry.find("mathlib"), Some(handle.clone()));
        assert_eq!(registry.find_by_id(&handle.id), Some(handle));
        assert_eq!(registry.state("mathlib"), Some(ModuleState::Unloaded));
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn test_duplicate_and_id_collision() {
        let registry = ModuleRegistry::new();
        registry.register(record("a", "1.0.0")).unwrap();
        assert_eq!(
            registry.register(record("a", "2.0.0")),
            Err(StateError::Duplicate("a".into()))
        );

        let mut clash = record("b", "1.0.0");
        clash.id = record("a", "1.0.0").id;
        assert!(matches!(
            registry.register(clash),
            Err(StateError::IdCollision { existing, .. }) if existing == "a"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_transition_does_not_mutate() {
        let registry = ModuleRegistry::new();
        let handle = registry.register(record("a", "1.0.0")).unwrap();
        let err = registry.transition(&handle, ModuleState::Ready).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { from: ModuleState::Unloaded, .. }));
        assert_eq!(registry.state("a"), Some(ModuleState::Unloaded));
    }

    #[test]
    fn test_unloaded_removes_only_when_unreferenced() {
        let registry = ModuleRegistry::new();
        registry.register(record("a", "1.0.0")).unwrap();
        let mut txn = registry.write();
        txn.advance("a", &[ModuleState::Loading, ModuleState::Loaded]).unwrap();
        txn.acquire("a", 10).unwrap();
        txn.transition("a", ModuleState::Unloading).unwrap();
        assert!(matches!(
            txn.transition("a", ModuleState::Unloaded),
            Err(StateError::StillReferenced { count: 1, .. })
        ));
        txn.release("a").unwrap();
        txn.transition("a", ModuleState::Unloaded).unwrap();
        drop(txn);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reference_limit() {
        let registry = ModuleRegistry::new();
        registry.register(record("a", "1.0.0")).unwrap();
        registry.acquire("a", 2).unwrap();
        registry.acquire("a", 2).unwrap();
        assert!(matches!(
            registry.acquire("a", 2),
            Err(LoadError::Resource(ResourceError::ReferenceLimit { limit: 2, .. }))
        ));
        assert_eq!(registry.release("a"), Ok(1));
    }

    #[test]
    fn test_dependents_scan() {
        let registry = ModuleRegistry::new();
        registry.register(record("libc", "2.0.0")).unwrap();
        let mut app = record("app", "1.0.0");
        app.metadata
            .dependencies
            .push(DependencySpec::required("libc", VersionConstraint::any()));
        registry.register(app).unwrap();
        registry.register(record("tool", "1.0.0").with_held(vec!["libc".into()])).unwrap();
        assert_eq!(registry.dependents_of("libc"), vec!["app".to_string(), "tool".to_string()]);
        assert!(registry.dependents_of("app").is_empty());
    }

    #[test]
    fn test_runtime_dependencies() {
        let registry = ModuleRegistry::new();
        assert!(registry.dependencies_of("x").is_none());
        registry.register_dependency("x", DependencySpec::required("y", VersionConstraint::any()));
        registry.register_dependency("x", DependencySpec::required("y", VersionConstraint::any()));
        assert_eq!(registry.dependencies_of("x").unwrap().len(), 1);
    }

    #[test]
    fn test_observers_see_events_in_order() {
        let registry = ModuleRegistry::new();
        let recorder = Arc::new(Recorder::default());
        registry.subscribe(recorder.clone());
        let handle = registry.register(record("a", "1.0.0")).unwrap();
        registry.transition(&handle, ModuleState::Loading).unwrap();
        let events = recorder.0.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::Registered { .. }));
        assert_eq!(
            events[1],
            RegistryEvent::StateChanged {
                name: "a".into(),
                from: ModuleState::Unloaded,
                to: ModuleState::Loading
            }
        );
    }

    #[test]
    fn test_replace_keeps_references() {
        let registry = ModuleRegistry::new();
        registry.register(record("m", "1.0.0")).unwrap();
        registry.acquire("m", 10).unwrap();
        let old = registry.write().replace(record("m", "1.1.0")).unwrap();
        assert_eq!(old.metadata.version, ModuleVersion::new(1, 0, 0));
        let view = registry.view("m").unwrap();
        assert_eq!(view.version, ModuleVersion::new(1, 1, 0));
        assert_eq!(view.reference_count, 1);
        assert!(registry.find_by_id(&old.id).is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let registry = ModuleRegistry::new();
        registry.register(record("a", "1.0.0")).unwrap();
        let snapshot = registry.snapshot();
        let before = registry.views();

        registry.register(record("b", "1.0.0")).unwrap();
        registry.write().replace(record("a", "2.0.0")).unwrap();
        registry.restore(snapshot);

        assert_eq!(registry.views(), before);
        assert!(registry.find("b").is_none());
    }
}
