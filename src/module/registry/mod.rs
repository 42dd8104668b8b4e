//! Module registry, records and discovery

pub mod discovery;
pub mod record;
pub mod snapshot;
pub mod table;

pub use discovery::{DiscoveredModule, ModuleDiscovery};
pub use record::{ModuleRecord, ModuleState, RecordHandle, RecordView};
pub use snapshot::RegistrySnapshot;
pub use table::{ModuleRegistry, RegistryEvent, RegistryObserver, RegistryTxn};
