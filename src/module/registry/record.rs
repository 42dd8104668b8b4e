//! Module records and their lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::module::cache::pool::Address;
use crate::module::format::{ModuleId, ModuleMetadata};
use crate::module::image::ImageSlot;
use crate::module::resolver::ModuleVersion;

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleState {
    Unloaded,
    Loading,
    Loaded,
    Initializing,
    Ready,
    Error,
    Unloading,
}

impl ModuleState {
    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ModuleState) -> bool {
        use ModuleState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loaded, Initializing)
                | (Loaded, Unloading)
                | (Loaded, Error)
                | (Initializing, Ready)
                | (Initializing, Error)
                | (Ready, Unloading)
                | (Ready, Error)
                | (Error, Unloading)
                | (Unloading, Unloaded)
        )
    }

    /// States in which exports may be resolved
    pub fn serves_symbols(self) -> bool {
        matches!(
            self,
            ModuleState::Loaded | ModuleState::Initializing | ModuleState::Ready
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loading => "loading",
            ModuleState::Loaded => "loaded",
            ModuleState::Initializing => "initializing",
            ModuleState::Ready => "ready",
            ModuleState::Error => "error",
            ModuleState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// Non-owning reference to a registered module
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordHandle {
    pub name: String,
    pub id: ModuleId,
}

/// Registry-owned state of one module
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub(crate) metadata: ModuleMetadata,
    pub(crate) id: ModuleId,
    pub(crate) state: ModuleState,
    pub(crate) reference_count: u32,
    /// Unix time in milliseconds
    pub(crate) load_time: u64,
    pub(crate) source_path: Option<PathBuf>,
    pub(crate) hot_swappable: bool,
    pub(crate) checksum: u64,
    pub(crate) image: ImageSlot,
    /// Modules this record holds a reference on
    pub(crate) held: Vec<String>,
    /// Registration order, used to keep graph input order stable
    pub(crate) seq: u64,
}

impl ModuleRecord {
    /// New record in the `Unloaded` state with no references
    pub fn new(
        metadata: ModuleMetadata,
        checksum: u64,
        image: ImageSlot,
        source_path: Option<PathBuf>,
        hot_swappable: bool,
    ) -> Self {
        Self {
            id: metadata.id(),
            metadata,
            state: ModuleState::Unloaded,
            reference_count: 0,
            load_time: crate::utils::current_timestamp_millis(),
            source_path,
            hot_swappable,
            checksum,
            image,
            held: Vec::new(),
            seq: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    pub fn image(&self) -> &ImageSlot {
        &self.image
    }

    pub fn source_path(&self) -> Option<&PathBuf> {
        self.source_path.as_ref()
    }

    pub fn held_dependencies(&self) -> &[String] {
        &self.held
    }

    pub(crate) fn with_held(mut self, held: Vec<String>) -> Self {
        self.held = held;
        self
    }

    pub fn handle(&self) -> RecordHandle {
        RecordHandle {
            name: self.metadata.name.clone(),
            id: self.id.clone(),
        }
    }

    pub fn view(&self) -> RecordView {
        RecordView {
            name: self.metadata.name.clone(),
            id: self.id.clone(),
            version: self.metadata.version.clone(),
            state: self.state,
            reference_count: self.reference_count,
            load_time: self.load_time,
            source_path: self.source_path.clone(),
            hot_swappable: self.hot_swappable,
            checksum: self.checksum,
            abi_version: self.metadata.abi_version,
            api_version: self.metadata.api_version,
            code_base: self.image.resident().map(|image| image.code_base()),
        }
    }
}

/// Plain-data copy of a record, safe to hand out and compare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordView {
    pub name: String,
    pub id: ModuleId,
    pub version: ModuleVersion,
    pub state: ModuleState,
    pub reference_count: u32,
    pub load_time: u64,
    pub source_path: Option<PathBuf>,
    pub hot_swappable: bool,
    pub checksum: u64,
    pub abi_version: u32,
    pub api_version: u32,
    /// Absent while a lazily loaded image is still undecoded
    pub code_base: Option<Address>,
}
