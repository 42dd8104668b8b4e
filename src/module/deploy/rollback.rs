//! Rollback points
//!
//! One point per evolution, taken before its sandbox phase starts. Points
//! live in a bounded ring; an evicted point cannot be rolled back to. With a
//! backup directory configured, each point also gets an on-disk backup of the
//! module's source image and a bincode dump of the registry views.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::state::EvolutionId;
use crate::module::registry::{RecordView, RegistrySnapshot};
use crate::utils::{current_timestamp_millis, RingBuffer};

/// File holding the bincode-encoded registry views inside a backup
pub const REGISTRY_BACKUP_FILE: &str = "registry.bin";

#[derive(Debug, Clone)]
pub struct RollbackPoint {
    pub evolution_id: EvolutionId,
    pub module: String,
    pub backup_location: Option<PathBuf>,
    pub timestamp: u64,
    pub valid: bool,
    pub snapshot: RegistrySnapshot,
}

impl RollbackPoint {
    pub fn new(evolution_id: EvolutionId, module: impl Into<String>, snapshot: RegistrySnapshot) -> Self {
        Self {
            evolution_id,
            module: module.into(),
            backup_location: None,
            timestamp: current_timestamp_millis(),
            valid: true,
            snapshot,
        }
    }

    pub fn with_backup(mut self, location: PathBuf) -> Self {
        self.backup_location = Some(location);
        self
    }

    pub fn summary(&self) -> RollbackSummary {
        RollbackSummary {
            evolution_id: self.evolution_id,
            module: self.module.clone(),
            backup_location: self.backup_location.clone(),
            timestamp: self.timestamp,
            valid: self.valid,
            modules: self.snapshot.len(),
        }
    }
}

/// Rollback point without its snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackSummary {
    pub evolution_id: EvolutionId,
    pub module: String,
    pub backup_location: Option<PathBuf>,
    pub timestamp: u64,
    pub valid: bool,
    pub modules: usize,
}

#[derive(Debug)]
pub struct RollbackLog {
    points: RingBuffer<RollbackPoint>,
}

impl RollbackLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: RingBuffer::new(capacity),
        }
    }

    /// Store a point; returns the point evicted to make room
    pub fn push(&mut self, point: RollbackPoint) -> Option<RollbackPoint> {
        debug!("Rollback point for {} ({})", point.module, point.evolution_id);
        let evicted = self.points.push(point);
        if let Some(old) = &evicted {
            debug!("Evicted rollback point {} ({})", old.evolution_id, old.module);
        }
        evicted
    }

    /// Most recent valid point for `evolution_id`
    pub fn find_valid(&self, evolution_id: EvolutionId) -> Option<&RollbackPoint> {
        self.points
            .iter()
            .rev()
            .find(|p| p.valid && p.evolution_id == evolution_id)
    }

    /// Mark every point of `evolution_id` as used; returns how many changed
    pub fn invalidate(&mut self, evolution_id: EvolutionId) -> usize {
        let mut changed = 0;
        for point in self.points.iter_mut().filter(|p| p.evolution_id == evolution_id && p.valid) {
            point.valid = false;
            changed += 1;
        }
        changed
    }

    pub fn summaries(&self) -> Vec<RollbackSummary> {
        self.points.iter().map(RollbackPoint::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.points.capacity()
    }
}

/// Write `<dir>/<evolution>/` with a copy of the source image and the
/// encoded registry views
pub async fn write_backup(
    dir: &Path,
    evolution_id: EvolutionId,
    source: Option<&Path>,
    views: &[RecordView],
) -> anyhow::Result<PathBuf> {
    let location = dir.join(evolution_id.to_string());
    tokio::fs::create_dir_all(&location).await?;

    if let Some(source) = source {
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("source path {} has no file name", source.display()))?;
        tokio::fs::copy(source, location.join(file_name)).await?;
    }

    let encoded = bincode::serialize(views)?;
    tokio::fs::write(location.join(REGISTRY_BACKUP_FILE), encoded).await?;
    Ok(location)
}

/// Registry views stored in a backup directory
pub async fn read_backup_views(location: &Path) -> anyhow::Result<Vec<RecordView>> {
    let bytes = tokio::fs::read(location.join(REGISTRY_BACKUP_FILE)).await?;
    Ok(bincode::deserialize(&bytes)?)
}

/// Remove an evicted point's backup directory
pub async fn remove_backup(point: &RollbackPoint) {
    if let Some(location) = &point.backup_location {
        if let Err(e) = tokio::fs::remove_dir_all(location).await {
            warn!("Failed to remove backup {}: {}", location.display(), e);
        }
    }
}
