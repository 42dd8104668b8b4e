//! Point-in-time copies of the registry

use super::record::RecordView;
use super::table::RegistryInner;

/// Full copy of the registry table, restorable with
/// [`ModuleRegistry::restore`](super::ModuleRegistry::restore).
///
/// Images are shared, not copied: restoring a snapshot brings back the exact
/// images (and therefore addresses) that were active when it was taken.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    inner: RegistryInner,
    taken_at: u64,
}

impl RegistrySnapshot {
    pub(crate) fn new(inner: RegistryInner) -> Self {
        Self {
            inner,
            taken_at: crate::utils::current_timestamp_millis(),
        }
    }

    pub(crate) fn into_inner(self) -> RegistryInner {
        self.inner
    }

    /// Unix time in milliseconds
    pub fn taken_at(&self) -> u64 {
        self.taken_at
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn view(&self, name: &str) -> Option<RecordView> {
        self.inner.view(name)
    }

    pub fn views(&self) -> Vec<RecordView> {
        self.inner.views()
    }
}
