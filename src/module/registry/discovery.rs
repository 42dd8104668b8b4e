//! Module discovery
//!
//! Resolves module names against the configured search paths and scans them
//! for available module images.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::LoaderConfig;
use crate::module::error::ResourceError;

/// Discovered module image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredModule {
    /// Module name (file stem)
    pub name: String,
    /// Path to the image file
    pub path: PathBuf,
}

/// Search-path scanner
#[derive(Debug, Clone)]
pub struct ModuleDiscovery {
    search_paths: Vec<PathBuf>,
    extension: String,
}

impl ModuleDiscovery {
    pub fn new(search_paths: Vec<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            search_paths,
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Self {
        Self::new(config.search_paths.clone(), config.file_extension.clone())
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn file_name(&self, name: &str) -> String {
        format!("{}.{}", name, self.extension)
    }

    /// Locate `name`, trying `<dir>/<name>.<ext>` then `<dir>/<name>/<name>.<ext>`
    /// in every search path, in order
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            debug!("Refusing to resolve module name {:?}", name);
            return None;
        }
        let file = self.file_name(name);
        for dir in &self.search_paths {
            let candidates = [dir.join(&file), dir.join(name).join(&file)];
            for candidate in candidates {
                if candidate.is_file() {
                    debug!("Resolved module {} to {:?}", name, candidate);
                    return Some(candidate);
                }
            }
        }
        None
    }

    fn stem_of(&self, path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != self.extension {
            return None;
        }
        path.file_stem()?.to_str().map(str::to_string)
    }

    /// Every module image under the search paths. A name found in several
    /// paths is reported once, from the first path.
    pub fn discover(&self) -> Result<Vec<DiscoveredModule>, ResourceError> {
        let mut seen = HashSet::new();
        let mut modules = Vec::new();

        for dir in &self.search_paths {
            if !dir.is_dir() {
                debug!("Search path {:?} does not exist, skipping", dir);
                continue;
            }

            let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<_, _>>()?;
            entries.sort();

            for path in entries {
                let found = if path.is_dir() {
                    path.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| (n.to_string(), path.join(self.file_name(n))))
                        .filter(|(_, image)| image.is_file())
                } else {
                    self.stem_of(&path).map(|name| (name, path.clone()))
                };

                if let Some((name, path)) = found {
                    if seen.insert(name.clone()) {
                        modules.push(DiscoveredModule { name, path });
                    }
                }
            }
        }

        info!("Discovered {} modules", modules.len());
        Ok(modules)
    }
}
