//! Dependency declarations and host filters

use serde::{Deserialize, Serialize};
use std::fmt;

use super::constraint::VersionConstraint;
use crate::module::format::Architecture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyKind {
    /// Must be present and satisfy the constraint
    Required,
    /// Loaded first when available, skipped otherwise
    Optional,
    /// Must not be loaded at a version satisfying the constraint
    Conflicting,
    /// Ordering hint only
    Suggested,
}

impl DependencyKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            DependencyKind::Required => 1,
            DependencyKind::Optional => 2,
            DependencyKind::Conflicting => 3,
            DependencyKind::Suggested => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DependencyKind::Required),
            2 => Some(DependencyKind::Optional),
            3 => Some(DependencyKind::Conflicting),
            4 => Some(DependencyKind::Suggested),
            _ => None,
        }
    }

    /// Whether the dependency must be loaded before its dependent
    pub fn orders_load(self) -> bool {
        !matches!(self, DependencyKind::Conflicting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    FreeBsd,
}

impl Platform {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Platform::Linux => 1,
            Platform::MacOs => 2,
            Platform::Windows => 3,
            Platform::FreeBsd => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Platform::Linux),
            2 => Some(Platform::MacOs),
            3 => Some(Platform::Windows),
            4 => Some(Platform::FreeBsd),
            _ => None,
        }
    }

    pub fn current() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "macos") {
            Some(Platform::MacOs)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else if cfg!(target_os = "freebsd") {
            Some(Platform::FreeBsd)
        } else {
            None
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::Linux => "linux",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::FreeBsd => "freebsd",
        })
    }
}

/// Platform and architecture that dependency filters are evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTarget {
    pub platform: Option<Platform>,
    pub architecture: Option<Architecture>,
}

impl HostTarget {
    pub fn current() -> Self {
        Self {
            platform: Platform::current(),
            architecture: Architecture::current(),
        }
    }

    pub fn new(platform: Platform, architecture: Architecture) -> Self {
        Self {
            platform: Some(platform),
            architecture: Some(architecture),
        }
    }
}

impl Default for HostTarget {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencySpec {
    pub target: String,
    pub kind: DependencyKind,
    pub constraint: VersionConstraint,
    /// Unset matches every platform
    pub platform: Option<Platform>,
    /// Unset matches every architecture
    pub architecture: Option<Architecture>,
}

impl DependencySpec {
    pub fn new(target: impl Into<String>, kind: DependencyKind, constraint: VersionConstraint) -> Self {
        Self {
            target: target.into(),
            kind,
            constraint,
            platform: None,
            architecture: None,
        }
    }

    pub fn required(target: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self::new(target, DependencyKind::Required, constraint)
    }

    pub fn optional(target: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self::new(target, DependencyKind::Optional, constraint)
    }

    pub fn conflicting(target: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self::new(target, DependencyKind::Conflicting, constraint)
    }

    pub fn suggested(target: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self::new(target, DependencyKind::Suggested, constraint)
    }

    pub fn on_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn on_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    /// Whether this dependency applies on `host`. A set filter must match
    /// exactly; a host that cannot be identified never matches a set filter.
    pub fn applies_to(&self, host: &HostTarget) -> bool {
        let platform_ok = match self.platform {
            None => true,
            Some(p) => host.platform == Some(p),
        };
        let arch_ok = match self.architecture {
            None => true,
            Some(a) => host.architecture == Some(a),
        };
        platform_ok && arch_ok
    }
}
