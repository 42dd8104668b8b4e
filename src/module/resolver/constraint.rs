//! Version constraints
//!
//! Textual grammar:
//!
//! | Text                | Kind                                  |
//! |---------------------|---------------------------------------|
//! | `1.2.3`, `=1.2.3`   | Exact                                 |
//! | `>=1.2.3`           | Min                                   |
//! | `<=1.2.3`           | Max                                   |
//! | `>=1.0.0, <=2.0.0`  | Range (inclusive)                     |
//! | `^1.2.3`            | Compatible (same major, at least min) |
//! | `~1.2.3`            | Range within the 1.2 minor line       |
//! | `*`                 | Min 0.0.0                             |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::version::ModuleVersion;
use crate::module::error::VersionError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    Exact(ModuleVersion),
    Min(ModuleVersion),
    Max(ModuleVersion),
    Range { min: ModuleVersion, max: ModuleVersion },
    Compatible(ModuleVersion),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub kind: ConstraintKind,
    /// Allow prerelease versions to satisfy non-exact constraints
    pub include_prerelease: bool,
}

impl VersionConstraint {
    pub fn new(kind: ConstraintKind) -> Self {
        Self {
            kind,
            include_prerelease: false,
        }
    }

    pub fn exact(version: ModuleVersion) -> Self {
        Self::new(ConstraintKind::Exact(version))
    }

    pub fn min(version: ModuleVersion) -> Self {
        Self::new(ConstraintKind::Min(version))
    }

    pub fn max(version: ModuleVersion) -> Self {
        Self::new(ConstraintKind::Max(version))
    }

    pub fn range(min: ModuleVersion, max: ModuleVersion) -> Self {
        Self::new(ConstraintKind::Range { min, max })
    }

    pub fn compatible(min: ModuleVersion) -> Self {
        Self::new(ConstraintKind::Compatible(min))
    }

    /// Matches every release
    pub fn any() -> Self {
        Self::min(ModuleVersion::new(0, 0, 0))
    }

    pub fn including_prerelease(mut self) -> Self {
        self.include_prerelease = true;
        self
    }

    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let text = input.trim();
        let version = |s: &str| ModuleVersion::parse(s.trim());

        if text == "*" {
            return Ok(Self::any());
        }

        if let Some((lower, upper)) = text.split_once(',') {
            let lower = lower.trim();
            let upper = upper.trim();
            let (Some(min), Some(max)) = (lower.strip_prefix(">="), upper.strip_prefix("<=")) else {
                return Err(VersionError::Parse {
                    input: input.to_string(),
                    reason: "range must be '>=MIN, <=MAX'".to_string(),
                });
            };
            let (min, max) = (version(min)?, version(max)?);
            if min.precedence(&max).is_gt() {
                return Err(VersionError::Parse {
                    input: input.to_string(),
                    reason: "range minimum exceeds maximum".to_string(),
                });
            }
            return Ok(Self::range(min, max));
        }

        if let Some(rest) = text.strip_prefix(">=") {
            return Ok(Self::min(version(rest)?));
        }
        if let Some(rest) = text.strip_prefix("<=") {
            return Ok(Self::max(version(rest)?));
        }
        if text.starts_with('>') || text.starts_with('<') {
            return Err(VersionError::Parse {
                input: input.to_string(),
                reason: "exclusive bounds are not supported".to_string(),
            });
        }
        if let Some(rest) = text.strip_prefix('^') {
            return Ok(Self::compatible(version(rest)?));
        }
        if let Some(rest) = text.strip_prefix('~') {
            let min = version(rest)?;
            let max = ModuleVersion::new(min.major, min.minor, u64::MAX);
            return Ok(Self::range(min, max));
        }
        let rest = text.strip_prefix('=').unwrap_or(text);
        Ok(Self::exact(version(rest)?))
    }

    /// Whether `version` satisfies this constraint.
    ///
    /// Prerelease versions only match an Exact constraint or a constraint
    /// with `include_prerelease` set.
    pub fn satisfies(&self, version: &ModuleVersion) -> bool {
        if version.is_prerelease()
            && !self.include_prerelease
            && !matches!(self.kind, ConstraintKind::Exact(_))
        {
            return false;
        }

        match &self.kind {
            ConstraintKind::Exact(v) => version.precedence(v).is_eq(),
            ConstraintKind::Min(min) => version.precedence(min).is_ge(),
            ConstraintKind::Max(max) => version.precedence(max).is_le(),
            ConstraintKind::Range { min, max } => {
                version.precedence(min).is_ge() && version.precedence(max).is_le()
            }
            ConstraintKind::Compatible(min) => {
                version.major == min.major && version.precedence(min).is_ge()
            }
        }
    }
}

/// Free-function form of [`VersionConstraint::satisfies`]
pub fn satisfies(version: &ModuleVersion, constraint: &VersionConstraint) -> bool {
    constraint.satisfies(version)
}

impl FromStr for VersionConstraint {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Canonical text form; `parse(to_string())` yields the same kind and bounds
impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConstraintKind::Exact(v) => write!(f, "={}", v),
            ConstraintKind::Min(v) => write!(f, ">={}", v),
            ConstraintKind::Max(v) => write!(f, "<={}", v),
            ConstraintKind::Range { min, max } => write!(f, ">={}, <={}", min, max),
            ConstraintKind::Compatible(v) => write!(f, "^{}", v),
        }
    }
}
