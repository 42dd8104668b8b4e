//! Semantic-style module versions
//!
//! Grammar: `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`. Precedence compares the
//! numeric triplet, then prerelease identifiers; build metadata never affects
//! precedence.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::module::error::VersionError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Dot-separated prerelease identifiers, empty for a release
    pub prerelease: String,
    /// Build metadata, ignored for precedence
    pub build: String,
}

impl ModuleVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: String::new(),
            build: String::new(),
        }
    }

    pub fn with_prerelease(mut self, prerelease: impl Into<String>) -> Self {
        self.prerelease = prerelease.into();
        self
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = build.into();
        self
    }

    pub fn is_prerelease(&self) -> bool {
        !self.prerelease.is_empty()
    }

    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let err = |reason: &str| VersionError::Parse {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let (rest, build) = match input.split_once('+') {
            Some((rest, build)) => {
                validate_identifiers(build).map_err(|r| err(&format!("build: {}", r)))?;
                (rest, build)
            }
            None => (input, ""),
        };
        let (core, prerelease) = match rest.split_once('-') {
            Some((core, pre)) => {
                validate_identifiers(pre).map_err(|r| err(&format!("prerelease: {}", r)))?;
                (core, pre)
            }
            None => (rest, ""),
        };

        let mut parts = core.split('.');
        let mut next = |name: &str| -> Result<u64, VersionError> {
            let part = parts
                .next()
                .ok_or_else(|| err(&format!("missing {} component", name)))?;
            parse_numeric(part).ok_or_else(|| err(&format!("invalid {} component '{}'", name, part)))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let patch = next("patch")?;
        if parts.next().is_some() {
            return Err(err("too many components"));
        }

        Ok(ModuleVersion {
            major,
            minor,
            patch,
            prerelease: prerelease.to_string(),
            build: build.to_string(),
        })
    }

    /// Precedence order, ignoring build metadata
    pub fn precedence(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_prerelease(&self.prerelease, &other.prerelease))
    }
}

/// Compare two versions by precedence
pub fn compare(a: &ModuleVersion, b: &ModuleVersion) -> Ordering {
    a.precedence(b)
}

impl Ord for ModuleVersion {
    /// Precedence first; build metadata only breaks ties so that `Ord` agrees with `Eq`
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence(other).then_with(|| self.build.cmp(&other.build))
    }
}

impl PartialOrd for ModuleVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ModuleVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.prerelease.is_empty() {
            write!(f, "-{}", self.prerelease)?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

fn parse_numeric(part: &str) -> Option<u64> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if part.len() > 1 && part.starts_with('0') {
        return None;
    }
    part.parse().ok()
}

fn validate_identifiers(s: &str) -> Result<(), String> {
    for ident in s.split('.') {
        if ident.is_empty() {
            return Err("empty identifier".to_string());
        }
        if !ident.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(format!("invalid identifier '{}'", ident));
        }
    }
    Ok(())
}

/// A release (empty prerelease) outranks any prerelease of the same triplet.
/// Numeric identifiers compare numerically and rank below alphanumeric ones;
/// a shorter identifier list ranks lower when all shared identifiers are equal.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(nx), Ok(ny)) => nx.cmp(&ny),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
