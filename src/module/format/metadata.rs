//! Optional metadata block
//!
//! Layout, all integers little-endian, strings u16-length-prefixed UTF-8:
//! name, version, author, license, homepage, repository; u32 abi, api,
//! minimum loader version, security level, compliance flags; u16 dependency
//! count and entries; u32 signature length and signature bytes last.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use super::reader::Reader;
use super::Architecture;
use crate::module::error::FormatError;
use crate::module::resolver::{
    DependencyKind, DependencySpec, ModuleVersion, Platform, VersionConstraint,
};

/// Maximum module name length in bytes
pub const MAX_MODULE_NAME: usize = 127;

/// Deterministic module identity: hex of the first 16 bytes of SHA-256(name@version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(String);

impl ModuleId {
    pub fn derive(name: &str, version: &ModuleVersion) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(b"@");
        hasher.update(version.to_string().as_bytes());
        let digest = hasher.finalize();
        ModuleId(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMetadata {
    pub name: String,
    pub version: ModuleVersion,
    pub author: String,
    pub license: String,
    pub homepage: String,
    pub repository: String,
    pub dependencies: Vec<DependencySpec>,
    /// Binary interface generation; hot swaps require an exact match
    pub abi_version: u32,
    /// Source interface level; hot swaps may only move forward
    pub api_version: u32,
    /// Oldest loader able to host this module
    pub min_loader_version: u32,
    pub security_level: u32,
    pub compliance_flags: u32,
    /// Detached signature over the signing digest, empty when unsigned
    pub signature: Vec<u8>,
}

impl ModuleMetadata {
    pub fn new(name: impl Into<String>, version: ModuleVersion) -> Self {
        Self {
            name: name.into(),
            version,
            author: String::new(),
            license: String::new(),
            homepage: String::new(),
            repository: String::new(),
            dependencies: Vec::new(),
            abi_version: 1,
            api_version: 1,
            min_loader_version: 1,
            security_level: 0,
            compliance_flags: 0,
            signature: Vec::new(),
        }
    }

    pub fn id(&self) -> ModuleId {
        ModuleId::derive(&self.name, &self.version)
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Everything except the trailing signature field. Rejects anything
    /// [`read`](Self::read) would reject, so every encoded block decodes.
    pub(crate) fn write_body<B: BufMut>(&self, buf: &mut B) -> Result<(), FormatError> {
        validate_module_name(&self.name)?;
        let version = version_text(&self.version)?;
        let dependencies = self
            .dependencies
            .iter()
            .map(|dep| {
                validate_module_name(&dep.target)?;
                Ok((dep, constraint_text(&dep.target, &dep.constraint)?))
            })
            .collect::<Result<Vec<_>, FormatError>>()?;

        put_str(buf, "name", &self.name)?;
        put_str(buf, "version", &version)?;
        put_str(buf, "author", &self.author)?;
        put_str(buf, "license", &self.license)?;
        put_str(buf, "homepage", &self.homepage)?;
        put_str(buf, "repository", &self.repository)?;
        buf.put_u32_le(self.abi_version);
        buf.put_u32_le(self.api_version);
        buf.put_u32_le(self.min_loader_version);
        buf.put_u32_le(self.security_level);
        buf.put_u32_le(self.compliance_flags);

        let count = u16::try_from(dependencies.len())
            .map_err(|_| FormatError::InvalidFormat("too many dependencies".to_string()))?;
        buf.put_u16_le(count);
        for (dep, constraint) in dependencies {
            put_str(buf, "dependency target", &dep.target)?;
            buf.put_u8(dep.kind.to_u8());
            put_str(buf, "dependency constraint", &constraint)?;
            buf.put_u8(dep.constraint.include_prerelease as u8);
            buf.put_u8(dep.platform.map_or(0, Platform::to_u8));
            buf.put_u8(dep.architecture.map_or(0, |a| a as u8));
        }
        Ok(())
    }

    pub(crate) fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), FormatError> {
        self.write_body(buf)?;
        let len = u32::try_from(self.signature.len())
            .map_err(|_| FormatError::InvalidFormat("signature too large".to_string()))?;
        buf.put_u32_le(len);
        buf.put_slice(&self.signature);
        Ok(())
    }

    /// Parse a metadata block. Returns the metadata and the length of the
    /// body that precedes the signature field.
    pub(crate) fn read(block: &[u8], base: usize) -> Result<(Self, usize), FormatError> {
        let mut r = Reader::at(block, base);

        let name = r.string("name")?;
        validate_module_name(&name)?;
        let version_text = r.string("version")?;
        let version = ModuleVersion::parse(&version_text)
            .map_err(|e| FormatError::InvalidFormat(format!("metadata version: {}", e)))?;
        let author = r.string("author")?;
        let license = r.string("license")?;
        let homepage = r.string("homepage")?;
        let repository = r.string("repository")?;
        let abi_version = r.u32()?;
        let api_version = r.u32()?;
        let min_loader_version = r.u32()?;
        let security_level = r.u32()?;
        let compliance_flags = r.u32()?;

        let count = r.u16()? as usize;
        let mut dependencies = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            dependencies.push(read_dependency(&mut r)?);
        }
        let body_len = r.position();

        let sig_len = r.u32()? as usize;
        let signature = r.take(sig_len)?.to_vec();
        if r.remaining() != 0 {
            return Err(FormatError::InvalidFormat(format!(
                "{} trailing bytes in metadata block",
                r.remaining()
            )));
        }

        Ok((
            ModuleMetadata {
                name,
                version,
                author,
                license,
                homepage,
                repository,
                dependencies,
                abi_version,
                api_version,
                min_loader_version,
                security_level,
                compliance_flags,
                signature,
            },
            body_len,
        ))
    }
}

fn read_dependency(r: &mut Reader<'_>) -> Result<DependencySpec, FormatError> {
    let target = r.string("dependency target")?;
    validate_module_name(&target)?;
    let raw_kind = r.u8()?;
    let kind = DependencyKind::from_u8(raw_kind)
        .ok_or_else(|| FormatError::InvalidFormat(format!("unknown dependency kind {}", raw_kind)))?;
    let text = r.string("dependency constraint")?;
    let mut constraint = VersionConstraint::parse(&text)
        .map_err(|e| FormatError::InvalidFormat(format!("dependency {}: {}", target, e)))?;
    constraint.include_prerelease = match r.u8()? {
        0 => false,
        1 => true,
        other => {
            return Err(FormatError::InvalidFormat(format!(
                "invalid prerelease flag {}",
                other
            )))
        }
    };
    let platform = match r.u8()? {
        0 => None,
        raw => Some(
            Platform::from_u8(raw)
                .ok_or_else(|| FormatError::InvalidFormat(format!("unknown platform {}", raw)))?,
        ),
    };
    let architecture = match r.u8()? {
        0 => None,
        raw => Some(
            Architecture::from_u8(raw)
                .ok_or_else(|| FormatError::InvalidFormat(format!("unknown architecture {}", raw)))?,
        ),
    };
    Ok(DependencySpec {
        target,
        kind,
        constraint,
        platform,
        architecture,
    })
}

fn validate_module_name(name: &str) -> Result<(), FormatError> {
    if name.is_empty() || name.len() > MAX_MODULE_NAME {
        return Err(FormatError::InvalidFormat(format!(
            "module name must be 1..={} bytes",
            MAX_MODULE_NAME
        )));
    }
    if name.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return Err(FormatError::InvalidFormat(format!("invalid module name {:?}", name)));
    }
    Ok(())
}

/// Text form of `version`, provided it parses back to the same version
fn version_text(version: &ModuleVersion) -> Result<String, FormatError> {
    let text = version.to_string();
    match ModuleVersion::parse(&text) {
        Ok(parsed) if parsed == *version => Ok(text),
        Ok(_) => Err(FormatError::InvalidFormat(format!(
            "metadata version {} does not read back",
            text
        ))),
        Err(e) => Err(FormatError::InvalidFormat(format!("metadata version: {}", e))),
    }
}

/// Text form of `constraint`, provided it parses back to the same bounds
fn constraint_text(target: &str, constraint: &VersionConstraint) -> Result<String, FormatError> {
    let text = constraint.to_string();
    match VersionConstraint::parse(&text) {
        Ok(parsed) if parsed.kind == constraint.kind => Ok(text),
        Ok(_) => Err(FormatError::InvalidFormat(format!(
            "dependency {}: constraint {} does not read back",
            target, text
        ))),
        Err(e) => Err(FormatError::InvalidFormat(format!("dependency {}: {}", target, e))),
    }
}

fn put_str<B: BufMut>(buf: &mut B, field: &str, value: &str) -> Result<(), FormatError> {
    let len = u16::try_from(value.len())
        .map_err(|_| FormatError::InvalidFormat(format!("{} exceeds 65535 bytes", field)))?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}
