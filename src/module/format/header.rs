//! Fixed 52-byte module header
//!
//! ```text
//! offset size  field
//! 0      4     magic "NATV"
//! 4      4     format version
//! 8      1     architecture
//! 9      1     module type
//! 10     2     flags
//! 12     8     code offset, size
//! 20     8     data offset, size
//! 28     8     export table offset, entry count
//! 36     8     metadata offset, size
//! 44     8     checksum
//! ```

use bitflags::bitflags;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::reader::Reader;
use crate::module::error::FormatError;

pub const MAGIC: [u8; 4] = *b"NATV";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 52;

/// Target instruction set of a module's code section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Architecture {
    X86_64 = 1,
    Arm64 = 2,
    X86_32 = 3,
}

impl Architecture {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Architecture::X86_64),
            2 => Some(Architecture::Arm64),
            3 => Some(Architecture::X86_32),
            _ => None,
        }
    }

    /// Architecture of the running host, if it is one modules can target
    pub fn current() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::Arm64)
        } else if cfg!(target_arch = "x86") {
            Some(Architecture::X86_32)
        } else {
            None
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
            Architecture::X86_32 => "x86_32",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModuleType {
    Vm = 1,
    Libc = 2,
    User = 3,
}

impl ModuleType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ModuleType::Vm),
            2 => Some(ModuleType::Libc),
            3 => Some(ModuleType::User),
            _ => None,
        }
    }
}

bitflags! {
    /// Header flag bits; unknown bits are rejected
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u16 {
        const HAS_METADATA = 0b0000_0001;
        const SIGNED = 0b0000_0010;
    }
}

/// Offset and length of one section within the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Section {
    pub offset: u32,
    pub size: u32,
}

impl Section {
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub format_version: u32,
    pub architecture: Architecture,
    pub module_type: ModuleType,
    pub flags: HeaderFlags,
    pub code: Section,
    pub data: Section,
    pub export_offset: u32,
    pub export_count: u32,
    pub metadata: Section,
    pub checksum: u64,
}

impl Header {
    /// Parse and validate the header fields in order: magic, format version,
    /// architecture and module type, then the remaining fixed fields.
    pub fn read(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut r = Reader::new(bytes);

        if r.take(4)? != MAGIC {
            return Err(FormatError::InvalidFormat("bad magic".to_string()));
        }

        let format_version = r.u32()?;
        if format_version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(format_version));
        }

        let arch = r.u8()?;
        let architecture = Architecture::from_u8(arch)
            .ok_or_else(|| FormatError::InvalidFormat(format!("unknown architecture {}", arch)))?;
        let kind = r.u8()?;
        let module_type = ModuleType::from_u8(kind)
            .ok_or_else(|| FormatError::InvalidFormat(format!("unknown module type {}", kind)))?;

        let raw_flags = r.u16()?;
        let flags = HeaderFlags::from_bits(raw_flags)
            .ok_or_else(|| FormatError::InvalidFormat(format!("unknown flags {:#06x}", raw_flags)))?;

        let code = Section {
            offset: r.u32()?,
            size: r.u32()?,
        };
        let data = Section {
            offset: r.u32()?,
            size: r.u32()?,
        };
        let export_offset = r.u32()?;
        let export_count = r.u32()?;
        let metadata = Section {
            offset: r.u32()?,
            size: r.u32()?,
        };
        let checksum = r.u64()?;

        Ok(Header {
            format_version,
            architecture,
            module_type,
            flags,
            code,
            data,
            export_offset,
            export_count,
            metadata,
            checksum,
        })
    }

    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&MAGIC);
        buf.put_u32_le(self.format_version);
        buf.put_u8(self.architecture as u8);
        buf.put_u8(self.module_type as u8);
        buf.put_u16_le(self.flags.bits());
        buf.put_u32_le(self.code.offset);
        buf.put_u32_le(self.code.size);
        buf.put_u32_le(self.data.offset);
        buf.put_u32_le(self.data.size);
        buf.put_u32_le(self.export_offset);
        buf.put_u32_le(self.export_count);
        buf.put_u32_le(self.metadata.offset);
        buf.put_u32_le(self.metadata.size);
        buf.put_u64_le(self.checksum);
    }
}
