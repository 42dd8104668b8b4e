//! Export table entries

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use super::reader::Reader;
use crate::module::error::FormatError;

/// Maximum export name length in bytes, excluding the NUL terminator
pub const MAX_EXPORT_NAME: usize = 127;
/// Fixed name field width
pub const EXPORT_NAME_FIELD: usize = MAX_EXPORT_NAME + 1;
/// Encoded size of one export entry
pub const EXPORT_ENTRY_SIZE: usize = EXPORT_NAME_FIELD + 1 + 7 + 8 + 8;
/// Maximum number of exports per module
pub const MAX_EXPORTS: usize = 1024;

/// Which section an export points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExportKind {
    /// Offset into the code section
    Function,
    /// Offset into the data section
    Variable,
}

impl ExportKind {
    fn to_u8(self) -> u8 {
        match self {
            ExportKind::Function => 1,
            ExportKind::Variable => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ExportKind::Function),
            2 => Some(ExportKind::Variable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub offset: u64,
    pub size: u64,
}

impl Export {
    pub fn function(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: ExportKind::Function,
            offset,
            size,
        }
    }

    pub fn variable(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: ExportKind::Variable,
            offset,
            size,
        }
    }

    pub(crate) fn validate_name(name: &str) -> Result<(), FormatError> {
        if name.is_empty() {
            return Err(FormatError::InvalidFormat("empty export name".to_string()));
        }
        if name.len() > MAX_EXPORT_NAME {
            return Err(FormatError::InvalidFormat(format!(
                "export name exceeds {} bytes: {}",
                MAX_EXPORT_NAME,
                name.len()
            )));
        }
        if name.as_bytes().contains(&0) {
            return Err(FormatError::InvalidFormat(format!(
                "export name contains NUL: {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Check the export lies within the section its kind points into
    pub(crate) fn check_bounds(&self, code_size: u64, data_size: u64) -> Result<(), FormatError> {
        let limit = match self.kind {
            ExportKind::Function => code_size,
            ExportKind::Variable => data_size,
        };
        match self.offset.checked_add(self.size) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(FormatError::InvalidFormat(format!(
                "export {} ({:?}) at {}+{} outside section of {} bytes",
                self.name, self.kind, self.offset, self.size, limit
            ))),
        }
    }

    pub(crate) fn write<B: BufMut>(&self, buf: &mut B) -> Result<(), FormatError> {
        Self::validate_name(&self.name)?;
        let mut field = [0u8; EXPORT_NAME_FIELD];
        field[..self.name.len()].copy_from_slice(self.name.as_bytes());
        buf.put_slice(&field);
        buf.put_u8(self.kind.to_u8());
        buf.put_slice(&[0u8; 7]);
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.size);
        Ok(())
    }

    pub(crate) fn read(r: &mut Reader<'_>) -> Result<Self, FormatError> {
        let field = r.take(EXPORT_NAME_FIELD)?;
        let len = field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FormatError::InvalidFormat("export name not terminated".to_string()))?;
        if field[len..].iter().any(|&b| b != 0) {
            return Err(FormatError::InvalidFormat(
                "export name padding is not zeroed".to_string(),
            ));
        }
        let name = std::str::from_utf8(&field[..len])
            .map_err(|_| FormatError::InvalidFormat("export name is not valid UTF-8".to_string()))?
            .to_string();
        Self::validate_name(&name)?;

        let raw_kind = r.u8()?;
        let kind = ExportKind::from_u8(raw_kind).ok_or_else(|| {
            FormatError::InvalidFormat(format!("unknown export kind {} for {}", raw_kind, name))
        })?;
        if r.take(7)?.iter().any(|&b| b != 0) {
            return Err(FormatError::InvalidFormat(format!(
                "reserved bytes set in export {}",
                name
            )));
        }
        let offset = r.u64()?;
        let size = r.u64()?;

        Ok(Export {
            name,
            kind,
            offset,
            size,
        })
    }
}
