//! Native module binary format
//!
//! `.native` images are little-endian: a fixed header, the code and data
//! sections, a table of fixed-width export entries, and an optional metadata
//! block carrying identity, compatibility markers, dependencies and a
//! signature. The header checksum (CRC-64/XZ) covers code, data and the
//! export table; the signature covers the checksum and the metadata.

pub mod checksum;
pub mod codec;
pub mod export;
pub mod header;
pub mod metadata;
pub(crate) mod reader;
pub mod signature;

pub use checksum::{crc64, section_checksum, Crc64};
pub use codec::{decode, encode, inspect, verify, DecodeOptions, ModuleSummary, NativeModule};
pub use export::{Export, ExportKind, EXPORT_ENTRY_SIZE, MAX_EXPORTS, MAX_EXPORT_NAME};
pub use header::{Architecture, Header, HeaderFlags, ModuleType, Section, FORMAT_VERSION, HEADER_SIZE, MAGIC};
pub use metadata::{ModuleId, ModuleMetadata};
pub use signature::{sign_digest, signing_digest, Secp256k1TrustAnchor, SignatureVerifier};

/// File extension for module images
pub const MODULE_EXTENSION: &str = "native";
