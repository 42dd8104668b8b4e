//! Module image encoder and decoder
//!
//! Sections follow the header contiguously: code, data, export table,
//! metadata. Any other placement is rejected so that every accepted image has
//! exactly one encoding.
//!
//! Decode validation order: magic, format version, architecture and module
//! type, section bounds, checksum over the raw code, data and export table
//! bytes, export and metadata structure, then the optional signature.
//! Decoding is pure; it allocates only the decoded buffers.

use bytes::BufMut;
use std::collections::HashSet;

use super::checksum::section_checksum;
use super::export::{Export, EXPORT_ENTRY_SIZE, MAX_EXPORTS};
use super::header::{Header, HeaderFlags, Section, FORMAT_VERSION, HEADER_SIZE};
use super::metadata::ModuleMetadata;
use super::reader::Reader;
use super::signature::{digest_for, sign_digest, signing_digest, SignatureVerifier};
use super::{Architecture, ModuleType};
use crate::module::error::FormatError;

/// A decoded (or to-be-encoded) native module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeModule {
    pub architecture: Architecture,
    pub module_type: ModuleType,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub exports: Vec<Export>,
    pub metadata: Option<ModuleMetadata>,
}

impl NativeModule {
    pub fn new(architecture: Architecture, module_type: ModuleType) -> Self {
        Self {
            architecture,
            module_type,
            code: Vec::new(),
            data: Vec::new(),
            exports: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_code(mut self, code: Vec<u8>) -> Self {
        self.code = code;
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_export(mut self, export: Export) -> Self {
        self.exports.push(export);
        self
    }

    pub fn with_metadata(mut self, metadata: ModuleMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Checksum the header will carry for this module
    pub fn checksum(&self) -> Result<u64, FormatError> {
        let table = encode_export_table(&self.exports)?;
        Ok(section_checksum(&self.code, &self.data, &table))
    }

    /// Digest a signature over this module must cover
    pub fn signing_digest(&self) -> Result<[u8; 32], FormatError> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| FormatError::InvalidFormat("cannot sign a module without metadata".to_string()))?;
        digest_for(self.checksum()?, self.architecture, self.module_type, metadata)
    }

    /// Sign with a secp256k1 key, replacing any existing signature
    pub fn sign(&mut self, secret_key: &secp256k1::SecretKey) -> Result<(), FormatError> {
        let digest = self.signing_digest()?;
        let signature = sign_digest(&digest, secret_key)?;
        if let Some(metadata) = self.metadata.as_mut() {
            metadata.signature = signature.to_vec();
        }
        Ok(())
    }
}

/// Caller-supplied signature policy
#[derive(Clone, Copy, Default)]
pub struct DecodeOptions<'a> {
    /// Trust anchor; signatures are checked only when one is supplied
    pub verifier: Option<&'a dyn SignatureVerifier>,
    /// Reject modules without a signature
    pub require_signature: bool,
}

impl<'a> DecodeOptions<'a> {
    pub fn with_verifier(verifier: &'a dyn SignatureVerifier) -> Self {
        Self {
            verifier: Some(verifier),
            require_signature: false,
        }
    }

    pub fn require_signature(mut self) -> Self {
        self.require_signature = true;
        self
    }
}

impl std::fmt::Debug for DecodeOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeOptions")
            .field("verifier", &self.verifier.is_some())
            .field("require_signature", &self.require_signature)
            .finish()
    }
}

/// Header and metadata of an image, without its sections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSummary {
    pub header: Header,
    pub metadata: Option<ModuleMetadata>,
}

fn encode_export_table(exports: &[Export]) -> Result<Vec<u8>, FormatError> {
    if exports.len() > MAX_EXPORTS {
        return Err(FormatError::InvalidFormat(format!(
            "{} exports exceeds limit of {}",
            exports.len(),
            MAX_EXPORTS
        )));
    }
    let mut table = Vec::with_capacity(exports.len() * EXPORT_ENTRY_SIZE);
    for export in exports {
        export.write(&mut table)?;
    }
    Ok(table)
}

fn to_u32(value: usize, what: &str) -> Result<u32, FormatError> {
    u32::try_from(value).map_err(|_| FormatError::InvalidFormat(format!("{} exceeds 4 GiB", what)))
}

fn check_exports(exports: &[Export], code_size: u64, data_size: u64) -> Result<(), FormatError> {
    let mut names = HashSet::with_capacity(exports.len());
    for export in exports {
        export.check_bounds(code_size, data_size)?;
        if !names.insert(export.name.as_str()) {
            return Err(FormatError::InvalidFormat(format!("duplicate export {}", export.name)));
        }
    }
    Ok(())
}

/// Encode a module into its binary image
pub fn encode(module: &NativeModule) -> Result<Vec<u8>, FormatError> {
    check_exports(&module.exports, module.code.len() as u64, module.data.len() as u64)?;
    let table = encode_export_table(&module.exports)?;

    let mut metadata_bytes = Vec::new();
    if let Some(metadata) = &module.metadata {
        metadata.write(&mut metadata_bytes)?;
    }

    let mut flags = HeaderFlags::empty();
    if let Some(metadata) = &module.metadata {
        flags |= HeaderFlags::HAS_METADATA;
        if metadata.is_signed() {
            flags |= HeaderFlags::SIGNED;
        }
    }

    let code = Section {
        offset: to_u32(HEADER_SIZE, "header")?,
        size: to_u32(module.code.len(), "code section")?,
    };
    let data = Section {
        offset: to_u32(code.end() as usize, "code section")?,
        size: to_u32(module.data.len(), "data section")?,
    };
    let export_offset = to_u32(data.end() as usize, "data section")?;
    let export_end = export_offset as usize + table.len();
    let metadata = Section {
        offset: to_u32(export_end, "export table")?,
        size: to_u32(metadata_bytes.len(), "metadata block")?,
    };
    let total = to_u32(metadata.end() as usize, "module image")? as usize;

    let header = Header {
        format_version: FORMAT_VERSION,
        architecture: module.architecture,
        module_type: module.module_type,
        flags,
        code,
        data,
        export_offset,
        export_count: module.exports.len() as u32,
        metadata,
        checksum: section_checksum(&module.code, &module.data, &table),
    };

    let mut buf = Vec::with_capacity(total);
    header.write(&mut buf);
    buf.put_slice(&module.code);
    buf.put_slice(&module.data);
    buf.put_slice(&table);
    buf.put_slice(&metadata_bytes);
    Ok(buf)
}

/// Raw section slices of a structurally valid image
struct Layout<'a> {
    header: Header,
    code: &'a [u8],
    data: &'a [u8],
    exports: &'a [u8],
    metadata: &'a [u8],
}

fn section<'a>(
    bytes: &'a [u8],
    name: &str,
    offset: u64,
    expected_offset: u64,
    size: u64,
) -> Result<&'a [u8], FormatError> {
    if offset != expected_offset {
        return Err(FormatError::InvalidFormat(format!(
            "{} section at {} (expected {})",
            name, offset, expected_offset
        )));
    }
    let end = offset + size;
    if end > bytes.len() as u64 {
        return Err(FormatError::Truncated {
            offset: offset as usize,
            needed: size as usize,
            available: bytes.len().saturating_sub(offset as usize),
        });
    }
    Ok(&bytes[offset as usize..end as usize])
}

fn layout(bytes: &[u8]) -> Result<Layout<'_>, FormatError> {
    let header = Header::read(bytes)?;

    if header.export_count as usize > MAX_EXPORTS {
        return Err(FormatError::InvalidFormat(format!(
            "{} exports exceeds limit of {}",
            header.export_count, MAX_EXPORTS
        )));
    }

    // All arithmetic in u64: u32 offsets plus u32 sizes cannot overflow
    let code = section(bytes, "code", header.code.offset as u64, HEADER_SIZE as u64, header.code.size as u64)?;
    let data = section(bytes, "data", header.data.offset as u64, header.code.end(), header.data.size as u64)?;
    let table_size = header.export_count as u64 * EXPORT_ENTRY_SIZE as u64;
    let exports = section(bytes, "export", header.export_offset as u64, header.data.end(), table_size)?;
    let export_end = header.export_offset as u64 + table_size;
    let metadata = section(bytes, "metadata", header.metadata.offset as u64, export_end, header.metadata.size as u64)?;

    if header.metadata.end() != bytes.len() as u64 {
        return Err(FormatError::InvalidFormat(format!(
            "{} trailing bytes after metadata",
            bytes.len() as u64 - header.metadata.end()
        )));
    }
    if header.flags.contains(HeaderFlags::HAS_METADATA) != (header.metadata.size > 0) {
        return Err(FormatError::InvalidFormat(
            "metadata flag disagrees with metadata size".to_string(),
        ));
    }

    Ok(Layout {
        header,
        code,
        data,
        exports,
        metadata,
    })
}

fn parse_metadata(layout: &Layout<'_>) -> Result<Option<(ModuleMetadata, usize)>, FormatError> {
    if layout.metadata.is_empty() {
        if layout.header.flags.contains(HeaderFlags::SIGNED) {
            return Err(FormatError::InvalidFormat("signed flag without metadata".to_string()));
        }
        return Ok(None);
    }
    let (metadata, body_len) =
        ModuleMetadata::read(layout.metadata, layout.header.metadata.offset as usize)?;
    if layout.header.flags.contains(HeaderFlags::SIGNED) != metadata.is_signed() {
        return Err(FormatError::InvalidFormat(
            "signed flag disagrees with signature".to_string(),
        ));
    }
    Ok(Some((metadata, body_len)))
}

fn verify_signature(
    layout: &Layout<'_>,
    metadata: Option<&(ModuleMetadata, usize)>,
    options: &DecodeOptions<'_>,
) -> Result<(), FormatError> {
    let signed = metadata.map(|(m, _)| m.is_signed()).unwrap_or(false);
    if !signed {
        if options.require_signature {
            return Err(FormatError::SignatureInvalid("module is not signed".to_string()));
        }
        return Ok(());
    }
    let (Some(verifier), Some((meta, body_len))) = (options.verifier, metadata) else {
        return Ok(());
    };
    let digest = signing_digest(
        layout.header.checksum,
        layout.header.architecture,
        layout.header.module_type,
        &layout.metadata[..*body_len],
    );
    verifier
        .verify(&digest, &meta.signature)
        .map_err(FormatError::SignatureInvalid)
}

/// Checksum and export table of a laid-out image
fn checked_exports(layout: &Layout<'_>) -> Result<Vec<Export>, FormatError> {
    let computed = section_checksum(layout.code, layout.data, layout.exports);
    if computed != layout.header.checksum {
        return Err(FormatError::ChecksumMismatch {
            stored: layout.header.checksum,
            computed,
        });
    }

    let mut reader = Reader::at(layout.exports, layout.header.export_offset as usize);
    let mut exports = Vec::with_capacity(layout.header.export_count as usize);
    for _ in 0..layout.header.export_count {
        exports.push(Export::read(&mut reader)?);
    }
    check_exports(&exports, layout.code.len() as u64, layout.data.len() as u64)?;
    Ok(exports)
}

/// Decode and fully validate a module image
pub fn decode(bytes: &[u8], options: &DecodeOptions<'_>) -> Result<NativeModule, FormatError> {
    let layout = layout(bytes)?;
    let exports = checked_exports(&layout)?;
    let metadata = parse_metadata(&layout)?;
    verify_signature(&layout, metadata.as_ref(), options)?;

    Ok(NativeModule {
        architecture: layout.header.architecture,
        module_type: layout.header.module_type,
        code: layout.code.to_vec(),
        data: layout.data.to_vec(),
        exports,
        metadata: metadata.map(|(m, _)| m),
    })
}

/// Validate the header, section layout and metadata without verifying the
/// checksum or copying sections. Signatures are checked against the stored
/// checksum when a verifier is supplied.
pub fn inspect(bytes: &[u8], options: &DecodeOptions<'_>) -> Result<ModuleSummary, FormatError> {
    let layout = layout(bytes)?;
    let metadata = parse_metadata(&layout)?;
    verify_signature(&layout, metadata.as_ref(), options)?;
    Ok(ModuleSummary {
        header: layout.header,
        metadata: metadata.map(|(m, _)| m),
    })
}

/// Run every check [`decode`] runs, checksum included, without copying the
/// code and data sections
pub fn verify(bytes: &[u8], options: &DecodeOptions<'_>) -> Result<ModuleSummary, FormatError> {
    let layout = layout(bytes)?;
    checked_exports(&layout)?;
    let metadata = parse_metadata(&layout)?;
    verify_signature(&layout, metadata.as_ref(), options)?;
    Ok(ModuleSummary {
        header: layout.header,
        metadata: metadata.map(|(m, _)| m),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::format::signature::Secp256k1TrustAnchor;
    use crate::module::resolver::{DependencySpec, ModuleVersion, VersionConstraint};
    use proptest::prelude::*;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn mathlib() -> NativeModule {
        let mut meta = ModuleMetadata::new("mathlib", ModuleVersion::new(1, 0, 0));
        meta.license = "MIT".into();
        meta.dependencies
            .push(DependencySpec::required("libc", VersionConstraint::parse("^2.0.0").unwrap()));
        NativeModule::new(Architecture::X86_64, ModuleType::User)
            .with_code((0u8..64).collect())
            .with_data(vec![0xAA; 16])
            .with_export(Export::function("add", 0x10, 8))
            .with_export(Export::variable("pi", 0, 8))
            .with_metadata(meta)
    }

    fn keypair() -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42; 32]).unwrap();
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn test_round_trip_is_exact() {
        let module = mathlib();
        let bytes = encode(&module).unwrap();
        assert_eq!(decode(&bytes, &DecodeOptions::default()).unwrap(), module);
        let reencoded = encode(&decode(&bytes, &DecodeOptions::default()).unwrap()).unwrap();
        assert_eq!(reencoded, bytes);
    }

    #[test]
    fn test_module_without_metadata() {
        let module = NativeModule::new(Architecture::Arm64, ModuleType::Libc).with_code(vec![1, 2, 3]);
        let bytes = encode(&module).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(decode(&bytes, &DecodeOptions::default()).unwrap(), module);
    }

    #[test]
    fn test_section_mutation_is_checksum_mismatch() {
        let bytes = encode(&mathlib()).unwrap();
        // first code byte, first data byte, kind byte of the first export
        for pos in [HEADER_SIZE, HEADER_SIZE + 64, HEADER_SIZE + 80 + 128] {
            let mut tampered = bytes.clone();
            tampered[pos] ^= 0x01;
            assert!(
                matches!(
                    decode(&tampered, &DecodeOptions::default()),
                    Err(FormatError::ChecksumMismatch { .. })
                ),
                "byte {}",
                pos
            );
        }
    }

    #[test]
    fn test_truncation_detected() {
        let bytes = encode(&mathlib()).unwrap();
        for len in [0, 3, 20, HEADER_SIZE, HEADER_SIZE + 70, bytes.len() - 1] {
            let result = decode(&bytes[..len], &DecodeOptions::default());
            assert!(matches!(result, Err(FormatError::Truncated { .. })), "len {}: {:?}", len, result);
        }
    }

    #[test]
    fn test_trailing_bytes_and_moved_sections_rejected() {
        let mut bytes = encode(&mathlib()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode(&bytes, &DecodeOptions::default()),
            Err(FormatError::InvalidFormat(_))
        ));

        let mut bytes = encode(&mathlib()).unwrap();
        bytes[12] = 60; // code offset
        assert!(matches!(
            decode(&bytes, &DecodeOptions::default()),
            Err(FormatError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_export_outside_section_rejected() {
        let module = mathlib().with_export(Export::function("oob", 60, 8));
        assert!(matches!(encode(&module), Err(FormatError::InvalidFormat(_))));
        let module = mathlib().with_export(Export::function("add", 0, 1));
        assert!(matches!(encode(&module), Err(FormatError::InvalidFormat(_))));
    }

    #[test]
    fn test_signature_verified_against_anchor() {
        let (sk, pk) = keypair();
        let mut module = mathlib();
        module.sign(&sk).unwrap();
        let bytes = encode(&module).unwrap();

        let anchor = Secp256k1TrustAnchor::new(vec![pk]);
        let options = DecodeOptions::with_verifier(&anchor).require_signature();
        assert_eq!(decode(&bytes, &options).unwrap(), module);
        assert!(inspect(&bytes, &options).is_ok());

        // Metadata is outside the checksum but inside the signature
        let mut tampered = module.clone();
        tampered.metadata.as_mut().unwrap().license = "GPL".into();
        let bytes = encode(&tampered).unwrap();
        assert!(matches!(decode(&bytes, &options), Err(FormatError::SignatureInvalid(_))));
    }

    #[test]
    fn test_unsigned_rejected_when_required() {
        let bytes = encode(&mathlib()).unwrap();
        let options = DecodeOptions::default().require_signature();
        assert!(matches!(decode(&bytes, &options), Err(FormatError::SignatureInvalid(_))));
        assert!(decode(&bytes, &DecodeOptions::default()).is_ok());
    }

    #[test]
    fn test_inspect_skips_checksum() {
        let mut bytes = encode(&mathlib()).unwrap();
        bytes[HEADER_SIZE] ^= 0xFF;
        let summary = inspect(&bytes, &DecodeOptions::default()).unwrap();
        assert_eq!(summary.metadata.unwrap().name, "mathlib");
        assert_eq!(summary.header.export_count, 2);
    }

    #[test]
    fn test_verify_checks_what_decode_checks() {
        let bytes = encode(&mathlib()).unwrap();
        let summary = verify(&bytes, &DecodeOptions::default()).unwrap();
        assert_eq!(summary, inspect(&bytes, &DecodeOptions::default()).unwrap());

        let mut corrupt = bytes.clone();
        corrupt[HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            verify(&corrupt, &DecodeOptions::default()),
            Err(FormatError::ChecksumMismatch { .. })
        ));
        assert!(matches!(
            decode(&corrupt, &DecodeOptions::default()),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            code in proptest::collection::vec(any::<u8>(), 1..256),
            data in proptest::collection::vec(any::<u8>(), 0..64),
            offset in 0u64..256,
        ) {
            let offset = offset % code.len() as u64;
            let module = NativeModule::new(Architecture::Arm64, ModuleType::Vm)
                .with_code(code)
                .with_data(data)
                .with_export(Export::function("entry", offset, 0))
                .with_metadata(ModuleMetadata::new("prop", ModuleVersion::new(0, 1, 0)));
            let bytes = encode(&module).unwrap();
            prop_assert_eq!(decode(&bytes, &DecodeOptions::default()).unwrap(), module);
        }

        #[test]
        fn prop_any_section_byte_flip_detected(pos in 0usize..(64 + 16 + 2 * EXPORT_ENTRY_SIZE), bit in 0u8..8) {
            let mut bytes = encode(&mathlib()).unwrap();
            bytes[HEADER_SIZE + pos] ^= 1 << bit;
            let is_checksum_mismatch = matches!(
                decode(&bytes, &DecodeOptions::default()),
                Err(FormatError::ChecksumMismatch { .. })
            );
            prop_assert!(is_checksum_mismatch);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = decode(&bytes, &DecodeOptions::default());
            let _ = inspect(&bytes, &DecodeOptions::default());
        }
    }
}
