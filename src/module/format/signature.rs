//! Module signatures
//!
//! The signed digest is SHA-256 over a domain tag, the section checksum, the
//! architecture and module type bytes, and the metadata block without its
//! signature field. Verification is pluggable through [`SignatureVerifier`];
//! [`Secp256k1TrustAnchor`] accepts compact ECDSA signatures from any of a
//! set of trusted public keys.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, VerifyOnly};
use sha2::{Digest, Sha256};

use super::metadata::ModuleMetadata;
use super::{Architecture, ModuleType};
use crate::module::error::FormatError;

const DOMAIN_TAG: &[u8] = b"NATV-SIG\0";

/// Trust anchor contract used by the codec
pub trait SignatureVerifier: Send + Sync {
    /// Verify `signature` over `digest`; `Err` carries the rejection reason
    fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<(), String>;
}

/// Compute the digest a module signature covers
pub fn signing_digest(
    checksum: u64,
    architecture: Architecture,
    module_type: ModuleType,
    metadata_body: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update(checksum.to_le_bytes());
    hasher.update([architecture as u8, module_type as u8]);
    hasher.update(metadata_body);
    hasher.finalize().into()
}

/// Digest for metadata that has not been encoded yet
pub(crate) fn digest_for(
    checksum: u64,
    architecture: Architecture,
    module_type: ModuleType,
    metadata: &ModuleMetadata,
) -> Result<[u8; 32], FormatError> {
    let mut body = Vec::new();
    metadata.write_body(&mut body)?;
    Ok(signing_digest(checksum, architecture, module_type, &body))
}

/// secp256k1 ECDSA trust anchor over compact 64-byte signatures
pub struct Secp256k1TrustAnchor {
    secp: Secp256k1<VerifyOnly>,
    keys: Vec<PublicKey>,
}

impl Secp256k1TrustAnchor {
    pub fn new(keys: Vec<PublicKey>) -> Self {
        Self {
            secp: Secp256k1::verification_only(),
            keys,
        }
    }

    /// Build from hex-encoded compressed or uncompressed public keys
    pub fn from_hex_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, String> {
        let parsed = keys
            .iter()
            .map(|k| {
                let raw = hex::decode(k.as_ref()).map_err(|e| format!("invalid key hex: {}", e))?;
                PublicKey::from_slice(&raw).map_err(|e| format!("invalid public key: {}", e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(parsed))
    }

    pub fn keys(&self) -> &[PublicKey] {
        &self.keys
    }
}

impl SignatureVerifier for Secp256k1TrustAnchor {
    fn verify(&self, digest: &[u8; 32], signature: &[u8]) -> Result<(), String> {
        let message = Message::from_digest_slice(digest)
            .map_err(|e| format!("invalid digest: {}", e))?;
        let signature = Signature::from_compact(signature)
            .map_err(|e| format!("malformed signature: {}", e))?;

        if self
            .keys
            .iter()
            .any(|key| self.secp.verify_ecdsa(&message, &signature, key).is_ok())
        {
            Ok(())
        } else {
            Err("no trusted key matches".to_string())
        }
    }
}

/// Produce a compact secp256k1 signature over `digest`
pub fn sign_digest(digest: &[u8; 32], secret_key: &SecretKey) -> Result<[u8; 64], FormatError> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest_slice(digest)
        .map_err(|e| FormatError::SignatureInvalid(e.to_string()))?;
    Ok(secp.sign_ecdsa(&message, secret_key).serialize_compact())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(seed: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    #[test]
    fn test_anchor_accepts_trusted_key() {
        let (sk, pk) = keypair(0x11);
        let digest = signing_digest(42, Architecture::X86_64, ModuleType::User, b"body");
        let sig = sign_digest(&digest, &sk).unwrap();
        let anchor = Secp256k1TrustAnchor::new(vec![pk]);
        assert!(anchor.verify(&digest, &sig).is_ok());
    }

    #[test]
    fn test_anchor_rejects_other_key_and_other_digest() {
        let (sk, _) = keypair(0x11);
        let (_, other) = keypair(0x22);
        let digest = signing_digest(42, Architecture::X86_64, ModuleType::User, b"body");
        let sig = sign_digest(&digest, &sk).unwrap();
        assert!(Secp256k1TrustAnchor::new(vec![other]).verify(&digest, &sig).is_err());

        let (_, pk) = keypair(0x11);
        let tampered = signing_digest(43, Architecture::X86_64, ModuleType::User, b"body");
        assert!(Secp256k1TrustAnchor::new(vec![pk]).verify(&tampered, &sig).is_err());
    }

    #[test]
    fn test_hex_keys() {
        let (_, pk) = keypair(0x33);
        let anchor = Secp256k1TrustAnchor::from_hex_keys(&[hex::encode(pk.serialize())]).unwrap();
        assert_eq!(anchor.keys(), &[pk]);
        assert!(Secp256k1TrustAnchor::from_hex_keys(&["zz"]).is_err());
    }
}
