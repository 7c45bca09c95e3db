//! Recoverable secp256k1 signing, identity derivation and the canonical
//! attestation message.
//!
//! Signatures are 65 bytes: `r || s || v`, where `v` is the recovery id
//! (`0`/`1`, or `27`/`28` as produced by Ethereum-style wallets).  Recovery
//! yields the signer's public key, and an identity handle is the SHA-256 of
//! that key's uncompressed SEC1 encoding, hex-encoded.

use std::path::Path;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};

use crate::error::{OptionExt as _, ProvcertError, Result, ResultExt as _};
use crate::model::BatchId;
use crate::util;

/// Length of a recoverable signature in bytes.
pub const RECOVERABLE_SIGNATURE_LEN: usize = 65;

/// Offset some wallets add to the recovery id.
const LEGACY_V_OFFSET: u8 = 27;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerDescriptor {
    /// Identity handle derived from the public key.
    pub identity: String,
    /// Human-readable descriptor (e.g., "secp256k1-ecdsa/pkcs8-pem").
    pub kind: String,
}

/// Trait boundary for all signer implementations.
///
/// Issuers keep their private keys; the ledger only ever sees the output of
/// [`Signer::sign_prehash`].
pub trait Signer {
    fn descriptor(&self) -> &SignerDescriptor;
    fn sign_prehash(&self, hash: &[u8; 32]) -> Result<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// secp256k1 signer
// ---------------------------------------------------------------------------

pub struct Secp256k1Signer {
    signing_key: SigningKey,
    descriptor: SignerDescriptor,
}

impl std::fmt::Debug for Secp256k1Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secp256k1Signer")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

impl Secp256k1Signer {
    pub fn new(signing_key: SigningKey, kind: &str) -> Self {
        let identity = identity_of(signing_key.verifying_key());
        Self {
            signing_key,
            descriptor: SignerDescriptor {
                identity,
                kind: kind.to_string(),
            },
        }
    }

    /// A fresh in-memory key.
    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut rand_core::OsRng), "secp256k1-ecdsa/ephemeral")
    }

    pub fn from_key_pem(key_pem_path: &Path) -> Result<Self> {
        let key_pem = std::fs::read_to_string(key_pem_path)
            // Key paths stay out of error strings.
            .map_err(|e| ProvcertError::Signing(format!("read key pem failed: {e}")))?;
        let signing_key = SigningKey::from_pkcs8_pem(&key_pem)
            .ctx_signing("parse secp256k1 PKCS#8 private key")?;
        Ok(Self::new(signing_key, "secp256k1-ecdsa/pkcs8-pem"))
    }

    pub fn identity(&self) -> &str {
        &self.descriptor.identity
    }
}

impl Signer for Secp256k1Signer {
    fn descriptor(&self) -> &SignerDescriptor {
        &self.descriptor
    }

    fn sign_prehash(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        Ok(sign_recoverable(&self.signing_key, hash)?.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Identities and recovery
// ---------------------------------------------------------------------------

pub fn identity_of(vk: &VerifyingKey) -> String {
    util::sha256_hex(vk.to_encoded_point(false).as_bytes())
}

pub fn sign_recoverable(sk: &SigningKey, hash: &[u8; 32]) -> Result<[u8; RECOVERABLE_SIGNATURE_LEN]> {
    let (sig, recid) = sk
        .sign_prehash_recoverable(hash)
        .ctx_signing("sign prehash")?;
    let mut out = [0u8; RECOVERABLE_SIGNATURE_LEN];
    out[..64].copy_from_slice(&sig.to_bytes());
    out[64] = recid.to_byte();
    Ok(out)
}

/// Recover the identity whose key produced `signature` over `hash`.
pub fn recover_identity(hash: &[u8; 32], signature: &[u8]) -> Result<String> {
    if signature.len() != RECOVERABLE_SIGNATURE_LEN {
        return Err(ProvcertError::Signing(format!(
            "recoverable signature must be {RECOVERABLE_SIGNATURE_LEN} bytes, got {}",
            signature.len()
        )));
    }
    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - LEGACY_V_OFFSET,
        other => {
            return Err(ProvcertError::Signing(format!(
                "recovery byte must be 0, 1, 27 or 28, got {other}"
            )))
        }
    };
    let recid = RecoveryId::from_byte(v).required_signing("invalid recovery id")?;
    let sig = Signature::from_slice(&signature[..64]).ctx_signing("parse ECDSA signature")?;
    let vk = VerifyingKey::recover_from_prehash(hash, &sig, recid)
        .ctx_signing("recover public key")?;
    Ok(identity_of(&vk))
}

// ---------------------------------------------------------------------------
// Canonical attestation message (deterministic, order-stable)
// ---------------------------------------------------------------------------

pub fn attestation_message(issuer: &str, batch_id: BatchId, prover: &str, status: &str) -> Vec<u8> {
    let mut msg = String::new();
    msg.push_str("PROVCERT ATTESTATION v1\n");
    msg.push_str(&format!("issuer={issuer}\n"));
    msg.push_str(&format!("batch_id={batch_id}\n"));
    msg.push_str(&format!("prover={prover}\n"));
    msg.push_str(&format!("status={status}\n"));
    msg.into_bytes()
}

/// SHA-256 of [`attestation_message`]; this is what issuers sign.
pub fn attestation_hash(issuer: &str, batch_id: BatchId, prover: &str, status: &str) -> [u8; 32] {
    util::sha256(&attestation_message(issuer, batch_id, prover, status))
}

// ---------------------------------------------------------------------------
// Key generation
// ---------------------------------------------------------------------------

/// Generate a secp256k1 key.  Writes `signing_key.pem` (PKCS#8) and
/// `identity.txt` to `out_dir` and returns the identity.
pub fn keygen_secp256k1(out_dir: &Path) -> Result<String> {
    use k256::pkcs8::EncodePrivateKey as _;

    std::fs::create_dir_all(out_dir)
        .map_err(|e| ProvcertError::Signing(format!("create {}: {e}", out_dir.display())))?;

    let sk = SigningKey::random(&mut rand_core::OsRng);
    let pem = sk
        .to_pkcs8_pem(Default::default())
        .ctx_signing("encode pkcs8 pem")?;
    let identity = identity_of(sk.verifying_key());

    let key_path = out_dir.join("signing_key.pem");
    std::fs::write(&key_path, pem.as_bytes())
        .map_err(|e| ProvcertError::Signing(format!("write {}: {e}", key_path.display())))?;

    let id_path = out_dir.join("identity.txt");
    std::fs::write(&id_path, format!("{identity}\n"))
        .map_err(|e| ProvcertError::Signing(format!("write {}: {e}", id_path.display())))?;

    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn recovers_signer_identity() {
        let signer = Secp256k1Signer::random();
        let hash = attestation_hash("inspector", 0, "supplier", "SUPPLIED");
        let sig = signer.sign_prehash(&hash).unwrap();
        assert_eq!(sig.len(), RECOVERABLE_SIGNATURE_LEN);
        assert_eq!(recover_identity(&hash, &sig).unwrap(), signer.identity());
    }

    #[test]
    fn different_hash_recovers_different_identity() {
        let signer = Secp256k1Signer::random();
        let hash = attestation_hash("inspector", 0, "supplier", "SUPPLIED");
        let other = attestation_hash("inspector", 1, "supplier", "SUPPLIED");
        let sig = signer.sign_prehash(&hash).unwrap();
        // Recovery over the wrong hash either fails or yields some other key.
        if let Ok(id) = recover_identity(&other, &sig) {
            assert_ne!(id, signer.identity());
        }
    }

    #[test]
    fn legacy_recovery_byte_accepted() {
        let signer = Secp256k1Signer::random();
        let hash = util::sha256(b"legacy v");
        let mut sig = signer.sign_prehash(&hash).unwrap();
        sig[64] += LEGACY_V_OFFSET;
        assert_eq!(recover_identity(&hash, &sig).unwrap(), signer.identity());
    }

    #[test]
    fn out_of_range_recovery_bytes_rejected() {
        let signer = Secp256k1Signer::random();
        let hash = util::sha256(b"v range");
        let good = signer.sign_prehash(&hash).unwrap();
        for v in [2u8, 3, 26, 29, 30, 255] {
            let mut sig = good.clone();
            sig[64] = v;
            let err = recover_identity(&hash, &sig).unwrap_err();
            assert!(err.to_string().contains("recovery byte"), "v={v}: {err}");
        }
    }

    #[test]
    fn malformed_signatures_rejected() {
        let hash = util::sha256(b"x");
        assert!(recover_identity(&hash, &[0u8; 64]).is_err());
        assert!(recover_identity(&hash, &[0u8; 65]).is_err());
        let mut bad_v = [1u8; 65];
        bad_v[64] = 9;
        assert!(recover_identity(&hash, &bad_v).is_err());
    }

    #[test]
    fn keygen_then_load_pem() {
        let dir = tempdir().unwrap();
        let identity = keygen_secp256k1(dir.path()).unwrap();
        let signer = Secp256k1Signer::from_key_pem(&dir.path().join("signing_key.pem")).unwrap();
        assert_eq!(signer.identity(), identity);
        let written = std::fs::read_to_string(dir.path().join("identity.txt")).unwrap();
        assert_eq!(written.trim(), identity);
    }

    #[test]
    fn missing_key_file_rejected() {
        let err = Secp256k1Signer::from_key_pem(Path::new("missing_key.pem")).unwrap_err();
        assert!(err.to_string().contains("read key pem"));
    }

    #[test]
    fn attestation_message_binds_every_field() {
        let base = attestation_message("i", 0, "p", "SUPPLIED");
        assert_eq!(base, attestation_message("i", 0, "p", "SUPPLIED"));
        assert_ne!(base, attestation_message("i", 1, "p", "SUPPLIED"));
        assert_ne!(base, attestation_message("p", 0, "i", "SUPPLIED"));
        assert_ne!(base, attestation_message("i", 0, "p", "ROUGH_EXPORT"));
    }
}
