//! Hashing, encoding utilities, and input validation.

use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{ProvcertError, Result};

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Parse a 32-byte hash given as hex (an optional `0x` prefix is accepted).
pub fn parse_hash_hex(s: &str) -> Result<[u8; 32]> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s)
        .map_err(|e| ProvcertError::Validation(format!("invalid hash hex: {e}")))?;
    bytes.as_slice().try_into().map_err(|_| {
        ProvcertError::Validation(format!("hash must be 32 bytes, got {}", bytes.len()))
    })
}

// ---------------------------------------------------------------------------
// Base64
// ---------------------------------------------------------------------------

pub fn b64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| ProvcertError::Validation(format!("invalid base64: {e}")))
}

/// `#[serde(with = ...)]` adapter storing byte vectors as base64 strings.
pub mod serde_b64 {
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::b64_encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        super::b64_decode(&text).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Entity identities: starts with alphanumeric, then up to 127 more
/// alphanumeric / hyphen / dot / underscore / colon characters.
static ENTITY_ID_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.:]{0,127}$").unwrap()
});

/// Maximum length of a batch origin tag, in bytes.
pub const MAX_ORIGIN_LEN: usize = 256;

pub fn validate_entity_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ProvcertError::Validation("entity id must not be empty".into()));
    }
    if !ENTITY_ID_RE.is_match(id) {
        return Err(ProvcertError::Validation(format!(
            "invalid entity id '{id}': 1-128 chars, alphanumeric/hyphen/dot/underscore/colon"
        )));
    }
    Ok(())
}

pub fn validate_origin(origin: &str) -> Result<()> {
    if origin.trim().is_empty() {
        return Err(ProvcertError::Validation("batch origin must not be empty".into()));
    }
    if origin.len() > MAX_ORIGIN_LEN {
        return Err(ProvcertError::Validation(format!(
            "batch origin exceeds {MAX_ORIGIN_LEN} bytes"
        )));
    }
    if origin.chars().any(char::is_control) {
        return Err(ProvcertError::Validation(
            "batch origin contains control characters".into(),
        ));
    }
    Ok(())
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(ProvcertError::Validation(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(ProvcertError::Validation(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Canonicalize a path if it exists, otherwise return it unchanged.
pub fn canonicalize_if_exists(p: &Path, label: &str) -> Result<PathBuf> {
    validate_path(p, label)?;
    if p.exists() {
        std::fs::canonicalize(p)
            .map_err(|e| ProvcertError::Validation(format!("{label} path invalid: {e}")))
    } else {
        Ok(p.to_path_buf())
    }
}

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("PROVCERT_GIT_HASH");
pub const BUILD_TS: &str = env!("PROVCERT_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("provcert v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        let digest = sha256(b"");
        assert_eq!(
            hex::encode(digest),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn parse_hash_hex_accepts_prefix() {
        let h = sha256(b"hello");
        let hex_str = format!("0x{}", hex::encode(h));
        assert_eq!(parse_hash_hex(&hex_str).unwrap(), h);
        assert!(parse_hash_hex("abcd").is_err());
        assert!(parse_hash_hex("zz").is_err());
    }

    #[test]
    fn b64_decode_invalid() {
        assert!(b64_decode("not!!valid!!base64").is_err());
    }

    #[test]
    fn valid_entity_ids() {
        assert!(validate_entity_id("inspector-01").is_ok());
        assert!(validate_entity_id("did:example:123").is_ok());
        assert!(validate_entity_id(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn invalid_entity_ids() {
        assert!(validate_entity_id("").is_err());
        assert!(validate_entity_id("-leading").is_err());
        assert!(validate_entity_id("has space").is_err());
        assert!(validate_entity_id(&"A".repeat(200)).is_err());
    }

    #[test]
    fn origin_validation() {
        assert!(validate_origin("South_Africa").is_ok());
        assert!(validate_origin("Kimberley, Northern Cape").is_ok());
        assert!(validate_origin("   ").is_err());
        assert!(validate_origin("line\nbreak").is_err());
        assert!(validate_origin(&"x".repeat(MAX_ORIGIN_LEN + 1)).is_err());
    }

    #[test]
    fn version_string_non_empty() {
        assert!(version_string().contains("provcert"));
    }
}
