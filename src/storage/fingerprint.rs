//! Deterministic SHA-256 fingerprints used for cache keys and dedup.

use sha2::{Digest, Sha256};

/// Separator between hashed parts so `("ab", "c")` and `("a", "bc")` differ.
const PART_SEPARATOR: u8 = 0x1f;

/// Computes the hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hashes an ordered list of string parts.
pub fn fingerprint_parts(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([PART_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}

/// Cache key of an analysis result: the (artifact, parameters) pair.
pub fn result_key(artifact_fingerprint: &str, params_fingerprint: &str) -> String {
    fingerprint_parts(&["result", artifact_fingerprint, params_fingerprint])
}

/// Whether `s` has the shape of a fingerprint produced by this module.
pub fn is_fingerprint(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
