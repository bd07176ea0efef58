//! Deterministic content hashes for provenance and environment fingerprints.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Full SHA-256 of `content`, hex encoded.
pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Hash of the canonical JSON form of `value`.
///
/// Object keys are emitted in sorted order, so equal values hash equally no
/// matter how their maps were built.
pub fn content_hash<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let canonical = serde_json::to_value(value)?;
    let text = serde_json::to_string(&canonical)?;
    Ok(sha256_hex(text.as_bytes()))
}

/// Normalized dependency set: trimmed, non-empty, sorted, deduplicated.
pub fn normalize_dependencies<S: AsRef<str>>(deps: &[S]) -> Vec<String> {
    let mut normalized: Vec<String> = deps
        .iter()
        .map(|dep| dep.as_ref().trim().to_string())
        .filter(|dep| !dep.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    normalized
}

/// Fingerprint of a dependency set; independent of declaration order.
pub fn fingerprint<S: AsRef<str>>(deps: &[S]) -> String {
    sha256_hex(normalize_dependencies(deps).join("\n").as_bytes())
}
