//! Public key fingerprints for logs and display.
//!
//! fingerprint = hex(SHA-256(raw public key)); displays use a short prefix.

use sha2::{Digest, Sha256};

/// Compute the full hex-encoded SHA-256 fingerprint of a raw public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(hash)
}

/// First `len` hex characters of a fingerprint (never fewer than 4).
pub fn short_fingerprint(fp: &str, len: usize) -> &str {
    let len = len.max(4).min(fp.len());
    &fp[..len]
}
