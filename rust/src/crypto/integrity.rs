//! Integrity helpers for hashing and digest comparison. These utilities are
//! kept separate from the ciphers so checksums and token checks cannot be
//! confused with encryption.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Produces a raw SHA-256 digest of the provided bytes.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Returns the lowercase hexadecimal representation of a SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_digest(data))
}

/// Compares two hex digests in constant time. Case-insensitive; malformed hex
/// never matches.
pub fn hex_digests_match(left: &str, right: &str) -> bool {
    let (Ok(left), Ok(right)) = (
        hex::decode(left.trim().to_ascii_lowercase()),
        hex::decode(right.trim().to_ascii_lowercase()),
    ) else {
        return false;
    };
    left.len() == right.len() && bool::from(left.as_slice().ct_eq(right.as_slice()))
}
