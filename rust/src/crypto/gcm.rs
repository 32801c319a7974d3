//! AES-256-GCM with a per-call PBKDF2-derived key.
//!
//! Payload layout: `salt (16) || IV (12) || ciphertext || tag (16)`.
//!
//! The AES key is derived from the key material with PBKDF2-HMAC-SHA256 and a
//! fresh salt on every call, then wiped. Nothing derived outlives the call.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use super::keys::KeyMaterial;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const PBKDF2_ITERATIONS: u32 = 100_000;
const DERIVED_KEY_LEN: usize = 32;

/// Failure inside the GCM path. Carries no key-dependent detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcmFailure {
    Derivation,
    Seal,
    PayloadTooShort,
    Authentication,
}

fn derive_key(material: &KeyMaterial, salt: &[u8]) -> Result<[u8; DERIVED_KEY_LEN], GcmFailure> {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(material.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key)
        .map_err(|_| GcmFailure::Derivation)?;
    Ok(key)
}

fn cipher_for(material: &KeyMaterial, salt: &[u8]) -> Result<Aes256Gcm, GcmFailure> {
    let mut key = derive_key(material, salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| GcmFailure::Derivation);
    key.zeroize();
    cipher
}

pub fn seal(material: &KeyMaterial, plaintext: &[u8]) -> Result<Vec<u8>, GcmFailure> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);

    let cipher = cipher_for(material, &salt)?;
    let ciphertext_and_tag = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| GcmFailure::Seal)?;

    let mut payload = Vec::with_capacity(SALT_LEN + IV_LEN + ciphertext_and_tag.len());
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext_and_tag);
    Ok(payload)
}

pub fn open(material: &KeyMaterial, payload: &[u8]) -> Result<Vec<u8>, GcmFailure> {
    if payload.len() < SALT_LEN + IV_LEN + TAG_LEN {
        return Err(GcmFailure::PayloadTooShort);
    }
    let (salt, rest) = payload.split_at(SALT_LEN);
    let (iv, ciphertext_and_tag) = rest.split_at(IV_LEN);

    let cipher = cipher_for(material, salt)?;
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext_and_tag)
        .map_err(|_| GcmFailure::Authentication)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_salt_iv_and_tag() {
        let key = KeyMaterial::new("gcm-key");
        let payload = seal(&key, b"abc").expect("seal should succeed");
        assert_eq!(payload.len(), SALT_LEN + IV_LEN + 3 + TAG_LEN);
        assert_eq!(open(&key, &payload).expect("open should succeed"), b"abc");
    }

    #[test]
    fn fresh_salt_per_call() {
        let key = KeyMaterial::new("gcm-key");
        let first = seal(&key, b"x").unwrap();
        let second = seal(&key, b"x").unwrap();
        assert_ne!(first[..SALT_LEN], second[..SALT_LEN]);
    }

    #[test]
    fn any_flipped_bit_fails_authentication() {
        let key = KeyMaterial::new("gcm-key");
        let payload = seal(&key, b"lab result: negative").unwrap();
        for index in [0, SALT_LEN, SALT_LEN + IV_LEN, payload.len() - 1] {
            let mut tampered = payload.clone();
            tampered[index] ^= 0x01;
            assert!(open(&key, &tampered).is_err(), "byte {index} flip went unnoticed");
        }
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let payload = seal(&KeyMaterial::new("right"), b"data").unwrap();
        assert_eq!(
            open(&KeyMaterial::new("wrong"), &payload),
            Err(GcmFailure::Authentication)
        );
    }

    #[test]
    fn rejects_truncated_payloads() {
        let key = KeyMaterial::new("gcm-key");
        assert_eq!(open(&key, &[0u8; 10]), Err(GcmFailure::PayloadTooShort));
    }
}
