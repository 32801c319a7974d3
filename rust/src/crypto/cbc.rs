//! AES-256-CBC with PKCS7 padding. This is the legacy-compatible path: it
//! keeps data confidential but cannot detect tampering. A flipped ciphertext
//! bit either breaks the padding or silently decrypts to garbage.
//!
//! Payload layout: `IV (16 bytes) || ciphertext`.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use super::integrity::sha256_digest;
use super::keys::KeyMaterial;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// Failure inside the CBC path. Carries no key-dependent detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CbcFailure {
    PayloadTooShort,
    Unpad,
}

/// The AES key is the SHA-256 digest of the key material, which maps an
/// opaque string of any length onto exactly 256 bits.
fn cbc_key(material: &KeyMaterial) -> [u8; 32] {
    sha256_digest(material.as_bytes())
}

pub fn seal(material: &KeyMaterial, plaintext: &[u8]) -> Vec<u8> {
    let mut key = cbc_key(material);
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    key.zeroize();

    let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);
    payload
}

pub fn open(material: &KeyMaterial, payload: &[u8]) -> Result<Vec<u8>, CbcFailure> {
    if payload.len() < IV_LEN + BLOCK_LEN || (payload.len() - IV_LEN) % BLOCK_LEN != 0 {
        return Err(CbcFailure::PayloadTooShort);
    }
    let (iv, ciphertext) = payload.split_at(IV_LEN);
    let mut iv_bytes = [0u8; IV_LEN];
    iv_bytes.copy_from_slice(iv);

    let mut key = cbc_key(material);
    let result = Aes256CbcDec::new(&key.into(), &iv_bytes.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CbcFailure::Unpad);
    key.zeroize();
    result
}
