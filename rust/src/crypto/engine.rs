//! Versioned string encryption over two interchangeable formats.
//!
//! Every ciphertext is self-describing: `"cbc:" + base64(payload)` or
//! `"gcm:" + base64(payload)`. The decoder trusts the prefix and nothing else.
//! Values without a recognized prefix predate versioning and are decoded on a
//! best-effort basis.
//!
//! Writes are strict and reads are lenient. `encrypt` fails loudly rather than
//! ever emitting protected data unencrypted; `decrypt` always returns the best
//! renderable value so historical records stay readable.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::keys::{KeyMaterial, KeyResolver, KeyType};
use super::{cbc, gcm};

const PREFIX_LEN: usize = 4;

/// Shown to end users for any write-path failure. Never carries detail.
pub const GENERIC_WRITE_FAILURE: &str =
    "We could not securely save this information. Please try again, or contact support if the problem persists.";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("refusing to encrypt empty input")]
    EmptyInput,
    #[error("no key material configured for key type '{0}'")]
    KeyUnavailable(KeyType),
    #[error("{algorithm} failure: {reason}")]
    AlgorithmFailure {
        algorithm: Algorithm,
        reason: String,
    },
    #[error("value carries no recognized ciphertext prefix")]
    Unversioned,
    #[error("encryption worker failed: {0}")]
    WorkerFailed(String),
}

impl EngineError {
    /// Message safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::EmptyInput => "Nothing to save: the value is empty.",
            _ => GENERIC_WRITE_FAILURE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// AES-256-CBC, legacy compatibility only.
    Cbc,
    /// AES-256-GCM with PBKDF2 key derivation.
    #[default]
    Gcm,
}

impl Algorithm {
    pub fn prefix(&self) -> &'static str {
        match self {
            Algorithm::Cbc => "cbc:",
            Algorithm::Gcm => "gcm:",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Cbc => "cbc",
            Algorithm::Gcm => "gcm",
        }
    }

    /// Reads the algorithm from a ciphertext's prefix.
    pub fn detect(value: &str) -> Option<Self> {
        match value.get(..PREFIX_LEN)? {
            "cbc:" => Some(Algorithm::Cbc),
            "gcm:" => Some(Algorithm::Gcm),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prefixed, base64-encoded ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CipherText {
    algorithm: Algorithm,
    encoded: String,
}

impl CipherText {
    fn from_payload(algorithm: Algorithm, payload: &[u8]) -> Self {
        Self {
            algorithm,
            encoded: format!("{}{}", algorithm.prefix(), STANDARD.encode(payload)),
        }
    }

    /// Accepts only well-formed prefixed values.
    pub fn parse(value: &str) -> Option<Self> {
        let algorithm = Algorithm::detect(value)?;
        STANDARD.decode(&value[PREFIX_LEN..]).ok()?;
        Some(Self {
            algorithm,
            encoded: value.to_string(),
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    pub fn into_string(self) -> String {
        self.encoded
    }

    fn payload(&self) -> Option<Vec<u8>> {
        STANDARD.decode(&self.encoded[PREFIX_LEN..]).ok()
    }
}

impl fmt::Display for CipherText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl TryFrom<String> for CipherText {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CipherText::parse(&value).ok_or(EngineError::Unversioned)
    }
}

impl From<CipherText> for String {
    fn from(value: CipherText) -> Self {
        value.encoded
    }
}

/// True when the value carries a recognized ciphertext prefix.
pub fn is_encrypted(value: &str) -> bool {
    Algorithm::detect(value).is_some()
}

/// Stateless encrypt/decrypt over an injected key resolver.
pub struct EncryptionEngine {
    resolver: Arc<dyn KeyResolver>,
    default_algorithm: Algorithm,
}

impl EncryptionEngine {
    pub fn new(resolver: Arc<dyn KeyResolver>) -> Self {
        Self {
            resolver,
            default_algorithm: Algorithm::default(),
        }
    }

    pub fn with_default_algorithm(mut self, algorithm: Algorithm) -> Self {
        if algorithm == Algorithm::Cbc {
            warn!("default algorithm set to unauthenticated cbc; use only for legacy compatibility");
        }
        self.default_algorithm = algorithm;
        self
    }

    pub fn default_algorithm(&self) -> Algorithm {
        self.default_algorithm
    }

    fn key(&self, key_type: KeyType) -> Result<KeyMaterial, EngineError> {
        self.resolver
            .get_key(key_type)
            .ok_or(EngineError::KeyUnavailable(key_type))
    }

    /// Encrypts with the default algorithm.
    pub fn encrypt(&self, plaintext: &str, key_type: KeyType) -> Result<CipherText, EngineError> {
        self.encrypt_with(plaintext, key_type, self.default_algorithm)
    }

    /// Encrypts with an explicit algorithm. A failing GCM path falls back to
    /// CBC so the value is still stored encrypted.
    pub fn encrypt_with(
        &self,
        plaintext: &str,
        key_type: KeyType,
        algorithm: Algorithm,
    ) -> Result<CipherText, EngineError> {
        if plaintext.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        let key = self.key(key_type)?;

        let ciphertext = match algorithm {
            Algorithm::Gcm => {
                gcm_or_cbc(gcm::seal(&key, plaintext.as_bytes()), &key, plaintext.as_bytes(), key_type)
            }
            Algorithm::Cbc => {
                CipherText::from_payload(Algorithm::Cbc, &cbc::seal(&key, plaintext.as_bytes()))
            }
        };
        debug!(key_type = %key_type, algorithm = %ciphertext.algorithm(), "value encrypted");
        Ok(ciphertext)
    }

    /// Lenient read path. Never fails: on any problem the best renderable
    /// value is returned, which is the legacy decoding or the input itself.
    pub fn decrypt(&self, ciphertext: &str, key_type: KeyType) -> String {
        match self.decrypt_strict(ciphertext, key_type) {
            Ok(plaintext) => plaintext,
            Err(EngineError::Unversioned) => {
                debug!(key_type = %key_type, "unversioned value; attempting legacy decode");
                legacy_decode(ciphertext)
            }
            Err(err) => {
                warn!(key_type = %key_type, error = %err, "decryption failed; returning best-effort value");
                legacy_decode(ciphertext)
            }
        }
    }

    /// Strict read path. Fails on a missing key, a tampered or corrupt
    /// ciphertext, or an unversioned value.
    pub fn decrypt_strict(&self, ciphertext: &str, key_type: KeyType) -> Result<String, EngineError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let parsed = CipherText::parse(ciphertext).ok_or(EngineError::Unversioned)?;
        let algorithm = parsed.algorithm();
        let payload = parsed.payload().ok_or_else(|| EngineError::AlgorithmFailure {
            algorithm,
            reason: "payload is not valid base64".to_string(),
        })?;
        let key = self.key(key_type)?;

        let plaintext = match algorithm {
            Algorithm::Cbc => cbc::open(&key, &payload).map_err(|failure| {
                EngineError::AlgorithmFailure {
                    algorithm,
                    reason: format!("{failure:?}"),
                }
            })?,
            Algorithm::Gcm => gcm::open(&key, &payload).map_err(|failure| {
                EngineError::AlgorithmFailure {
                    algorithm,
                    reason: format!("{failure:?}"),
                }
            })?,
        };

        String::from_utf8(plaintext).map_err(|_| EngineError::AlgorithmFailure {
            algorithm,
            reason: "plaintext is not valid utf-8".to_string(),
        })
    }

    /// Re-encrypts legacy values under GCM. GCM values are returned as-is.
    pub fn upgrade(&self, value: &str, key_type: KeyType) -> Result<CipherText, EngineError> {
        match Algorithm::detect(value) {
            Some(Algorithm::Gcm) => CipherText::parse(value).ok_or(EngineError::AlgorithmFailure {
                algorithm: Algorithm::Gcm,
                reason: "payload is not valid base64".to_string(),
            }),
            Some(Algorithm::Cbc) => {
                let plaintext = self.decrypt_strict(value, key_type)?;
                self.encrypt_with(&plaintext, key_type, Algorithm::Gcm)
            }
            None => self.encrypt_with(&legacy_decode(value), key_type, Algorithm::Gcm),
        }
    }
}

/// Keeps a successful GCM seal, or seals with CBC so the value is still
/// stored encrypted.
fn gcm_or_cbc(
    sealed: Result<Vec<u8>, gcm::GcmFailure>,
    key: &KeyMaterial,
    plaintext: &[u8],
    key_type: KeyType,
) -> CipherText {
    match sealed {
        Ok(payload) => CipherText::from_payload(Algorithm::Gcm, &payload),
        Err(failure) => {
            warn!(
                key_type = %key_type,
                failure = ?failure,
                "gcm encryption failed; falling back to cbc"
            );
            CipherText::from_payload(Algorithm::Cbc, &cbc::seal(key, plaintext))
        }
    }
}

/// Best-effort decoding for values written before ciphertexts were versioned:
/// base64 of UTF-8 text. Anything else comes back unchanged.
pub fn legacy_decode(value: &str) -> String {
    let Ok(bytes) = STANDARD.decode(value.trim()) else {
        return value.to_string();
    };
    match String::from_utf8(bytes) {
        Ok(text) if !text.is_empty() && is_renderable(&text) => text,
        _ => value.to_string(),
    }
}

fn is_renderable(text: &str) -> bool {
    text.chars().all(|c| !c.is_control() || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::StaticKeyResolver;

    fn engine() -> EncryptionEngine {
        let resolver = StaticKeyResolver::new()
            .with_key(KeyType::Phi, "phi-key-material")
            .with_key(KeyType::Audit, "audit-key-material");
        EncryptionEngine::new(Arc::new(resolver))
    }

    #[test]
    fn round_trips_both_algorithms() {
        let engine = engine();
        for algorithm in [Algorithm::Cbc, Algorithm::Gcm] {
            let ciphertext = engine
                .encrypt_with("DOB 1970-01-01", KeyType::Phi, algorithm)
                .expect("encryption should succeed");
            assert!(ciphertext.as_str().starts_with(algorithm.prefix()));
            assert_eq!(ciphertext.algorithm(), algorithm);
            assert_eq!(engine.decrypt(ciphertext.as_str(), KeyType::Phi), "DOB 1970-01-01");
        }
    }

    #[test]
    fn failed_gcm_seal_falls_back_to_cbc() {
        let key = KeyMaterial::new("phi-key-material");
        let ciphertext = gcm_or_cbc(Err(gcm::GcmFailure::Seal), &key, b"MRN 0042", KeyType::Phi);
        assert_eq!(ciphertext.algorithm(), Algorithm::Cbc);
        assert!(ciphertext.as_str().starts_with("cbc:"));
        assert_eq!(
            engine().decrypt_strict(ciphertext.as_str(), KeyType::Phi).unwrap(),
            "MRN 0042"
        );
    }

    #[test]
    fn defaults_to_authenticated_path() {
        let ciphertext = engine().encrypt("x", KeyType::Phi).unwrap();
        assert_eq!(ciphertext.algorithm(), Algorithm::Gcm);
    }

    #[test]
    fn rejects_empty_input() {
        let err = engine().encrypt("", KeyType::Phi).unwrap_err();
        assert!(matches!(err, EngineError::EmptyInput));
    }

    #[test]
    fn encrypt_without_key_is_a_hard_error() {
        let engine = EncryptionEngine::new(Arc::new(StaticKeyResolver::new()));
        let err = engine.encrypt("secret", KeyType::Phi).unwrap_err();
        assert!(matches!(err, EngineError::KeyUnavailable(KeyType::Phi)));
        assert_eq!(err.user_message(), GENERIC_WRITE_FAILURE);
        assert!(!err.user_message().contains("phi"));
    }

    #[test]
    fn decrypt_without_key_returns_input() {
        let ciphertext = engine().encrypt("secret", KeyType::Phi).unwrap();
        let keyless = EncryptionEngine::new(Arc::new(StaticKeyResolver::new()));
        assert_eq!(keyless.decrypt(ciphertext.as_str(), KeyType::Phi), ciphertext.as_str());
    }

    #[test]
    fn decodes_legacy_base64_values() {
        let legacy = STANDARD.encode("Jane Doe");
        assert_eq!(engine().decrypt(&legacy, KeyType::Phi), "Jane Doe");
        assert_eq!(engine().decrypt("plain text!", KeyType::Phi), "plain text!");
    }

    #[test]
    fn strict_read_rejects_unversioned_values() {
        let err = engine().decrypt_strict("plain", KeyType::Phi).unwrap_err();
        assert!(matches!(err, EngineError::Unversioned));
    }

    #[test]
    fn wrong_key_type_is_not_silently_accepted_for_gcm() {
        let engine = engine();
        let ciphertext = engine.encrypt("audit only", KeyType::Audit).unwrap();
        assert!(engine.decrypt_strict(ciphertext.as_str(), KeyType::Phi).is_err());
        assert_eq!(engine.decrypt(ciphertext.as_str(), KeyType::Phi), ciphertext.as_str());
    }

    #[test]
    fn upgrades_legacy_values_to_gcm() {
        let engine = engine();
        let cbc = engine.encrypt_with("MRN-0042", KeyType::Phi, Algorithm::Cbc).unwrap();
        let upgraded = engine.upgrade(cbc.as_str(), KeyType::Phi).unwrap();
        assert_eq!(upgraded.algorithm(), Algorithm::Gcm);
        assert_eq!(engine.decrypt(upgraded.as_str(), KeyType::Phi), "MRN-0042");

        let from_legacy = engine.upgrade(&STANDARD.encode("MRN-0043"), KeyType::Phi).unwrap();
        assert_eq!(engine.decrypt(from_legacy.as_str(), KeyType::Phi), "MRN-0043");

        let again = engine.upgrade(upgraded.as_str(), KeyType::Phi).unwrap();
        assert_eq!(again, upgraded);
    }

    #[test]
    fn parses_only_prefixed_values() {
        assert!(CipherText::parse("gcm:AAAA").is_some());
        assert!(CipherText::parse("gcm:not base64!").is_none());
        assert!(CipherText::parse("aes:AAAA").is_none());
        assert!(CipherText::parse("gc").is_none());
        assert!(is_encrypted("cbc:AAAA"));
        assert!(!is_encrypted("hello"));
    }
}
