//! Record-level helpers that apply the engine to named fields of a JSON
//! object. Non-string and absent fields are skipped.

use serde_json::{Map, Value};
use tracing::warn;

use super::engine::{is_encrypted, EncryptionEngine, EngineError};
use super::keys::KeyType;

/// Substituted for a field that fails to decrypt, so the rest of the record
/// stays readable.
pub const DECRYPTION_FAILED_MARKER: &str = "[DECRYPTION_FAILED]";

/// Encrypts the named string fields in place. Empty strings and values that
/// are already ciphertexts are left alone. Any failure aborts the whole
/// record: a partially encrypted record must never be written.
pub fn encrypt_fields(
    engine: &EncryptionEngine,
    record: &mut Map<String, Value>,
    fields: &[&str],
    key_type: KeyType,
) -> Result<(), EngineError> {
    let mut encrypted = Vec::with_capacity(fields.len());
    for field in fields {
        let Some(Value::String(plaintext)) = record.get(*field) else {
            continue;
        };
        if plaintext.is_empty() || is_encrypted(plaintext) {
            continue;
        }
        let ciphertext = engine.encrypt(plaintext, key_type)?;
        encrypted.push((field.to_string(), ciphertext.into_string()));
    }
    for (field, ciphertext) in encrypted {
        record.insert(field, Value::String(ciphertext));
    }
    Ok(())
}

/// Decrypts the named string fields in place. A field that carries a
/// ciphertext but cannot be opened becomes [`DECRYPTION_FAILED_MARKER`];
/// unversioned strings get the engine's best-effort legacy decoding.
pub fn decrypt_fields(
    engine: &EncryptionEngine,
    record: &mut Map<String, Value>,
    fields: &[&str],
    key_type: KeyType,
) {
    for field in fields {
        let Some(Value::String(value)) = record.get_mut(*field) else {
            continue;
        };
        if !is_encrypted(value) {
            *value = engine.decrypt(value, key_type);
            continue;
        }
        match engine.decrypt_strict(value, key_type) {
            Ok(plaintext) => *value = plaintext,
            Err(err) => {
                warn!(field = %field, key_type = %key_type, error = %err, "field decryption failed");
                *value = DECRYPTION_FAILED_MARKER.to_string();
            }
        }
    }
}
