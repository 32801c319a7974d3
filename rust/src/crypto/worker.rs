//! Offloads engine calls onto tokio's blocking pool. GCM key derivation is
//! deliberately slow and must not stall an async request loop.

use std::sync::Arc;

use super::engine::{Algorithm, CipherText, EncryptionEngine, EngineError};
use super::keys::KeyType;

pub async fn encrypt_blocking(
    engine: Arc<EncryptionEngine>,
    plaintext: String,
    key_type: KeyType,
) -> Result<CipherText, EngineError> {
    tokio::task::spawn_blocking(move || engine.encrypt(&plaintext, key_type))
        .await
        .map_err(|e| EngineError::WorkerFailed(format!("{e}")))?
}

pub async fn encrypt_blocking_with(
    engine: Arc<EncryptionEngine>,
    plaintext: String,
    key_type: KeyType,
    algorithm: Algorithm,
) -> Result<CipherText, EngineError> {
    tokio::task::spawn_blocking(move || engine.encrypt_with(&plaintext, key_type, algorithm))
        .await
        .map_err(|e| EngineError::WorkerFailed(format!("{e}")))?
}

/// Lenient like [`EncryptionEngine::decrypt`]. If the worker itself dies the
/// input is handed back unchanged.
pub async fn decrypt_blocking(engine: Arc<EncryptionEngine>, ciphertext: String, key_type: KeyType) -> String {
    let fallback = ciphertext.clone();
    match tokio::task::spawn_blocking(move || engine.decrypt(&ciphertext, key_type)).await {
        Ok(plaintext) => plaintext,
        Err(err) => {
            tracing::error!(error = %err, "decryption worker failed");
            fallback
        }
    }
}
