//! Cryptography for data at rest. Each submodule has a single
//! responsibility: key resolution, one module per cipher, the versioned
//! engine on top, record-level helpers and integrity hashing.

pub mod cbc;
pub mod engine;
pub mod fields;
pub mod gcm;
pub mod integrity;
pub mod keys;
pub mod worker;

pub use engine::{is_encrypted, Algorithm, CipherText, EncryptionEngine, EngineError};
pub use keys::{KeyMaterial, KeyResolver, KeyType};
