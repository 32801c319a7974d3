//! Key resolution. Key material is opaque to this crate: it arrives from the
//! environment, a key file, or an embedding application, scoped by key type.
//! `KeyMaterial` never prints its contents and is wiped when dropped.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("unknown key type: {0}")]
    UnknownKeyType(String),
}

/// The data class a key protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Phi,
    Audit,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Phi => "phi",
            KeyType::Audit => "audit",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "phi" => Ok(KeyType::Phi),
            "audit" => Ok(KeyType::Audit),
            other => Err(KeyError::UnknownKeyType(other.to_string())),
        }
    }
}

/// Opaque key material. The bytes are zeroed on drop.
#[derive(Clone)]
pub struct KeyMaterial {
    secret: String,
}

impl KeyMaterial {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.secret.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Supplies key material per key type. `None` means no key is configured.
pub trait KeyResolver: Send + Sync {
    fn get_key(&self, key_type: KeyType) -> Option<KeyMaterial>;
}

/// In-memory resolver for embedding applications and tests.
#[derive(Default)]
pub struct StaticKeyResolver {
    keys: HashMap<KeyType, KeyMaterial>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_type: KeyType, material: impl Into<String>) -> Self {
        self.keys.insert(key_type, KeyMaterial::new(material));
        self
    }
}

impl KeyResolver for StaticKeyResolver {
    fn get_key(&self, key_type: KeyType) -> Option<KeyMaterial> {
        self.keys
            .get(&key_type)
            .filter(|material| !material.is_empty())
            .cloned()
    }
}

/// Reads `PHI_GUARD_PHI_KEY` / `PHI_GUARD_AUDIT_KEY` style variables.
pub struct EnvKeyResolver {
    prefix: String,
}

impl EnvKeyResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, key_type: KeyType) -> String {
        format!("{}_{}_KEY", self.prefix, key_type.as_str().to_ascii_uppercase())
    }
}

impl Default for EnvKeyResolver {
    fn default() -> Self {
        Self::new("PHI_GUARD")
    }
}

impl KeyResolver for EnvKeyResolver {
    fn get_key(&self, key_type: KeyType) -> Option<KeyMaterial> {
        read_env(&self.variable_for(key_type))
    }
}

/// Where a single key type's material lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    /// Environment variable holding the key material.
    Env(String),
    /// File whose trimmed contents are the key material.
    Path(PathBuf),
}

/// Resolver built from configuration. Sources are re-read on every call so a
/// key replaced outside the process is picked up without a restart.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredKeyResolver {
    sources: HashMap<KeyType, KeySource>,
}

impl ConfiguredKeyResolver {
    pub fn new(sources: HashMap<KeyType, KeySource>) -> Self {
        Self { sources }
    }
}

impl KeyResolver for ConfiguredKeyResolver {
    fn get_key(&self, key_type: KeyType) -> Option<KeyMaterial> {
        match self.sources.get(&key_type)? {
            KeySource::Env(var) => read_env(var),
            KeySource::Path(path) => match fs::read_to_string(path) {
                Ok(mut content) => {
                    let material = KeyMaterial::new(content.trim());
                    content.zeroize();
                    (!material.is_empty()).then_some(material)
                }
                Err(err) => {
                    tracing::warn!(
                        key_type = %key_type,
                        path = %path.display(),
                        error = %err,
                        "key file unreadable"
                    );
                    None
                }
            },
        }
    }
}

fn read_env(var: &str) -> Option<KeyMaterial> {
    std::env::var(var)
        .ok()
        .map(KeyMaterial::new)
        .filter(|material| !material.is_empty())
}
