//! Configuration loader. The file names where key material lives but never
//! holds the key material itself; keys stay in the environment or in key
//! files readable only by the service.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

use crate::crypto::keys::{ConfiguredKeyResolver, EnvKeyResolver, KeySource};
use crate::crypto::{Algorithm, EncryptionEngine, KeyResolver, KeyType};
use crate::lockout::AttemptPolicy;

/// Selects the config file when no path is given explicitly.
pub const CONFIG_PATH_ENV: &str = "PHI_GUARD_CONFIG";
/// Overrides `log_level` from the file.
pub const LOG_LEVEL_ENV: &str = "PHI_GUARD_LOG_LEVEL";
const DEFAULT_CONFIG_PATH: &str = "phi-guard.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file unreadable: {0}")]
    Io(String),
    #[error("config parse failed: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LockoutConfig {
    pub max_attempts: u32,
    pub attempt_window_secs: i64,
    pub block_duration_secs: i64,
    pub retention_secs: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_window_secs: 30 * 60,
            block_duration_secs: 60 * 60,
            retention_secs: 24 * 60 * 60,
        }
    }
}

impl LockoutConfig {
    pub fn policy(&self) -> Result<AttemptPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("lockout.max_attempts must be at least 1".to_string()));
        }
        Ok(AttemptPolicy {
            max_attempts: self.max_attempts,
            attempt_window: lockout_duration("attempt_window_secs", self.attempt_window_secs)?,
            block_duration: lockout_duration("block_duration_secs", self.block_duration_secs)?,
            retention: lockout_duration("retention_secs", self.retention_secs)?,
        })
    }
}

/// Longest accepted lockout duration: one year.
pub const MAX_LOCKOUT_SECS: i64 = 366 * 24 * 60 * 60;

fn lockout_duration(name: &str, secs: i64) -> Result<Duration, ConfigError> {
    if secs <= 0 || secs > MAX_LOCKOUT_SECS {
        return Err(ConfigError::Invalid(format!(
            "lockout.{name} must be between 1 and {MAX_LOCKOUT_SECS} seconds, got {secs}"
        )));
    }
    Duration::try_seconds(secs)
        .ok_or_else(|| ConfigError::Invalid(format!("lockout.{name} is out of range")))
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub default_algorithm: Algorithm,
    /// Fail reads hard instead of returning a best-effort value.
    pub strict_reads: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub keys: HashMap<KeyType, KeySource>,
    pub lockout: LockoutConfig,
    pub engine: EngineConfig,
    pub store_path: Option<PathBuf>,
    pub audit_log_path: Option<PathBuf>,
    pub admin_token_sha256: Option<String>,
    pub log_level: String,
    pub log_format: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            lockout: LockoutConfig::default(),
            engine: EngineConfig::default(),
            store_path: None,
            audit_log_path: None,
            admin_token_sha256: None,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl GuardConfig {
    /// Keys named in the file, or `PHI_GUARD_<TYPE>_KEY` variables when the
    /// file names none.
    pub fn key_resolver(&self) -> Arc<dyn KeyResolver> {
        if self.keys.is_empty() {
            Arc::new(EnvKeyResolver::default())
        } else {
            Arc::new(ConfiguredKeyResolver::new(self.keys.clone()))
        }
    }

    pub fn engine(&self) -> EncryptionEngine {
        EncryptionEngine::new(self.key_resolver())
            .with_default_algorithm(self.engine.default_algorithm)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.lockout.policy()?;
        if !matches!(self.log_format.as_str(), "text" | "json") {
            return Err(ConfigError::Invalid(format!(
                "log_format must be \"text\" or \"json\", got \"{}\"",
                self.log_format
            )));
        }
        if let Some(hash) = &self.admin_token_sha256 {
            let valid = hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit());
            if !valid {
                return Err(ConfigError::Invalid(
                    "admin_token_sha256 must be a 64-character hex digest".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Loads and validates the JSON configuration file, then applies the
/// environment override for the log level.
pub fn load_config(path: impl AsRef<Path>) -> Result<GuardConfig, ConfigError> {
    let raw_json = fs::read_to_string(&path).map_err(|e| ConfigError::Io(format!("{e}")))?;
    let mut config: GuardConfig =
        serde_json::from_str(&raw_json).map_err(|e| ConfigError::Parse(format!("{e}")))?;
    if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
        config.log_level = level;
    }
    config.validate()?;
    Ok(config)
}

/// Config path from `PHI_GUARD_CONFIG`, else `phi-guard.json`.
pub fn default_config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::integrity::sha256_hex;
    use serde_json::json;
    use tempfile::NamedTempFile;

    fn write_config(payload: serde_json::Value) -> NamedTempFile {
        let file = NamedTempFile::new().expect("temp file");
        fs::write(file.path(), serde_json::to_vec(&payload).unwrap()).unwrap();
        file
    }

    #[test]
    fn loads_and_builds_engine() {
        let var = "PHI_GUARD_CONFIG_TEST_PHI_KEY";
        std::env::set_var(var, "config-phi-key");

        let file = write_config(json!({
            "keys": { "phi": { "env": var } },
            "lockout": { "max_attempts": 3, "attempt_window_secs": 1800 },
            "engine": { "default_algorithm": "cbc" },
            "admin_token_sha256": sha256_hex(b"admin"),
            "log_format": "json"
        }));

        let config = load_config(file.path()).expect("config should load");
        assert_eq!(config.lockout.max_attempts, 3);
        assert_eq!(config.lockout.block_duration_secs, 3600);
        assert_eq!(config.log_format, "json");

        let engine = config.engine();
        assert_eq!(engine.default_algorithm(), Algorithm::Cbc);
        let ciphertext = engine.encrypt("hello", KeyType::Phi).expect("key should resolve");
        assert_eq!(engine.decrypt(ciphertext.as_str(), KeyType::Phi), "hello");
        assert!(engine.encrypt("hello", KeyType::Audit).is_err());

        let policy = config.lockout.policy().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempt_window, Duration::minutes(30));
    }

    #[test]
    fn empty_object_uses_defaults() {
        let file = write_config(json!({}));
        let config = load_config(file.path()).expect("config should load");
        assert_eq!(config.engine.default_algorithm, Algorithm::Gcm);
        assert!(!config.engine.strict_reads);
        assert_eq!(config.lockout, LockoutConfig::default());
    }

    #[test]
    fn rejects_invalid_values() {
        let zero = write_config(json!({ "lockout": { "max_attempts": 0 } }));
        assert!(matches!(load_config(zero.path()), Err(ConfigError::Invalid(_))));

        let huge_block = write_config(json!({ "lockout": { "block_duration_secs": i64::MAX } }));
        assert!(matches!(load_config(huge_block.path()), Err(ConfigError::Invalid(_))));

        let negative_window = write_config(json!({ "lockout": { "attempt_window_secs": -5 } }));
        assert!(matches!(load_config(negative_window.path()), Err(ConfigError::Invalid(_))));

        let bad_hash = write_config(json!({ "admin_token_sha256": "abc" }));
        assert!(matches!(load_config(bad_hash.path()), Err(ConfigError::Invalid(_))));

        let unknown = write_config(json!({ "plaintext_key": "oops" }));
        assert!(matches!(load_config(unknown.path()), Err(ConfigError::Parse(_))));
    }
}
