//! Tamper-evident audit entries.
//!
//! An entry is serialized with an empty checksum, hashed with SHA-256, the hex
//! digest written into `checksum`, then the entry is serialized again and
//! encrypted under the `audit` key. Appending audit records must never stop
//! because of a key problem, so when encryption is unavailable the plain JSON
//! is written instead and the fallback is logged at error level.
//!
//! Verification is lenient: a checksum mismatch is reported but the entry is
//! still returned. Only input that cannot be parsed at all is rejected.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::crypto::integrity::sha256_hex;
use crate::crypto::{EncryptionEngine, KeyType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub checksum: String,
    /// Fields written by older producers that this version does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const KNOWN_FIELDS: [&str; 5] = ["action", "resource", "timestamp", "details", "checksum"];

impl AuditEntry {
    /// SHA-256 over the serialization with the checksum field cleared.
    pub fn compute_checksum(&self) -> String {
        let unsealed = AuditEntry {
            checksum: String::new(),
            ..self.clone()
        };
        // serializing a struct of strings and a Value cannot fail
        let serialized = serde_json::to_string(&unsealed).unwrap_or_default();
        sha256_hex(serialized.as_bytes())
    }

    /// Reads whatever an object carries. Missing or non-string fields fall
    /// back to empty values; unknown fields land in `extra`.
    fn from_object(object: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        AuditEntry {
            action: text("action"),
            resource: text("resource"),
            timestamp: text("timestamp"),
            details: object.get("details").cloned().unwrap_or(Value::Null),
            checksum: text("checksum"),
            extra: object
                .iter()
                .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

/// Checksum of an entry exactly as stored: the checksum field is blanked in
/// place (or appended when absent) and key order is kept.
fn checksum_of_object(object: &Map<String, Value>) -> String {
    let mut unsealed = object.clone();
    unsealed.insert("checksum".to_string(), Value::String(String::new()));
    let serialized = serde_json::to_string(&Value::Object(unsealed)).unwrap_or_default();
    sha256_hex(serialized.as_bytes())
}

/// Result of reading an entry back.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedAudit {
    pub entry: AuditEntry,
    pub checksum_valid: bool,
    pub was_encrypted: bool,
}

pub struct AuditCodec {
    engine: Arc<EncryptionEngine>,
    clock: Arc<dyn Clock>,
}

impl AuditCodec {
    pub fn new(engine: Arc<EncryptionEngine>) -> Self {
        Self::with_clock(engine, Arc::new(SystemClock))
    }

    pub fn with_clock(engine: Arc<EncryptionEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    pub fn build_entry(&self, action: &str, resource: &str, details: Value) -> AuditEntry {
        let mut entry = AuditEntry {
            action: action.to_string(),
            resource: resource.to_string(),
            timestamp: self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            details,
            checksum: String::new(),
            extra: Map::new(),
        };
        entry.checksum = entry.compute_checksum();
        entry
    }

    /// Builds, checksums and seals an entry. Never fails.
    pub fn create_entry(&self, action: &str, resource: &str, details: Value) -> String {
        let entry = self.build_entry(action, resource, details);
        let serialized = serde_json::to_string(&entry).unwrap_or_default();

        match self.engine.encrypt(&serialized, KeyType::Audit) {
            Ok(ciphertext) => {
                info!(target: "audit", action, resource, encrypted = true, "audit entry created");
                ciphertext.into_string()
            }
            Err(err) => {
                error!(
                    target: "audit",
                    action,
                    resource,
                    encrypted = false,
                    error = %err,
                    "AUDIT_PLAINTEXT_FALLBACK: audit entry written unencrypted"
                );
                serialized
            }
        }
    }

    /// Decrypts (or reads as plain JSON) and checks the checksum. Returns
    /// `None` only when the input is not a JSON object.
    pub fn verify_entry(&self, sealed: &str) -> Option<VerifiedAudit> {
        let was_encrypted = crate::crypto::is_encrypted(sealed);
        let json = self.engine.decrypt(sealed, KeyType::Audit);

        let object = match serde_json::from_str::<Value>(&json) {
            Ok(Value::Object(object)) => object,
            Ok(_) => {
                warn!(target: "audit", "audit entry is not a json object");
                return None;
            }
            Err(err) => {
                warn!(target: "audit", error = %err, "audit entry unparseable");
                return None;
            }
        };

        let entry = AuditEntry::from_object(&object);
        let checksum_valid = checksum_of_object(&object) == entry.checksum;
        if !checksum_valid {
            warn!(
                target: "audit",
                action = %entry.action,
                resource = %entry.resource,
                timestamp = %entry.timestamp,
                "audit checksum mismatch"
            );
        }

        Some(VerifiedAudit {
            entry,
            checksum_valid,
            was_encrypted: was_encrypted && json != sealed,
        })
    }
}

#[derive(Debug, Error)]
pub enum AuditTrailError {
    #[error("audit trail unwritable at {path}: {reason}")]
    Write { path: PathBuf, reason: String },
    #[error("audit trail unreadable at {path}: {reason}")]
    Read { path: PathBuf, reason: String },
}

/// Append-only file of sealed entries, one per line.
pub struct AuditTrail {
    path: PathBuf,
    codec: Arc<AuditCodec>,
}

impl AuditTrail {
    pub fn new(path: impl Into<PathBuf>, codec: Arc<AuditCodec>) -> Self {
        Self {
            path: path.into(),
            codec,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, action: &str, resource: &str, details: Value) -> Result<String, AuditTrailError> {
        let sealed = self.codec.create_entry(action, resource, details);
        let write_err = |e: std::io::Error| AuditTrailError::Write {
            path: self.path.clone(),
            reason: format!("{e}"),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;
        writeln!(file, "{sealed}").map_err(write_err)?;
        file.sync_data().map_err(write_err)?;
        Ok(sealed)
    }

    /// Reads every entry. Unparseable lines are skipped with a warning.
    pub fn read_all(&self) -> Result<Vec<VerifiedAudit>, AuditTrailError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AuditTrailError::Read {
                    path: self.path.clone(),
                    reason: format!("{e}"),
                })
            }
        };

        Ok(content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(number, line)| {
                let verified = self.codec.verify_entry(line.trim());
                if verified.is_none() {
                    warn!(target: "audit", line = number + 1, "skipping unreadable audit line");
                }
                verified
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crypto::keys::StaticKeyResolver;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn codec_with(resolver: StaticKeyResolver) -> AuditCodec {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap());
        AuditCodec::with_clock(
            Arc::new(EncryptionEngine::new(Arc::new(resolver))),
            Arc::new(clock),
        )
    }

    fn codec() -> AuditCodec {
        codec_with(StaticKeyResolver::new().with_key(KeyType::Audit, "audit-key"))
    }

    #[test]
    fn sealed_entries_verify() {
        let codec = codec();
        let sealed = codec.create_entry("view_record", "patient/17", json!({"user": "dr.who"}));
        assert!(sealed.starts_with("gcm:"));

        let verified = codec.verify_entry(&sealed).expect("entry should parse");
        assert!(verified.checksum_valid);
        assert!(verified.was_encrypted);
        assert_eq!(verified.entry.action, "view_record");
        assert_eq!(verified.entry.timestamp, "2026-03-01T09:30:00.000Z");
        assert_eq!(verified.entry.checksum, verified.entry.compute_checksum());
    }

    #[test]
    fn falls_back_to_plain_json_without_audit_key() {
        let codec = codec_with(StaticKeyResolver::new());
        let sealed = codec.create_entry("login", "user/5", Value::Null);
        assert!(sealed.starts_with('{'));

        let verified = codec.verify_entry(&sealed).expect("plain entry should parse");
        assert!(verified.checksum_valid);
        assert!(!verified.was_encrypted);
    }

    #[test]
    fn tampered_plain_entry_is_returned_with_mismatch() {
        let codec = codec_with(StaticKeyResolver::new());
        let sealed = codec.create_entry("export", "report/9", json!({"rows": 10}));
        let tampered = sealed.replace("\"rows\":10", "\"rows\":10000");

        let verified = codec.verify_entry(&tampered).expect("entry should still parse");
        assert!(!verified.checksum_valid);
        assert_eq!(verified.entry.details, json!({"rows": 10000}));
    }

    #[test]
    fn legacy_entry_missing_fields_is_still_returned() {
        let verified = codec()
            .verify_entry(r#"{"action":"login","resource":"user/1","details":{},"checksum":"abc"}"#)
            .expect("parseable entry should be returned");
        assert_eq!(verified.entry.action, "login");
        assert_eq!(verified.entry.timestamp, "");
        assert!(!verified.checksum_valid);
        assert!(!verified.was_encrypted);
    }

    #[test]
    fn legacy_fields_are_kept_and_hashed() {
        let unsealed = r#"{"action":"view","resource":"chart/4","timestamp":"2024-05-01T00:00:00.000Z","details":{"b":1,"a":2},"userId":"u9","checksum":""}"#;
        let checksum = sha256_hex(unsealed.as_bytes());
        let stored = unsealed.replace(r#""checksum":"""#, &format!(r#""checksum":"{checksum}""#));

        let verified = codec().verify_entry(&stored).expect("entry should parse");
        assert!(verified.checksum_valid);
        assert_eq!(verified.entry.extra.get("userId"), Some(&json!("u9")));

        let altered = stored.replace("u9", "u10");
        assert!(!codec().verify_entry(&altered).unwrap().checksum_valid);
    }

    #[test]
    fn garbage_yields_none() {
        assert!(codec().verify_entry("not an entry").is_none());
        assert!(codec().verify_entry("gcm:AAAA").is_none());
        assert!(codec().verify_entry("[1, 2]").is_none());
    }

    #[test]
    fn trail_appends_and_reads_back() {
        let dir = tempdir().expect("temp dir");
        let trail = AuditTrail::new(dir.path().join("audit.log"), Arc::new(codec()));
        assert!(trail.read_all().unwrap().is_empty());

        trail.append("unblock", "user/a@b.com", json!({"operator": "ops"})).unwrap();
        trail.append("clear_all", "lockout", json!({"removed": 3})).unwrap();
        fs::write(
            trail.path(),
            format!("{}garbage line\n", fs::read_to_string(trail.path()).unwrap()),
        )
        .unwrap();

        let entries = trail.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].entry.action, "clear_all");
        assert!(entries.iter().all(|e| e.checksum_valid));
    }
}
