//! Authorization-gated administrative overrides for the lockout tracker.
//! Every call is audit-logged whether or not the token is accepted.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::audit::{AuditCodec, AuditTrail, AuditTrailError};
use crate::crypto::integrity::{hex_digests_match, sha256_hex};
use crate::lockout::{normalize_identity, AttemptTracker, TrackerError};

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("administrative overrides are disabled: no admin token configured")]
    NotConfigured,
    #[error("admin token rejected")]
    Unauthorized,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Trail(#[from] AuditTrailError),
}

/// Token presented by an operator. Never printed.
pub struct AdminToken(String);

impl AdminToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminToken(<redacted>)")
    }
}

impl Drop for AdminToken {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.0);
    }
}

enum AuditSink {
    Trail(AuditTrail),
    Codec(Arc<AuditCodec>),
}

pub struct AdminConsole {
    tracker: Arc<AttemptTracker>,
    sink: AuditSink,
    token_sha256: Option<String>,
}

impl AdminConsole {
    /// `token_sha256` is the hex SHA-256 of the accepted admin token; `None`
    /// disables every override.
    pub fn new(tracker: Arc<AttemptTracker>, codec: Arc<AuditCodec>, token_sha256: Option<String>) -> Self {
        Self {
            tracker,
            sink: AuditSink::Codec(codec),
            token_sha256,
        }
    }

    /// Like [`AdminConsole::new`] but persists entries to an append-only trail.
    pub fn with_trail(tracker: Arc<AttemptTracker>, trail: AuditTrail, token_sha256: Option<String>) -> Self {
        Self {
            tracker,
            sink: AuditSink::Trail(trail),
            token_sha256,
        }
    }

    fn record(&self, action: &str, resource: &str, details: serde_json::Value) -> Result<String, AdminError> {
        let sealed = match &self.sink {
            AuditSink::Trail(trail) => trail.append(action, resource, details)?,
            AuditSink::Codec(codec) => codec.create_entry(action, resource, details),
        };
        info!(target: "audit", action, resource, entry = %sealed, "admin override recorded");
        Ok(sealed)
    }

    fn authorize(&self, token: &AdminToken, operator: &str, action: &str) -> Result<(), AdminError> {
        let Some(expected) = self.token_sha256.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Err(AdminError::NotConfigured);
        };
        if hex_digests_match(&sha256_hex(token.0.as_bytes()), expected) {
            return Ok(());
        }
        warn!(target: "audit", operator, action, "admin token rejected");
        self.record("admin_denied", action, json!({ "operator": operator }))?;
        Err(AdminError::Unauthorized)
    }

    pub fn emergency_unblock(&self, token: &AdminToken, operator: &str, identity: &str) -> Result<bool, AdminError> {
        self.authorize(token, operator, "emergency_unblock")?;
        let key = normalize_identity(identity)?;
        let removed = self.tracker.emergency_unblock(&key)?;
        self.record(
            "emergency_unblock",
            &format!("identity/{key}"),
            json!({ "operator": operator, "removed": removed }),
        )?;
        Ok(removed)
    }

    pub fn emergency_clear_all(&self, token: &AdminToken, operator: &str) -> Result<usize, AdminError> {
        self.authorize(token, operator, "emergency_clear_all")?;
        let removed = self.tracker.emergency_clear_all()?;
        self.record(
            "emergency_clear_all",
            "lockout",
            json!({ "operator": operator, "removed": removed }),
        )?;
        Ok(removed)
    }
}
