use std::sync::Arc;

use phi_guard::admin::{AdminConsole, AdminError, AdminToken};
use phi_guard::audit::{AuditCodec, AuditTrail};
use phi_guard::crypto::integrity::sha256_hex;
use phi_guard::crypto::keys::StaticKeyResolver;
use phi_guard::crypto::{EncryptionEngine, KeyType};
use phi_guard::lockout::{AttemptPolicy, AttemptTracker, JsonFileStore};
use tempfile::tempdir;

#[test]
fn overrides_are_gated_and_leave_a_sealed_trail() {
    let dir = tempdir().expect("temp dir");
    let resolver = StaticKeyResolver::new().with_key(KeyType::Audit, "trail-key");
    let codec = Arc::new(AuditCodec::new(Arc::new(EncryptionEngine::new(Arc::new(resolver)))));
    let trail_path = dir.path().join("audit.log");

    let tracker = Arc::new(
        AttemptTracker::open(
            Arc::new(JsonFileStore::new(dir.path().join("attempts.json"))),
            AttemptPolicy {
                max_attempts: 2,
                ..AttemptPolicy::default()
            },
        )
        .unwrap(),
    );
    for identity in ["a@clinic.org", "a@clinic.org", "b@clinic.org", "b@clinic.org"] {
        tracker.record_failed_attempt(identity).unwrap();
    }

    let console = AdminConsole::with_trail(
        tracker.clone(),
        AuditTrail::new(&trail_path, codec.clone()),
        Some(sha256_hex(b"break-glass")),
    );

    let denied = console.emergency_clear_all(&AdminToken::new("guess"), "intruder");
    assert!(matches!(denied, Err(AdminError::Unauthorized)));
    assert_eq!(tracker.tracked_records().unwrap().len(), 2);

    let token = AdminToken::new("break-glass");
    assert!(console.emergency_unblock(&token, "ops", "A@clinic.org").unwrap());
    assert_eq!(console.emergency_clear_all(&token, "ops").unwrap(), 1);
    assert!(tracker.tracked_records().unwrap().is_empty());
    tracker.close().unwrap();

    let entries = AuditTrail::new(&trail_path, codec).read_all().unwrap();
    let actions: Vec<&str> = entries.iter().map(|e| e.entry.action.as_str()).collect();
    assert_eq!(actions, ["admin_denied", "emergency_unblock", "emergency_clear_all"]);
    assert!(entries.iter().all(|e| e.checksum_valid && e.was_encrypted));
    assert_eq!(entries[2].entry.details["removed"], 1);
}
