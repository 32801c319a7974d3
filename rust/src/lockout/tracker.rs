//! Failed-login state machine.
//!
//! Clean (no record) -> Accumulating (1..max-1 failures in window) -> Locked
//! (max failures reached) -> Clean again on success, manual clear, or the
//! first read after the lock deadline. There is no background timer: expiry
//! happens lazily when a record is next touched.
//!
//! Updates for one identity are serialized through a fixed set of striped
//! mutexes so concurrent failures can never lose an increment.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::{AttemptRecord, AttemptStore, StoreError};
use crate::clock::{Clock, SystemClock};

const LOCK_STRIPES: usize = 64;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lockout policy constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptPolicy {
    pub max_attempts: u32,
    pub attempt_window: Duration,
    pub block_duration: Duration,
    /// Unlocked records idle longer than this are purged on enumeration.
    pub retention: Duration,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_window: Duration::minutes(30),
            block_duration: Duration::minutes(60),
            retention: Duration::hours(24),
        }
    }
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptStatus {
    pub attempt_count: u32,
    pub attempts_remaining: u32,
    pub is_blocked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub warning: String,
}

/// Outcome of a lock check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockStatus {
    pub is_blocked: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub remaining: Option<Duration>,
    /// True when this check found an expired lock and cleared it.
    pub lock_expired: bool,
}

impl BlockStatus {
    fn clear() -> Self {
        Self {
            is_blocked: false,
            locked_until: None,
            remaining: None,
            lock_expired: false,
        }
    }

    /// "Try again in N minutes" text for a blocked identity.
    pub fn countdown(&self) -> Option<String> {
        let remaining = self.remaining.filter(|_| self.is_blocked)?;
        Some(format!(
            "Too many failed login attempts. Try again in {}.",
            describe_duration(remaining)
        ))
    }
}

/// Rounds up to whole minutes, or seconds when under a minute.
pub fn describe_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    if seconds < 60 {
        return plural(seconds, "second");
    }
    let minutes = (seconds + 59) / 60;
    plural(minutes, "minute")
}

fn plural(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit}")
    } else {
        format!("{count} {unit}s")
    }
}

/// Lower-cased and trimmed so case variants share one record.
pub fn normalize_identity(identity: &str) -> Result<String, TrackerError> {
    let normalized = identity.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(TrackerError::EmptyIdentity);
    }
    Ok(normalized)
}

pub struct AttemptTracker {
    store: Arc<dyn AttemptStore>,
    policy: AttemptPolicy,
    clock: Arc<dyn Clock>,
    stripes: Vec<Mutex<()>>,
}

impl AttemptTracker {
    /// Opens the store and returns a tracker over it.
    pub fn open(store: Arc<dyn AttemptStore>, policy: AttemptPolicy) -> Result<Self, TrackerError> {
        Self::open_with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        store: Arc<dyn AttemptStore>,
        policy: AttemptPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrackerError> {
        store.open()?;
        Ok(Self {
            store,
            policy,
            clock,
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    /// Closes the underlying store. Further calls fail with `NotOpen`.
    pub fn close(&self) -> Result<(), TrackerError> {
        let _all = self.lock_all();
        self.store.close()?;
        Ok(())
    }

    pub fn policy(&self) -> &AttemptPolicy {
        &self.policy
    }

    fn stripe(&self, identity: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        self.stripes[(hasher.finish() as usize) % self.stripes.len()].lock()
    }

    fn lock_all(&self) -> Vec<MutexGuard<'_, ()>> {
        self.stripes.iter().map(|stripe| stripe.lock()).collect()
    }

    pub fn record_failed_attempt(&self, identity: &str) -> Result<AttemptStatus, TrackerError> {
        let key = normalize_identity(identity)?;
        let _guard = self.stripe(&key);
        let now = self.clock.now();

        let mut record = match self.store.get(&key)? {
            Some(record) => record,
            None => AttemptRecord::fresh(&key, now),
        };

        if let Some(until) = record.locked_until {
            if now < until {
                // Still locked: count the attempt, keep the original deadline.
                record.attempt_count = record.attempt_count.saturating_add(1);
                record.last_attempt = now;
                self.store.put(&key, record.clone())?;
                warn!(identity = %key, attempts = record.attempt_count, "failed attempt while locked");
                return Ok(self.status_for(&record, now));
            }
            info!(identity = %key, "lock expired; starting a fresh count");
            record = AttemptRecord::fresh(&key, now);
        }

        if now - record.last_attempt > self.policy.attempt_window {
            debug!(identity = %key, stale_count = record.attempt_count, "attempt window elapsed; resetting count");
            record.attempt_count = 0;
            record.window_start = now;
        }

        record.attempt_count = record.attempt_count.saturating_add(1);
        record.last_attempt = now;

        if record.attempt_count >= self.policy.max_attempts {
            // a policy built in code can carry a block longer than the calendar allows
            let until = now
                .checked_add_signed(self.policy.block_duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            record.locked_until = Some(until);
            warn!(
                target: "audit",
                identity = %key,
                attempts = record.attempt_count,
                locked_until = %until,
                "identity locked after repeated failed logins"
            );
        } else {
            debug!(identity = %key, attempts = record.attempt_count, "failed attempt recorded");
        }

        self.store.put(&key, record.clone())?;
        Ok(self.status_for(&record, now))
    }

    fn status_for(&self, record: &AttemptRecord, now: DateTime<Utc>) -> AttemptStatus {
        let attempts_remaining = self.policy.max_attempts.saturating_sub(record.attempt_count);
        let is_blocked = record.is_locked_at(now);
        let warning = if is_blocked {
            let remaining = record.locked_until.map(|until| until - now).unwrap_or_else(Duration::zero);
            format!(
                "Too many failed login attempts. Your account is locked; try again in {}.",
                describe_duration(remaining)
            )
        } else if attempts_remaining == 1 {
            "Invalid credentials. 1 attempt remaining before your account is temporarily locked."
                .to_string()
        } else {
            format!(
                "Invalid credentials. {attempts_remaining} attempts remaining before your account is temporarily locked."
            )
        };

        AttemptStatus {
            attempt_count: record.attempt_count,
            attempts_remaining,
            is_blocked,
            locked_until: record.locked_until.filter(|_| is_blocked),
            warning,
        }
    }

    /// Checks the lock, clearing an expired one on the way.
    pub fn is_user_blocked(&self, identity: &str) -> Result<BlockStatus, TrackerError> {
        let key = normalize_identity(identity)?;
        let _guard = self.stripe(&key);
        let now = self.clock.now();

        let Some(record) = self.store.get(&key)? else {
            return Ok(BlockStatus::clear());
        };
        let Some(until) = record.locked_until else {
            return Ok(BlockStatus::clear());
        };

        if now >= until {
            self.store.remove(&key)?;
            info!(identity = %key, "lock expired; record cleared");
            return Ok(BlockStatus {
                lock_expired: true,
                ..BlockStatus::clear()
            });
        }

        Ok(BlockStatus {
            is_blocked: true,
            locked_until: Some(until),
            remaining: Some(until - now),
            lock_expired: false,
        })
    }

    /// Called on successful authentication.
    pub fn clear_failed_attempts(&self, identity: &str) -> Result<bool, TrackerError> {
        let key = normalize_identity(identity)?;
        let _guard = self.stripe(&key);
        let removed = self.store.remove(&key)?;
        debug!(identity = %key, removed, "failed attempts cleared");
        Ok(removed)
    }

    /// Enumerates records after purging unlocked ones idle past retention.
    pub fn tracked_records(&self) -> Result<Vec<AttemptRecord>, TrackerError> {
        let now = self.clock.now();
        let mut kept = Vec::new();
        let mut purged = 0usize;

        for listed in self.store.list_all()? {
            let _guard = self.stripe(&listed.identity);
            // re-read under the stripe lock; the listing may be stale
            let Some(record) = self.store.get(&listed.identity)? else {
                continue;
            };
            let stale = !record.is_locked_at(now) && now - record.last_attempt > self.policy.retention;
            if stale {
                self.store.remove(&record.identity)?;
                purged += 1;
            } else {
                kept.push(record);
            }
        }

        if purged > 0 {
            info!(purged, "stale attempt records purged");
        }
        kept.sort_by(|a, b| a.identity.cmp(&b.identity));
        Ok(kept)
    }

    /// Removes every record. Callers must audit-log the override.
    pub fn emergency_clear_all(&self) -> Result<usize, TrackerError> {
        let _all = self.lock_all();
        let removed = self.store.remove_all()?;
        warn!(target: "audit", removed, "all attempt records cleared by override");
        Ok(removed)
    }

    /// Removes one identity's record. Callers must audit-log the override.
    pub fn emergency_unblock(&self, identity: &str) -> Result<bool, TrackerError> {
        let key = normalize_identity(identity)?;
        let _guard = self.stripe(&key);
        let removed = self.store.remove(&key)?;
        warn!(target: "audit", identity = %key, removed, "identity unblocked by override");
        Ok(removed)
    }
}
