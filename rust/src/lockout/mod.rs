//! Failed-login tracking and temporary lockout.

pub mod store;
pub mod tracker;

pub use store::{AttemptRecord, AttemptStore, JsonFileStore, MemoryStore, StoreError};
pub use tracker::{
    normalize_identity, AttemptPolicy, AttemptStatus, AttemptTracker, BlockStatus, TrackerError,
};
