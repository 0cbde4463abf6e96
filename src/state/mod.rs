//! State management module for the converge engine.
//!
//! This module provides the persistent record of previously-created
//! instances: durable backends, the run-scoped lock and the versioned
//! store that planner and scheduler share.

mod backend;
mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use backend::Backend;
pub use local::{LocalBackend, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_RENEW_INTERVAL_SECS};
pub use memory::MemoryBackend;
pub use s3::S3Backend;
pub use store::StateStore;
pub use types::{
    HistoryEntry, HistoryOperation, Removal, StateEntry, StateSnapshot, StateVersion,
    MAX_HISTORY, STATE_VERSION,
};
