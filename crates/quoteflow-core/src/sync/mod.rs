//! Bidirectional reconciliation between the local store and the cloud.

mod lock;
mod mode;
mod orchestrator;

pub use lock::{LockError, SyncLockManager};
pub use mode::SyncMode;
pub use orchestrator::{SkipReason, SyncEngine, SyncReport};
