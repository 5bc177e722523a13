//! Concurrency control module.
//!
//! Hierarchical two-phase locking over tables and rows, with lock upgrades,
//! isolation-level-aware gating, and background deadlock detection.

pub mod lock;

pub use lock::{AbortReason, LockManager, LockManagerOptions, LockMode, TransactionAbortError};
