//! Lease-based mutual exclusion for resources shared between agents.
//!
//! Agents working on the same files (or any other named resource) take a
//! time-bounded lease before touching it. Leases self-expire, so a crashed
//! holder never blocks a resource forever.
//!
//! # Main types
//!
//! - [`LockManager`]: acquire, release and inspect leases.
//! - [`LockRecord`]: a single lease as persisted in the shared table.
//! - [`SystemLock`]: the coarse cross-process guard around the table file.

/// Lock manager operations.
pub mod manager;
/// Cross-process guard file.
pub mod system_lock;
/// Persisted table types and key normalization.
pub mod table;

pub use manager::{LockManager, LockOutcome, ReleaseOutcome};
pub use system_lock::{SystemLock, SystemLockOptions};
pub use table::{normalize_key, LockRecord, LockTable};
