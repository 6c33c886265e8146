//! Synchronization primitives.
//!
//! This module provides a runtime-aware reader-writer lock whose
//! recursion and fairness decisions are keyed on task identity.

mod rwlock;

pub use rwlock::{LockError, ReaderLock, RwLock, WriterLock};
