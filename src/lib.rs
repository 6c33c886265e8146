//! Task-aware synchronization built around a recursive reader-writer lock.
//!
//! The crate ships two pieces: a small task runtime ([`runtime`]) that spawns
//! tasks with a stable identity and installs itself as the ambient scheduler
//! for the duration of each task, and the [`sync`] module with a
//! reader-writer lock ([`sync::RwLock`]) that uses that identity to support
//! recursive acquisition and a writer-preference fairness policy.
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]

pub mod runtime;
pub mod sync;

pub use runtime::{current_runtime, Builder, JoinHandle, Runtime, TaskId};
pub use sync::{LockError, ReaderLock, RwLock, WriterLock};
