//! wikisync core library.
//!
//! This crate provides the components for bidirectional synchronization of a
//! wiki page tree with a directory of text files: configuration, persisted
//! page state, the storage-format converter, the remote client, the local
//! mirror tree, change classification, three-way merge, surgical patching
//! and the sync engine that runs them in order.

pub mod classify;
pub mod config;
pub mod conflict;
pub mod convert;
pub mod disambiguate;
pub mod document;
pub mod errors;
pub mod executor;
pub mod fingerprint;
pub mod local;
pub mod models;
pub mod patch;
pub mod remote;
pub mod state;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::SyncConfig;
pub use errors::{CoreError, SyncError};
pub use models::{SyncMode, SyncOptions, SyncReport};
pub use remote::{ConfluenceClient, InMemoryRemote, RemoteStore};
pub use state::{JsonStateFile, MemoryBackend, PageStateStore};
pub use sync_engine::{LocalStatus, SyncEngine};
