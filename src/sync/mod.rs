//! Store Synchronization Module
//!
//! This module provides the logic that keeps the local replica in step with the ledger. It is
//! composed of several submodules, each responsible for one part of the pipeline:
//!
//! - `orchestrator`: Entry point; loads the snapshot and runs the background tasks.
//! - `snapshot`: Initial load of the allow-listed tables from the indexer or the ledger.
//! - `source` and `fallback`: Event sources and the selector that falls back from the indexer to polling.
//! - `applier`: Single writer applying batches in cursor order.
//! - `events`: Sync event types, handler trait and dispatcher.
//! - `progress_tracker`: Forward-only progress state machine.
//! - `write_observer`: Completion handles for submitted transactions.

/// Single writer applying event batches to the replica
pub mod applier;
/// Event system for decoupled communication during sync
pub mod events;
/// Indexer-first event source with ledger polling fallback
pub mod fallback;
/// Main coordinator for the store sync process
pub mod orchestrator;
/// Tracks synchronization progress
pub mod progress_tracker;
/// Bounded retry of transient errors
pub mod retry;
/// Initial snapshot loading
pub mod snapshot;
/// Indexer and ledger polling event sources
pub mod source;
mod types;
/// Completion tracking of submitted writes
pub mod write_observer;

pub use orchestrator::*;
pub use progress_tracker::{SyncProgress, SyncStep};
pub use types::*;
pub use write_observer::{WriteEvent, WriteFailure, WriteHandle, WriteOutcome};
