//! Indexer integration module
//!
//! This module provides the client and types for interacting with the store indexer.
//! The indexer pre-aggregates store events emitted by the world contract and serves both a
//! bulk snapshot of selected tables and a live subscription to their logs.

/// HTTP and WebSocket client for the store indexer
mod client;
/// Type definitions for indexer data structures
mod types;

#[cfg(test)]
pub use client::MockIndexerTransport;
pub use client::{IndexerClient, IndexerEventStream, IndexerTransport};
pub use types::*;
