//! Replica store: the local, queryable copy of the synchronized tables.
//!
//! `types` holds the data model shared by every source and the applier; `replica` holds the
//! single-writer, many-reader table store and its change subscriptions.

/// In-memory table store with query subscriptions
pub mod replica;
/// Table ids, row keys, rows, cursors and event batches
pub mod types;

pub use replica::{
    AppliedBatch, ChangeKind, Query, QuerySubscription, Replica, ReplicaStore, ReplicaWriter,
    RowChange,
};
pub use types::*;
