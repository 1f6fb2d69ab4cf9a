//! In-memory replica of the synchronized tables.
//!
//! The replica is split into a read side (`ReplicaStore`, cheap to clone, handed to any number of
//! readers) and a write side (`ReplicaWriter`, owned by the log applier). A batch is applied under a
//! single write lock so readers only ever see states that existed at an applied cursor.

use crate::store::types::{
    Cursor, DYNAMIC_DATA, ENCODED_LENGTHS, EventBatch, Row, RowEvent, RowKey, RowOp, STATIC_DATA,
    TableId, TxHash, Value, raw_record,
};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Table id to rows, plus the cursor the state corresponds to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    tables: HashMap<TableId, BTreeMap<RowKey, Row>>,
    cursor: Cursor,
}

impl Replica {
    /// Create an empty replica holding exactly the given tables.
    pub fn new<'a, I: IntoIterator<Item = &'a TableId>>(tables: I) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|table| (table.clone(), BTreeMap::new()))
                .collect(),
            cursor: Cursor::default(),
        }
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    pub fn get(&self, table: &TableId, key: &RowKey) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }

    /// Iterate all rows of a table in key order.
    pub fn rows(&self, table: &TableId) -> impl Iterator<Item = (&RowKey, &Row)> {
        self.tables.get(table).into_iter().flat_map(|rows| rows.iter())
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableId> {
        self.tables.keys()
    }

    pub fn contains_table(&self, table: &TableId) -> bool {
        self.tables.contains_key(table)
    }

    pub fn table_len(&self, table: &TableId) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Total number of rows across all tables.
    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply one event. Returns the change, or `None` when the event had no effect.
    pub(crate) fn apply_event(&mut self, event: &RowEvent) -> Option<RowChange> {
        let Some(rows) = self.tables.get_mut(&event.table) else {
            warn!(
                "Ignoring event for table {} which is not synchronized",
                event.table
            );
            return None;
        };
        if let Err(e) = event.op.check_bounds() {
            warn!(
                "Ignoring event for {} at log {}: {}",
                event.table, event.log_index, e
            );
            return None;
        }

        let kind = match &event.op {
            RowOp::Set(row) => {
                rows.insert(event.key.clone(), row.clone());
                ChangeKind::Upsert
            }
            RowOp::Delete => {
                rows.remove(&event.key)?;
                ChangeKind::Delete
            }
            RowOp::SpliceStatic { start, data } => {
                let row = rows
                    .entry(event.key.clone())
                    .or_insert_with(|| raw_record(Vec::new(), Vec::new(), Vec::new()));
                let bytes = bytes_column(row, STATIC_DATA);
                let end = start + data.len();
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[*start..end].copy_from_slice(data);
                ChangeKind::Upsert
            }
            RowOp::SpliceDynamic {
                start,
                delete_count,
                encoded_lengths,
                data,
            } => {
                let row = rows
                    .entry(event.key.clone())
                    .or_insert_with(|| raw_record(Vec::new(), Vec::new(), Vec::new()));
                let bytes = bytes_column(row, DYNAMIC_DATA);
                if bytes.len() < *start {
                    bytes.resize(*start, 0);
                }
                let end = (start + delete_count).min(bytes.len());
                let tail = bytes.split_off(end);
                bytes.truncate(*start);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(&tail);
                row.insert(
                    ENCODED_LENGTHS.to_string(),
                    Value::Bytes(encoded_lengths.clone()),
                );
                ChangeKind::Upsert
            }
        };

        Some(RowChange {
            table: event.table.clone(),
            key: event.key.clone(),
            kind,
        })
    }
}

/// Mutable access to a byte column, replacing a non-byte value with an empty one.
fn bytes_column<'a>(row: &'a mut Row, column: &str) -> &'a mut Vec<u8> {
    let value = row
        .entry(column.to_string())
        .or_insert_with(|| Value::Bytes(Vec::new()));
    if !matches!(value, Value::Bytes(_)) {
        *value = Value::Bytes(Vec::new());
    }
    match value {
        Value::Bytes(bytes) => bytes,
        _ => unreachable!("column was just set to bytes"),
    }
}

/// Kind of change an event made to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    Delete,
}

/// A row touched by an applied batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub table: TableId,
    pub key: RowKey,
    pub kind: ChangeKind,
}

/// Notification emitted once per applied batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedBatch {
    /// Cursor of the batch, now the replica cursor
    pub cursor: Cursor,
    /// Replica cursor before the batch
    pub previous: Cursor,
    /// Rows changed, in application order
    pub changes: Vec<RowChange>,
    /// Transactions with events in the batch
    pub transactions: BTreeSet<TxHash>,
}

/// Read side of the replica.
///
/// Only the writer keeps the change channel open; once it is dropped, subscriptions end.
#[derive(Clone)]
pub struct ReplicaStore {
    inner: Arc<RwLock<Replica>>,
    changes: broadcast::WeakSender<Arc<AppliedBatch>>,
}

/// Write side of the replica; there is exactly one per store.
pub struct ReplicaWriter {
    inner: Arc<RwLock<Replica>>,
    changes: broadcast::Sender<Arc<AppliedBatch>>,
}

impl ReplicaStore {
    /// Create a store and its single writer from an initial replica.
    pub fn new(replica: Replica) -> (ReplicaStore, ReplicaWriter) {
        let inner = Arc::new(RwLock::new(replica));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        (
            ReplicaStore {
                inner: inner.clone(),
                changes: changes.downgrade(),
            },
            ReplicaWriter { inner, changes },
        )
    }

    /// Lock the replica for reading. Hold the guard briefly: the applier waits on it.
    pub fn read(&self) -> RwLockReadGuard<'_, Replica> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cursor(&self) -> Cursor {
        self.read().cursor()
    }

    pub fn get(&self, table: &TableId, key: &RowKey) -> Option<Row> {
        self.read().get(table, key).cloned()
    }

    /// All rows of a table, in key order, as of a single cursor.
    pub fn table(&self, table: &TableId) -> Vec<(RowKey, Row)> {
        self.read()
            .rows(table)
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect()
    }

    /// Copy of the full replica.
    pub fn snapshot(&self) -> Replica {
        self.read().clone()
    }

    /// Receive every applied batch. The receiver is already closed if the writer is gone.
    pub fn subscribe_batches(&self) -> broadcast::Receiver<Arc<AppliedBatch>> {
        match self.changes.upgrade() {
            Some(changes) => changes.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Receive a notification whenever the rows selected by `query` change.
    pub fn subscribe(&self, query: Query) -> QuerySubscription {
        QuerySubscription {
            query,
            store: self.clone(),
            rx: self.subscribe_batches(),
        }
    }
}

impl ReplicaWriter {
    pub fn cursor(&self) -> Cursor {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .cursor()
    }

    /// Replace the whole replica, used once the snapshot is loaded.
    pub fn replace(&mut self, replica: Replica) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = replica;
    }

    /// Apply a batch atomically.
    ///
    /// Returns `None` without touching the replica when the batch cursor is not strictly greater
    /// than the current one. Events of a partially overlapping batch that sit at or below the
    /// current cursor are skipped.
    pub fn apply(&mut self, batch: &EventBatch) -> Option<Arc<AppliedBatch>> {
        let applied = {
            let mut replica = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let previous = replica.cursor();
            if batch.cursor <= previous {
                return None;
            }

            let mut changes = Vec::with_capacity(batch.events.len());
            let mut transactions = BTreeSet::new();
            for event in &batch.events {
                if batch.position_of(event) <= previous {
                    debug!(
                        "Skipping already applied event at {}",
                        batch.position_of(event)
                    );
                    continue;
                }
                if let Some(tx) = event.transaction_hash {
                    transactions.insert(tx);
                }
                if let Some(change) = replica.apply_event(event) {
                    changes.push(change);
                }
            }
            replica.set_cursor(batch.cursor);

            Arc::new(AppliedBatch {
                cursor: batch.cursor,
                previous,
                changes,
                transactions,
            })
        };

        // No receivers is fine
        let _ = self.changes.send(applied.clone());
        Some(applied)
    }
}

/// Selection of rows a subscriber is interested in.
pub struct Query {
    table: TableId,
    predicate: Option<Box<dyn Fn(&RowKey) -> bool + Send + Sync>>,
}

impl Query {
    /// Every row of a table.
    pub fn table(table: TableId) -> Self {
        Self {
            table,
            predicate: None,
        }
    }

    /// A single row.
    pub fn row(table: TableId, key: RowKey) -> Self {
        Self::filter(table, move |candidate| *candidate == key)
    }

    /// Rows of a table whose key satisfies `predicate`.
    pub fn filter<F>(table: TableId, predicate: F) -> Self
    where
        F: Fn(&RowKey) -> bool + Send + Sync + 'static,
    {
        Self {
            table,
            predicate: Some(Box::new(predicate)),
        }
    }

    pub fn matches(&self, table: &TableId, key: &RowKey) -> bool {
        *table == self.table && self.predicate.as_ref().is_none_or(|p| p(key))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

/// Live subscription to a query.
pub struct QuerySubscription {
    query: Query,
    store: ReplicaStore,
    rx: broadcast::Receiver<Arc<AppliedBatch>>,
}

impl QuerySubscription {
    /// Rows currently selected by the query.
    pub fn current(&self) -> Vec<(RowKey, Row)> {
        let replica = self.store.read();
        replica
            .rows(&self.query.table)
            .filter(|(key, _)| self.query.matches(&self.query.table, key))
            .map(|(key, row)| (key.clone(), row.clone()))
            .collect()
    }

    /// Wait until an applied batch changes a selected row; returns that batch's cursor.
    ///
    /// If this subscriber fell behind the notification channel it reports a change at the
    /// current cursor, since skipped batches may have touched the query. Returns `None` if the
    /// notification channel is closed.
    pub async fn changed(&mut self) -> Option<Cursor> {
        loop {
            match self.rx.recv().await {
                Ok(batch) => {
                    if batch
                        .changes
                        .iter()
                        .any(|change| self.query.matches(&change.table, &change.key))
                    {
                        return Some(batch.cursor);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Query subscription on {} lagged by {} batches",
                        self.query.table, skipped
                    );
                    return Some(self.store.cursor());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
