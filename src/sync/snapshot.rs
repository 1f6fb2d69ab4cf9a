//! Initial snapshot of the allow-listed tables.
//!
//! The indexer snapshot is preferred; if it is not configured or fails, the tables are rebuilt by
//! replaying the ledger from the configured start block up to the chain head measured when the
//! snapshot started. Failure of both is fatal: no partial replica is handed out.

use crate::config::SyncOptions;
use crate::indexer::IndexerTransport;
use crate::ledger::{ChainHead, LedgerError, LedgerTransport};
use crate::store::{Cursor, EventBatch, Replica, TableId};
use crate::sync::SyncError;
use crate::sync::events::{EventDispatcher, SyncEvent};
use crate::sync::retry::with_retry;
use crate::sync::types::SourceKind;

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Initial replica plus the cursor streaming resumes from.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub replica: Replica,
    /// Last position covered by the snapshot
    pub cursor: Cursor,
    /// Chain head measured when the snapshot started
    pub head: u64,
    pub source: SourceKind,
}

pub struct SnapshotLoader {
    ledger: Arc<dyn LedgerTransport>,
    indexer: Option<Arc<dyn IndexerTransport>>,
    chain_head: Arc<dyn ChainHead>,
    dispatcher: EventDispatcher,
    options: SyncOptions,
}

impl SnapshotLoader {
    pub fn new(
        ledger: Arc<dyn LedgerTransport>,
        indexer: Option<Arc<dyn IndexerTransport>>,
        chain_head: Arc<dyn ChainHead>,
        dispatcher: EventDispatcher,
        options: SyncOptions,
    ) -> Self {
        Self {
            ledger,
            indexer,
            chain_head,
            dispatcher,
            options,
        }
    }

    /// Load the allow-listed tables.
    pub async fn load_snapshot(&self, filters: &[TableId]) -> Result<Snapshot, SyncError> {
        let chain_head = self.chain_head.clone();
        let head = with_retry(
            self.options.retry_max_elapsed,
            LedgerError::is_transient,
            || chain_head.chain_head(),
        )
        .await
        .map_err(|e| SyncError::SnapshotError(format!("could not read chain head: {}", e)))?;

        info!(
            "Loading snapshot of {} tables from block {} to head {}",
            filters.len(),
            self.options.start_block,
            head
        );
        self.dispatcher
            .dispatch(SyncEvent::SnapshotStarted {
                start_block: self.options.start_block,
                head,
            })
            .await;

        let snapshot = if filters.is_empty() {
            info!("No tables to synchronize, starting from the chain head");
            let mut replica = Replica::new(filters);
            replica.set_cursor(Cursor::end_of_block(head));
            Snapshot {
                replica,
                cursor: Cursor::end_of_block(head),
                head,
                source: SourceKind::Ledger,
            }
        } else {
            match self.load_from_indexer(filters, head).await {
                Some(snapshot) => snapshot,
                None => self.load_from_ledger(filters, head).await?,
            }
        };

        self.dispatcher
            .dispatch(SyncEvent::SnapshotLoaded {
                cursor: snapshot.cursor,
                head,
                records: snapshot.replica.len(),
            })
            .await;
        info!(
            "Snapshot loaded from {}: {} records at {}",
            snapshot.source,
            snapshot.replica.len(),
            snapshot.cursor
        );
        Ok(snapshot)
    }

    async fn load_from_indexer(&self, filters: &[TableId], head: u64) -> Option<Snapshot> {
        let indexer = self.indexer.as_ref()?;

        let response =
            tokio::time::timeout(self.options.indexer_timeout, indexer.get_snapshot(filters)).await;
        let snapshot = match response {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!("Indexer snapshot failed, replaying from the ledger: {}", e);
                return None;
            }
            Err(_) => {
                warn!(
                    "Indexer snapshot timed out after {:?}, replaying from the ledger",
                    self.options.indexer_timeout
                );
                return None;
            }
        };

        let allowed: HashSet<&TableId> = filters.iter().collect();
        let mut replica = Replica::new(filters);
        for event in &snapshot.events {
            if !allowed.contains(&event.table) {
                warn!("Indexer returned a record of unrequested table {}", event.table);
                continue;
            }
            replica.apply_event(event);
        }
        let cursor = Cursor::end_of_block(snapshot.block_number);
        replica.set_cursor(cursor);

        Some(Snapshot {
            replica,
            cursor,
            head,
            source: SourceKind::Indexer,
        })
    }

    async fn load_from_ledger(&self, filters: &[TableId], head: u64) -> Result<Snapshot, SyncError> {
        let mut replica = Replica::new(filters);
        let mut cursor = Cursor::before_block(self.options.start_block);
        let range = self.options.max_block_range.max(1);

        while cursor.next_block() <= head {
            let from_block = cursor.next_block();
            let to_block = head.min(from_block.saturating_add(range - 1));

            let ledger = self.ledger.clone();
            let batches: Vec<EventBatch> = with_retry(
                self.options.retry_max_elapsed,
                LedgerError::is_transient,
                || ledger.get_events_in_range(cursor, Some(to_block), filters),
            )
            .await
            .map_err(|e| {
                SyncError::SnapshotError(format!(
                    "ledger replay of blocks {}..={} failed: {}",
                    from_block, to_block, e
                ))
            })?;

            for batch in &batches {
                for event in &batch.events {
                    replica.apply_event(event);
                }
            }
            cursor = Cursor::end_of_block(to_block);
            replica.set_cursor(cursor);
            debug!("Replayed blocks {}..={}", from_block, to_block);

            self.dispatcher
                .dispatch(SyncEvent::SnapshotProgress { cursor, head })
                .await;
        }

        Ok(Snapshot {
            replica,
            cursor,
            head,
            source: SourceKind::Ledger,
        })
    }
}
