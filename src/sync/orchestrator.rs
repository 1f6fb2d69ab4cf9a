//! Store sync orchestrator and integration point for all sync services.
//!
//! `StoreSync::start` wires the pipeline together: it registers the progress tracker and the write
//! observer with the event dispatcher, loads the snapshot (blocking, fatal on failure), hands the
//! replica to its single writer, and spawns the log applier over the indexer-with-polling-fallback
//! source plus the write status task. Every background task shares one cancellation token, so
//! `shutdown` stops them together and resolves outstanding writes as cancelled.

use crate::config::SyncOptions;
use crate::faucet::FundingLoop;
use crate::indexer::IndexerTransport;
use crate::ledger::{ChainHead, LedgerChainHead, LedgerTransport};
use crate::store::{ReplicaStore, TableId, TxHash};
use crate::sync::SyncError;
use crate::sync::applier::LogApplier;
use crate::sync::events::{EventDispatcher, SyncEvent};
use crate::sync::fallback::FallbackSource;
use crate::sync::progress_tracker::{SyncProgress, SyncProgressTracker};
use crate::sync::snapshot::SnapshotLoader;
use crate::sync::source::{EventSource, IndexerSource, PollingSource};
use crate::sync::write_observer::{WriteEvent, WriteHandle, WriteObserver};

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything the sync pipeline needs to start.
pub struct StoreSyncConfig {
    /// Allow-list of tables to replicate
    pub tables: Vec<TableId>,
    pub ledger: Arc<dyn LedgerTransport>,
    /// Absent forces polling only
    pub indexer: Option<Arc<dyn IndexerTransport>>,
    /// Defaults to the ledger's block number
    pub chain_head: Option<Arc<dyn ChainHead>>,
    pub options: SyncOptions,
}

/// Running store synchronization.
///
/// Owns the replica's read side, the observable progress and write outcomes, and the background
/// tasks keeping them current.
pub struct StoreSync {
    store: ReplicaStore,
    tables: Vec<TableId>,
    ledger: Arc<dyn LedgerTransport>,
    progress: Arc<SyncProgressTracker>,
    writes: Arc<WriteObserver>,
    dispatcher: EventDispatcher,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StoreSync {
    /// Load the snapshot and start streaming.
    ///
    /// Returns only once the initial replica is complete; a snapshot failure is returned as an
    /// error and nothing keeps running.
    pub async fn start(config: StoreSyncConfig) -> Result<Self, SyncError> {
        let StoreSyncConfig {
            tables,
            ledger,
            indexer,
            chain_head,
            options,
        } = config;

        let progress = Arc::new(SyncProgressTracker::new());
        let writes = Arc::new(WriteObserver::new(ledger.clone(), &options));
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(progress.clone());
        dispatcher.register_handler(writes.clone());

        let chain_head =
            chain_head.unwrap_or_else(|| Arc::new(LedgerChainHead::new(ledger.clone())));
        let loader = SnapshotLoader::new(
            ledger.clone(),
            indexer.clone(),
            chain_head,
            dispatcher.clone(),
            options.clone(),
        );
        let snapshot = loader.load_snapshot(&tables).await?;
        let (store, writer) = ReplicaStore::new(snapshot.replica);

        if indexer.is_some() && tables.is_empty() {
            info!("No tables to replicate, following the chain head by polling only");
        }
        let preferred = indexer.filter(|_| !tables.is_empty()).map(|indexer| {
            Arc::new(IndexerSource::new(
                indexer,
                tables.clone(),
                options.indexer_timeout,
            )) as Arc<dyn EventSource>
        });
        let fallback: Arc<dyn EventSource> =
            Arc::new(PollingSource::new(ledger.clone(), tables.clone(), &options));
        let source: Arc<dyn EventSource> = Arc::new(FallbackSource::new(
            preferred,
            fallback,
            options.indexer_timeout,
            options.indexer_cooldown,
        ));
        info!(
            "Streaming {} tables from {} via {}",
            tables.len(),
            snapshot.cursor,
            source.kind()
        );

        let cancel = CancellationToken::new();
        let applier = LogApplier::new(writer, source, dispatcher.clone(), &options);
        let tasks = vec![
            tokio::spawn(applier.run(cancel.clone())),
            tokio::spawn(writes.clone().run(cancel.clone())),
        ];

        Ok(Self {
            store,
            tables,
            ledger,
            progress,
            writes,
            dispatcher,
            cancel,
            tasks,
        })
    }

    /// Read-only view of the replica.
    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    pub fn current_progress(&self) -> SyncProgress {
        self.progress.current()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.dispatcher.subscribe()
    }

    pub fn write_events(&self) -> broadcast::Receiver<WriteEvent> {
        self.writes.subscribe()
    }

    /// Track a transaction submitted elsewhere.
    pub fn track(&self, id: TxHash) -> Result<WriteHandle, SyncError> {
        self.writes.track(id)
    }

    /// Submit a signed transaction and track its inclusion.
    pub async fn submit_and_track(&self, payload: &[u8]) -> Result<WriteHandle, SyncError> {
        let id = self
            .ledger
            .submit_transaction(payload)
            .await
            .map_err(|e| SyncError::SubmissionError(e.to_string()))?;
        info!("Submitted transaction {}", id);
        self.writes.track(id)
    }

    /// Run a funding loop until shutdown.
    pub fn spawn_funding(&mut self, funding: FundingLoop) {
        self.tasks.push(tokio::spawn(funding.run(self.cancel.clone())));
    }

    /// Stop every task, then resolve outstanding writes as cancelled.
    pub async fn shutdown(self) -> Result<(), SyncError> {
        info!("Shutting down store sync at {}", self.store.cursor());
        self.cancel.cancel();

        let mut failure = None;
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Sync task failed during shutdown: {}", e);
                failure = Some(SyncError::TaskError(e.to_string()));
            }
        }
        self.writes.cancel_all();

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::IndexerSnapshot;
    use crate::ledger::TransactionStatus;
    use crate::store::{Cursor, Query, STATIC_DATA, Value};
    use crate::sync::progress_tracker::SyncStep;
    use crate::sync::write_observer::WriteOutcome;
    use crate::testing::{
        FakeIndexer, FakeLedger, IndexerScript, key, set_event, table, tx, with_tx,
    };
    use std::time::Duration;

    fn options() -> SyncOptions {
        SyncOptions {
            polling_interval: Duration::from_millis(100),
            retry_max_elapsed: Duration::ZERO,
            reorder_idle: Duration::from_millis(20),
            ..SyncOptions::default()
        }
    }

    fn config(ledger: Arc<FakeLedger>, tables: Vec<TableId>) -> StoreSyncConfig {
        StoreSyncConfig {
            tables,
            ledger,
            indexer: None,
            chain_head: None,
            options: options(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_then_stream_keeps_cursor_continuity() {
        let ledger = Arc::new(FakeLedger::new(3));
        ledger.push_event(2, set_event(&table(), 1, 1, 0));
        let sync = StoreSync::start(config(ledger.clone(), vec![table()]))
            .await
            .unwrap();
        assert_eq!(sync.store().cursor(), Cursor::end_of_block(3));
        let mut subscription = sync.store().subscribe(Query::row(table(), key(1)));

        ledger.push_event(4, set_event(&table(), 1, 2, 0));
        ledger.set_head(4);

        assert_eq!(subscription.changed().await, Some(Cursor::end_of_block(4)));
        assert_eq!(
            sync.store().get(&table(), &key(1)).unwrap()[STATIC_DATA],
            Value::Bytes(vec![2])
        );
        assert_eq!(sync.current_progress().step, SyncStep::Live);
        sync.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_allow_list_still_advances_cursor() {
        let ledger = Arc::new(FakeLedger::new(5));
        let indexer = Arc::new(FakeIndexer::new());
        indexer.script(IndexerScript::hanging_after(Vec::new()));
        let sync = StoreSync::start(StoreSyncConfig {
            indexer: Some(indexer.clone()),
            ..config(ledger.clone(), Vec::new())
        })
        .await
        .unwrap();
        let mut events = sync.events();

        ledger.set_head(7);
        loop {
            if let SyncEvent::BatchApplied(batch) = events.recv().await.unwrap() {
                if batch.cursor == Cursor::end_of_block(7) {
                    break;
                }
            }
        }

        assert!(sync.store().snapshot().is_empty());
        assert_eq!(sync.store().cursor(), Cursor::end_of_block(7));
        assert_eq!(ledger.log_queries(), 0);
        assert!(indexer.subscriptions().is_empty());
        assert!(indexer.snapshot_requests().is_empty());
        sync.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_write_resolves_with_inclusion_cursor() {
        let ledger = Arc::new(FakeLedger::new(3));
        let sync = StoreSync::start(config(ledger.clone(), vec![table()]))
            .await
            .unwrap();
        let mut write_events = sync.write_events();

        let handle = sync.submit_and_track(&[9]).await.unwrap();
        assert_eq!(handle.id(), tx(9));
        ledger.push_event(5, with_tx(set_event(&table(), 1, 1, 0), tx(9)));
        ledger.set_head(5);

        assert_eq!(handle.await, WriteOutcome::Included(Cursor::end_of_block(5)));
        let event = write_events.recv().await.unwrap();
        assert_eq!(event.cursor, Some(Cursor::end_of_block(5)));
        sync.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_resolves_outstanding_writes_as_cancelled() {
        let ledger = Arc::new(FakeLedger::new(3));
        ledger.set_status(tx(4), TransactionStatus::Pending);
        let sync = StoreSync::start(config(ledger, vec![table()]))
            .await
            .unwrap();
        let handle = sync.track(tx(4)).unwrap();

        sync.shutdown().await.unwrap();

        assert_eq!(handle.await, WriteOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_end_after_shutdown() {
        let ledger = Arc::new(FakeLedger::new(3));
        let sync = StoreSync::start(config(ledger, vec![table()]))
            .await
            .unwrap();
        let store = sync.store().clone();
        let mut subscription = store.subscribe(Query::table(table()));

        sync.shutdown().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(60), subscription.changed()).await;
        assert_eq!(ended, Ok(None));
        assert_eq!(store.cursor(), Cursor::end_of_block(3));
    }

    #[tokio::test(start_paused = true)]
    async fn indexer_snapshot_and_stream_feed_the_replica() {
        let ledger = Arc::new(FakeLedger::new(10));
        ledger.push_event(11, set_event(&table(), 2, 7, 0));
        let indexer = Arc::new(FakeIndexer::new());
        indexer.set_snapshot(IndexerSnapshot {
            block_number: 10,
            events: vec![set_event(&table(), 1, 1, 0)],
        });
        indexer.script(IndexerScript::hanging_after(vec![ledger.batch(11)]));
        let sync = StoreSync::start(StoreSyncConfig {
            indexer: Some(indexer.clone()),
            ..config(ledger.clone(), vec![table()])
        })
        .await
        .unwrap();
        let mut subscription = sync.store().subscribe(Query::table(table()));

        assert_eq!(subscription.changed().await, Some(Cursor::end_of_block(11)));
        assert_eq!(sync.store().table(&table()).len(), 2);
        assert_eq!(indexer.subscriptions(), vec![Cursor::end_of_block(10)]);
        sync.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_failure_is_fatal() {
        let ledger = Arc::new(FakeLedger::new(3));
        ledger.set_failing(true);

        let result = StoreSync::start(config(ledger, vec![table()])).await;

        assert!(matches!(result, Err(SyncError::SnapshotError(_))));
    }
}
