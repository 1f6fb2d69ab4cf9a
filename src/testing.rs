//! In-memory ledger and indexer fakes for scenario tests.

use crate::indexer::{IndexerError, IndexerEventStream, IndexerSnapshot, IndexerTransport};
use crate::ledger::{LedgerError, LedgerTransport, TransactionStatus};
use crate::store::{
    Address, Cursor, EventBatch, RowEvent, RowKey, RowOp, TableId, TxHash, raw_record,
};

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub fn table() -> TableId {
    TableId::new("game", "UnitLevel").unwrap()
}

pub fn other_table() -> TableId {
    TableId::new("game", "Position").unwrap()
}

pub fn key(id: u8) -> RowKey {
    RowKey::from_words([[id; 32]])
}

/// A set-record event writing `value` as the static data of row `id`.
pub fn set_event(table: &TableId, id: u8, value: u8, log_index: u64) -> RowEvent {
    RowEvent {
        table: table.clone(),
        key: key(id),
        op: RowOp::Set(raw_record(vec![value], Vec::new(), Vec::new())),
        log_index,
        transaction_hash: None,
    }
}

pub fn delete_event(table: &TableId, id: u8, log_index: u64) -> RowEvent {
    RowEvent {
        table: table.clone(),
        key: key(id),
        op: RowOp::Delete,
        log_index,
        transaction_hash: None,
    }
}

pub fn with_tx(mut event: RowEvent, tx: TxHash) -> RowEvent {
    event.transaction_hash = Some(tx);
    event
}

pub fn tx(id: u8) -> TxHash {
    TxHash([id; 32])
}

/// Ledger holding store events per block, with a movable chain head.
pub struct FakeLedger {
    head: AtomicU64,
    blocks: Mutex<BTreeMap<u64, Vec<RowEvent>>>,
    statuses: Mutex<HashMap<TxHash, TransactionStatus>>,
    balance: Mutex<u128>,
    failing: AtomicBool,
    log_queries: AtomicUsize,
    balance_queries: AtomicUsize,
}

impl FakeLedger {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            blocks: Mutex::new(BTreeMap::new()),
            statuses: Mutex::new(HashMap::new()),
            balance: Mutex::new(0),
            failing: AtomicBool::new(false),
            log_queries: AtomicUsize::new(0),
            balance_queries: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_event(&self, block: u64, event: RowEvent) {
        self.blocks
            .lock()
            .unwrap()
            .entry(block)
            .or_default()
            .push(event);
    }

    /// The whole-block batch for `block`, as a source would deliver it.
    pub fn batch(&self, block: u64) -> EventBatch {
        let events = self
            .blocks
            .lock()
            .unwrap()
            .get(&block)
            .cloned()
            .unwrap_or_default();
        EventBatch::new(Cursor::end_of_block(block), events)
    }

    pub fn set_status(&self, tx: TxHash, status: TransactionStatus) {
        self.statuses.lock().unwrap().insert(tx, status);
    }

    pub fn set_balance(&self, balance: u128) {
        *self.balance.lock().unwrap() = balance;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn log_queries(&self) -> usize {
        self.log_queries.load(Ordering::SeqCst)
    }

    pub fn balance_queries(&self) -> usize {
        self.balance_queries.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LedgerError::RpcError {
                code: -32000,
                message: "node unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerTransport for FakeLedger {
    async fn get_chain_head(&self) -> Result<u64, LedgerError> {
        self.check_available()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_events_in_range(
        &self,
        from: Cursor,
        to: Option<u64>,
        filters: &[TableId],
    ) -> Result<Vec<EventBatch>, LedgerError> {
        self.check_available()?;
        let from_block = from.next_block();
        let to_block = to.unwrap_or_else(|| self.head.load(Ordering::SeqCst));
        if to_block < from_block {
            return Ok(Vec::new());
        }

        let mut batches: BTreeMap<u64, Vec<RowEvent>> = BTreeMap::new();
        if !filters.is_empty() {
            self.log_queries.fetch_add(1, Ordering::SeqCst);
            let blocks = self.blocks.lock().unwrap();
            for (block, events) in blocks.range(from_block..=to_block) {
                let selected: Vec<RowEvent> = events
                    .iter()
                    .filter(|event| filters.contains(&event.table))
                    .filter(|event| Cursor::new(*block, event.log_index) > from)
                    .cloned()
                    .collect();
                if !selected.is_empty() {
                    batches.insert(*block, selected);
                }
            }
        }
        batches.entry(to_block).or_default();

        Ok(batches
            .into_iter()
            .map(|(block, events)| EventBatch::new(Cursor::end_of_block(block), events))
            .collect())
    }

    async fn submit_transaction(&self, payload: &[u8]) -> Result<TxHash, LedgerError> {
        self.check_available()?;
        let hash = tx(payload.first().copied().unwrap_or_default());
        self.statuses
            .lock()
            .unwrap()
            .entry(hash)
            .or_insert(TransactionStatus::Pending);
        Ok(hash)
    }

    async fn get_balance(&self, _address: &Address) -> Result<u128, LedgerError> {
        self.check_available()?;
        self.balance_queries.fetch_add(1, Ordering::SeqCst);
        Ok(*self.balance.lock().unwrap())
    }

    async fn transaction_status(&self, tx: &TxHash) -> Result<TransactionStatus, LedgerError> {
        self.check_available()?;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(tx)
            .copied()
            .unwrap_or(TransactionStatus::Dropped))
    }
}

/// Scripted behavior of one indexer subscription.
pub struct IndexerScript {
    items: Vec<Result<EventBatch, IndexerError>>,
    hang: bool,
}

impl IndexerScript {
    /// Deliver `batches`, then complete.
    pub fn ending_after(batches: Vec<EventBatch>) -> Self {
        Self {
            items: batches.into_iter().map(Ok).collect(),
            hang: false,
        }
    }

    /// Deliver `batches`, then stay silent.
    pub fn hanging_after(batches: Vec<EventBatch>) -> Self {
        Self {
            items: batches.into_iter().map(Ok).collect(),
            hang: true,
        }
    }

    /// Deliver `batches`, then fail with `error`.
    pub fn failing_after(batches: Vec<EventBatch>, error: IndexerError) -> Self {
        let mut items: Vec<_> = batches.into_iter().map(Ok).collect();
        items.push(Err(error));
        Self { items, hang: false }
    }
}

/// Indexer serving a fixed snapshot and scripted subscriptions. A subscription without a
/// script fails.
#[derive(Default)]
pub struct FakeIndexer {
    snapshot: Mutex<Option<IndexerSnapshot>>,
    scripts: Mutex<VecDeque<IndexerScript>>,
    subscriptions: Mutex<Vec<Cursor>>,
    snapshot_requests: Mutex<Vec<Vec<TableId>>>,
}

impl FakeIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot(&self, snapshot: IndexerSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    pub fn script(&self, script: IndexerScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Cursors every subscription was opened from.
    pub fn subscriptions(&self) -> Vec<Cursor> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn snapshot_requests(&self) -> Vec<Vec<TableId>> {
        self.snapshot_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl IndexerTransport for FakeIndexer {
    async fn get_snapshot(&self, filters: &[TableId]) -> Result<IndexerSnapshot, IndexerError> {
        self.snapshot_requests.lock().unwrap().push(filters.to_vec());
        self.snapshot
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| IndexerError::SessionError("indexer offline".to_string()))
    }

    async fn subscribe_events(
        &self,
        from: Cursor,
        _filters: &[TableId],
    ) -> Result<IndexerEventStream, IndexerError> {
        self.subscriptions.lock().unwrap().push(from);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| IndexerError::SessionError("indexer offline".to_string()))?;

        let items = stream::iter(script.items);
        if script.hang {
            Ok(items.chain(stream::pending()).boxed())
        } else {
            Ok(items.boxed())
        }
    }
}
