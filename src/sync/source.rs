//! Event sources: the indexer subscription and direct ledger polling behind one trait.

use crate::config::SyncOptions;
use crate::indexer::IndexerTransport;
use crate::ledger::{LedgerError, LedgerTransport};
use crate::store::{Cursor, EventBatch, TableId};
use crate::sync::SourceError;
use crate::sync::retry::with_retry;
use crate::sync::types::SourceKind;

use futures_util::{Stream, StreamExt, stream};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Ordered stream of whole-block batches.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<EventBatch, SourceError>> + Send>>;

/// A provider of ordered event batches, restartable from any cursor
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
	/// Open a stream of the batches strictly after `cursor`.
	async fn stream_from(&self, cursor: Cursor) -> Result<BatchStream, SourceError>;

	/// Get the kind of this source for logging and selection
	fn kind(&self) -> SourceKind;
}

/// Streams store logs from the indexer subscription
pub struct IndexerSource {
	indexer: Arc<dyn IndexerTransport>,
	filters: Vec<TableId>,
	timeout: Duration,
}

impl IndexerSource {
	pub fn new(indexer: Arc<dyn IndexerTransport>, filters: Vec<TableId>, timeout: Duration) -> Self {
		Self {
			indexer,
			filters,
			timeout,
		}
	}
}

#[async_trait::async_trait]
impl EventSource for IndexerSource {
	async fn stream_from(&self, cursor: Cursor) -> Result<BatchStream, SourceError> {
		// An empty table filter would subscribe to every table in the world
		if self.filters.is_empty() {
			return Err(SourceError::NoTables);
		}
		let subscription =
			tokio::time::timeout(self.timeout, self.indexer.subscribe_events(cursor, &self.filters))
				.await
				.map_err(|_| SourceError::Timeout("indexer subscription".to_string()))??;

		info!("Streaming store logs from the indexer after {}", cursor);
		Ok(Box::pin(
			subscription.map(|item| item.map_err(SourceError::from)),
		))
	}

	fn kind(&self) -> SourceKind {
		SourceKind::Indexer
	}
}

/// Polls the ledger for store logs block range by block range
pub struct PollingSource {
	ledger: Arc<dyn LedgerTransport>,
	filters: Vec<TableId>,
	polling_interval: Duration,
	max_block_range: u64,
	retry_max_elapsed: Duration,
}

impl PollingSource {
	pub fn new(ledger: Arc<dyn LedgerTransport>, filters: Vec<TableId>, options: &SyncOptions) -> Self {
		Self {
			ledger,
			filters,
			polling_interval: options.polling_interval,
			max_block_range: options.max_block_range.max(1),
			retry_max_elapsed: options.retry_max_elapsed,
		}
	}
}

/// State of one polling stream.
struct PollState {
	ledger: Arc<dyn LedgerTransport>,
	filters: Vec<TableId>,
	polling_interval: Duration,
	max_block_range: u64,
	retry_max_elapsed: Duration,
	cursor: Cursor,
	pending: VecDeque<EventBatch>,
	failed: bool,
}

impl PollState {
	async fn next_batch(&mut self) -> Option<Result<EventBatch, SourceError>> {
		loop {
			if let Some(batch) = self.pending.pop_front() {
				return Some(Ok(batch));
			}
			if self.failed {
				return None;
			}

			let ledger = self.ledger.clone();
			let head = match with_retry(self.retry_max_elapsed, LedgerError::is_transient, || {
				ledger.get_chain_head()
			})
			.await
			{
				Ok(head) => head,
				Err(e) => {
					self.failed = true;
					return Some(Err(e.into()));
				}
			};

			let from_block = self.cursor.next_block();
			if head < from_block {
				tokio::time::sleep(self.polling_interval).await;
				continue;
			}
			let to_block = head.min(from_block.saturating_add(self.max_block_range - 1));

			let cursor = self.cursor;
			let filters = &self.filters;
			let batches = match with_retry(self.retry_max_elapsed, LedgerError::is_transient, || {
				ledger.get_events_in_range(cursor, Some(to_block), filters)
			})
			.await
			{
				Ok(batches) => batches,
				Err(e) => {
					self.failed = true;
					return Some(Err(e.into()));
				}
			};
			debug!(
				"Polled blocks {}..={}: {} batches",
				from_block,
				to_block,
				batches.len()
			);

			self.cursor = Cursor::end_of_block(to_block);
			self.pending.extend(batches);
		}
	}
}

#[async_trait::async_trait]
impl EventSource for PollingSource {
	async fn stream_from(&self, cursor: Cursor) -> Result<BatchStream, SourceError> {
		info!("Polling the ledger for store logs after {}", cursor);
		let state = PollState {
			ledger: self.ledger.clone(),
			filters: self.filters.clone(),
			polling_interval: self.polling_interval,
			max_block_range: self.max_block_range,
			retry_max_elapsed: self.retry_max_elapsed,
			cursor,
			pending: VecDeque::new(),
			failed: false,
		};

		Ok(Box::pin(stream::unfold(state, |mut state| async move {
			let item = state.next_batch().await?;
			Some((item, state))
		})))
	}

	fn kind(&self) -> SourceKind {
		SourceKind::Ledger
	}
}
