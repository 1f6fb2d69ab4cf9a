//! Log applier: the single writer of the replica.
//!
//! Consumes the event stream from the replica cursor forward, restores cursor order through a
//! small reorder buffer, applies each batch atomically, and notifies the registered handlers once
//! per applied batch. When every source fails it reports the outage and reopens the stream from
//! its cursor after a delay.

use crate::config::SyncOptions;
use crate::store::{AppliedBatch, Cursor, EventBatch, ReplicaWriter};
use crate::sync::events::{EventDispatcher, SyncEvent};
use crate::sync::source::EventSource;

use futures_util::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Batches held back until they can be released in cursor order.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
	batches: BTreeMap<Cursor, EventBatch>,
}

impl ReorderBuffer {
	/// Hold a batch; a second batch at the same cursor is a duplicate and is dropped.
	pub fn push(&mut self, batch: EventBatch) -> bool {
		if self.batches.contains_key(&batch.cursor) {
			debug!("Dropping duplicate buffered batch {}", batch.cursor);
			return false;
		}
		self.batches.insert(batch.cursor, batch);
		true
	}

	/// Release the oldest batches until at most `window` remain.
	pub fn release_over(&mut self, window: usize) -> Vec<EventBatch> {
		let mut released = Vec::new();
		while self.batches.len() > window {
			match self.batches.pop_first() {
				Some((_, batch)) => released.push(batch),
				None => break,
			}
		}
		released
	}

	/// Release everything in cursor order.
	pub fn drain(&mut self) -> Vec<EventBatch> {
		std::mem::take(&mut self.batches).into_values().collect()
	}

	pub fn len(&self) -> usize {
		self.batches.len()
	}

	pub fn is_empty(&self) -> bool {
		self.batches.is_empty()
	}
}

pub struct LogApplier {
	writer: ReplicaWriter,
	source: Arc<dyn EventSource>,
	dispatcher: EventDispatcher,
	buffer: ReorderBuffer,
	reorder_window: usize,
	reorder_idle: Duration,
	retry_interval: Duration,
	unavailable: bool,
}

impl LogApplier {
	pub fn new(
		writer: ReplicaWriter,
		source: Arc<dyn EventSource>,
		dispatcher: EventDispatcher,
		options: &SyncOptions,
	) -> Self {
		Self {
			writer,
			source,
			dispatcher,
			buffer: ReorderBuffer::default(),
			reorder_window: options.reorder_window,
			reorder_idle: options.reorder_idle,
			retry_interval: options.retry_interval,
			unavailable: false,
		}
	}

	pub fn cursor(&self) -> Cursor {
		self.writer.cursor()
	}

	/// Apply one batch if it is strictly after the replica cursor, then notify handlers.
	pub async fn apply_batch(&mut self, batch: EventBatch) -> Option<Arc<AppliedBatch>> {
		let applied_cursor = self.writer.cursor();
		let Some(applied) = self.writer.apply(&batch) else {
			debug!(
				"Ignoring batch {} at or below applied cursor {}",
				batch.cursor, applied_cursor
			);
			self.dispatcher
				.dispatch(SyncEvent::DuplicateBatch {
					cursor: batch.cursor,
					applied: applied_cursor,
				})
				.await;
			return None;
		};

		debug!(
			"Applied batch {} with {} row changes",
			applied.cursor,
			applied.changes.len()
		);
		if std::mem::take(&mut self.unavailable) {
			info!("Sync resumed at {}", applied.cursor);
			self.dispatcher
				.dispatch(SyncEvent::SyncResumed {
					cursor: applied.cursor,
				})
				.await;
		}
		self.dispatcher
			.dispatch(SyncEvent::BatchApplied(applied.clone()))
			.await;
		Some(applied)
	}

	async fn apply_all(&mut self, batches: Vec<EventBatch>) {
		for batch in batches {
			self.apply_batch(batch).await;
		}
	}

	async fn flush(&mut self) {
		let batches = self.buffer.drain();
		self.apply_all(batches).await;
	}

	async fn mark_unavailable(&mut self, reason: String) {
		error!("Event stream unavailable: {}", reason);
		self.unavailable = true;
		self.dispatcher
			.dispatch(SyncEvent::SyncUnavailable { reason })
			.await;
	}

	/// Consume one stream until it ends or fails. Returns `false` once cancelled.
	async fn consume(&mut self, cancel: &CancellationToken) -> bool {
		let cursor = self.writer.cursor();
		let opened = tokio::select! {
			_ = cancel.cancelled() => return false,
			opened = self.source.stream_from(cursor) => opened,
		};
		let mut stream = match opened {
			Ok(stream) => stream,
			Err(e) => {
				self.mark_unavailable(e.to_string()).await;
				return true;
			}
		};

		loop {
			let next = tokio::select! {
				_ = cancel.cancelled() => return false,
				next = tokio::time::timeout(self.reorder_idle, stream.next()) => next,
			};

			match next {
				// Idle: whatever is held back is as ordered as it will get
				Err(_) => self.flush().await,
				Ok(Some(Ok(batch))) => {
					if batch.cursor <= self.writer.cursor() {
						self.apply_batch(batch).await;
						continue;
					}
					self.buffer.push(batch);
					let ready = self.buffer.release_over(self.reorder_window);
					self.apply_all(ready).await;
				}
				Ok(Some(Err(e))) => {
					self.flush().await;
					self.mark_unavailable(e.to_string()).await;
					return true;
				}
				Ok(None) => {
					self.flush().await;
					warn!("Event stream ended at {}", self.writer.cursor());
					return true;
				}
			}
		}
	}

	/// Run until cancelled, reopening the stream after failures.
	pub async fn run(mut self, cancel: CancellationToken) {
		info!("Log applier starting from {}", self.writer.cursor());
		while self.consume(&cancel).await {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tokio::time::sleep(self.retry_interval) => {}
			}
		}
		info!("Log applier stopped at {}", self.writer.cursor());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{Replica, ReplicaStore, STATIC_DATA, Value};
	use crate::sync::SourceError;
	use crate::sync::fallback::FallbackSource;
	use crate::sync::source::{BatchStream, IndexerSource, PollingSource};
	use crate::sync::types::SourceKind;
	use crate::testing::{FakeIndexer, FakeLedger, IndexerScript, key, set_event, table};
	use futures_util::stream;
	use std::sync::Mutex;

	/// Source replaying scripted streams, one per `stream_from` call.
	struct ScriptedSource {
		scripts: Mutex<Vec<Vec<Result<EventBatch, SourceError>>>>,
		opened_from: Mutex<Vec<Cursor>>,
	}

	impl ScriptedSource {
		fn new(mut scripts: Vec<Vec<Result<EventBatch, SourceError>>>) -> Self {
			scripts.reverse();
			Self {
				scripts: Mutex::new(scripts),
				opened_from: Mutex::new(Vec::new()),
			}
		}
	}

	#[async_trait::async_trait]
	impl EventSource for ScriptedSource {
		async fn stream_from(&self, cursor: Cursor) -> Result<BatchStream, SourceError> {
			self.opened_from.lock().unwrap().push(cursor);
			let items = self.scripts.lock().unwrap().pop().unwrap_or_default();
			Ok(Box::pin(stream::iter(items).chain(stream::pending())))
		}

		fn kind(&self) -> SourceKind {
			SourceKind::Ledger
		}
	}

	fn block(number: u64, value: u8) -> EventBatch {
		EventBatch::new(
			Cursor::end_of_block(number),
			vec![set_event(&table(), 1, value, 0)],
		)
	}

	fn options(reorder_window: usize) -> SyncOptions {
		SyncOptions {
			reorder_window,
			reorder_idle: Duration::from_millis(50),
			retry_interval: Duration::from_secs(1),
			..SyncOptions::default()
		}
	}

	fn setup(
		source: Arc<dyn EventSource>,
		reorder_window: usize,
	) -> (ReplicaStore, LogApplier, tokio::sync::broadcast::Receiver<SyncEvent>) {
		let (store, writer) = ReplicaStore::new(Replica::new(&[table()]));
		let dispatcher = EventDispatcher::new();
		let events = dispatcher.subscribe();
		let applier = LogApplier::new(writer, source, dispatcher, &options(reorder_window));
		(store, applier, events)
	}

	fn applied_cursors(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<u64> {
		let mut cursors = Vec::new();
		while let Ok(event) = events.try_recv() {
			if let SyncEvent::BatchApplied(batch) = event {
				cursors.push(batch.cursor.block_number);
			}
		}
		cursors
	}

	#[test]
	fn reorder_buffer_releases_in_cursor_order() {
		let mut buffer = ReorderBuffer::default();
		assert!(buffer.push(block(3, 3)));
		assert!(buffer.push(block(1, 1)));
		assert!(!buffer.push(block(3, 3)));
		assert!(buffer.push(block(2, 2)));

		let released: Vec<u64> = buffer
			.release_over(1)
			.iter()
			.map(|b| b.cursor.block_number)
			.collect();
		assert_eq!(released, vec![1, 2]);
		assert_eq!(buffer.len(), 1);
		assert_eq!(buffer.drain()[0].cursor, Cursor::end_of_block(3));
		assert!(buffer.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn out_of_order_and_duplicated_batches_apply_once_in_order() {
		let script = vec![
			Ok(block(2, 2)),
			Ok(block(1, 1)),
			Ok(block(2, 2)),
			Ok(block(4, 4)),
			Ok(block(3, 3)),
			Ok(block(1, 1)),
		];
		let source = Arc::new(ScriptedSource::new(vec![script]));
		let (store, applier, mut events) = setup(source, 4);
		let cancel = CancellationToken::new();
		let task = tokio::spawn(applier.run(cancel.clone()));

		tokio::time::sleep(Duration::from_millis(200)).await;
		cancel.cancel();
		task.await.unwrap();

		assert_eq!(applied_cursors(&mut events), vec![1, 2, 3, 4]);
		assert_eq!(store.cursor(), Cursor::end_of_block(4));
		assert_eq!(
			store.get(&table(), &key(1)).unwrap()[STATIC_DATA],
			Value::Bytes(vec![4])
		);
	}

	#[tokio::test(start_paused = true)]
	async fn same_result_for_any_delivery_order() {
		let orders: [&[u64]; 3] = [&[1, 2, 3], &[3, 1, 2], &[2, 2, 1, 3, 3]];
		let mut replicas = Vec::new();
		for order in orders {
			let script = order.iter().map(|n| Ok(block(*n, *n as u8))).collect();
			let source = Arc::new(ScriptedSource::new(vec![script]));
			let (store, applier, _) = setup(source, 8);
			let cancel = CancellationToken::new();
			let task = tokio::spawn(applier.run(cancel.clone()));
			tokio::time::sleep(Duration::from_millis(200)).await;
			cancel.cancel();
			task.await.unwrap();
			replicas.push(store.snapshot());
		}

		assert_eq!(replicas[0], replicas[1]);
		assert_eq!(replicas[1], replicas[2]);
	}

	#[tokio::test]
	async fn stale_batch_is_a_logged_no_op() {
		let source = Arc::new(ScriptedSource::new(Vec::new()));
		let (store, mut applier, mut events) = setup(source, 0);

		assert!(applier.apply_batch(block(5, 5)).await.is_some());
		assert!(applier.apply_batch(block(5, 9)).await.is_none());
		assert!(applier.apply_batch(block(4, 9)).await.is_none());

		assert_eq!(
			store.get(&table(), &key(1)).unwrap()[STATIC_DATA],
			Value::Bytes(vec![5])
		);
		let mut duplicates = 0;
		while let Ok(event) = events.try_recv() {
			if matches!(event, SyncEvent::DuplicateBatch { .. }) {
				duplicates += 1;
			}
		}
		assert_eq!(duplicates, 2);
	}

	#[tokio::test(start_paused = true)]
	async fn unavailable_stream_is_reopened_from_cursor() {
		let first = vec![
			Ok(block(1, 1)),
			Err(SourceError::Unavailable("both down".to_string())),
		];
		let second = vec![Ok(block(2, 2))];
		let source = Arc::new(ScriptedSource::new(vec![first, second]));
		let (store, applier, mut events) = setup(source.clone(), 0);
		let cancel = CancellationToken::new();
		let task = tokio::spawn(applier.run(cancel.clone()));

		tokio::time::sleep(Duration::from_secs(2)).await;
		cancel.cancel();
		task.await.unwrap();

		assert_eq!(store.cursor(), Cursor::end_of_block(2));
		assert_eq!(
			*source.opened_from.lock().unwrap(),
			vec![Cursor::default(), Cursor::end_of_block(1)]
		);

		let mut kinds = Vec::new();
		while let Ok(event) = events.try_recv() {
			kinds.push(match event {
				SyncEvent::BatchApplied(_) => "applied",
				SyncEvent::SyncUnavailable { .. } => "unavailable",
				SyncEvent::SyncResumed { .. } => "resumed",
				_ => "other",
			});
		}
		assert_eq!(kinds, vec!["applied", "unavailable", "resumed", "applied"]);
	}

	#[tokio::test(start_paused = true)]
	async fn late_indexer_batch_is_applied_through_fallback_source() {
		let ledger = Arc::new(FakeLedger::new(3));
		for block in 1..=3u8 {
			ledger.push_event(block as u64, set_event(&table(), block, block, 0));
		}
		let indexer = Arc::new(FakeIndexer::new());
		indexer.script(IndexerScript::hanging_after(vec![
			ledger.batch(2),
			ledger.batch(1),
			ledger.batch(3),
		]));
		let preferred: Arc<dyn EventSource> = Arc::new(IndexerSource::new(
			indexer,
			vec![table()],
			Duration::from_secs(5),
		));
		let fallback: Arc<dyn EventSource> =
			Arc::new(PollingSource::new(ledger, vec![table()], &options(4)));
		let source = Arc::new(FallbackSource::new(
			Some(preferred),
			fallback,
			Duration::from_secs(5),
			Duration::from_secs(3600),
		));
		let (store, applier, mut events) = setup(source, 4);
		let cancel = CancellationToken::new();
		let task = tokio::spawn(applier.run(cancel.clone()));

		tokio::time::sleep(Duration::from_millis(200)).await;
		cancel.cancel();
		task.await.unwrap();

		assert_eq!(applied_cursors(&mut events), vec![1, 2, 3]);
		for id in 1..=3u8 {
			assert_eq!(
				store.get(&table(), &key(id)).unwrap()[STATIC_DATA],
				Value::Bytes(vec![id])
			);
		}
	}
}
