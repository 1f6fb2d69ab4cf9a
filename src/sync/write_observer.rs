//! Write observer: correlates submitted transactions with applied batches.
//!
//! A tracked transaction resolves with the cursor of the first applied batch carrying one of its
//! events. Writes that touch no synchronized table are confirmed through their receipt once the
//! applied cursor covers the receipt block. Reverted and dropped transactions fail as soon as the
//! ledger reports them; anything still pending after the configured time or block count fails with
//! a timeout. Every outcome is delivered once, to the handle and to the write event channel.

use crate::config::SyncOptions;
use crate::ledger::{LedgerTransport, TransactionStatus};
use crate::store::{Cursor, TxHash};
use crate::sync::SyncError;
use crate::sync::events::{SyncEvent, SyncEventHandler};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WRITE_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a tracked write did not make it into the replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
	Reverted { block_number: u64 },
	Dropped,
	Timeout,
}

/// Final outcome of a tracked write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
	/// Included; the cursor of the batch that made it visible in the replica
	Included(Cursor),
	Failed(WriteFailure),
	Cancelled,
}

/// Completed or failed write, as published to observers
#[derive(Debug, Clone)]
pub struct WriteEvent {
	pub id: TxHash,
	pub outcome: WriteOutcome,
	pub cursor: Option<Cursor>,
	pub completed_at: DateTime<Utc>,
}

/// Completion handle of a tracked write. Resolves to `Cancelled` if the observer goes away.
#[derive(Debug)]
pub struct WriteHandle {
	id: TxHash,
	rx: oneshot::Receiver<WriteOutcome>,
}

impl WriteHandle {
	pub fn id(&self) -> TxHash {
		self.id
	}
}

impl Future for WriteHandle {
	type Output = WriteOutcome;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx)
			.poll(cx)
			.map(|outcome| outcome.unwrap_or(WriteOutcome::Cancelled))
	}
}

struct PendingWrite {
	sender: oneshot::Sender<WriteOutcome>,
	tracked_at: Instant,
	tracked_at_block: u64,
	/// Receipt block of a successful write not yet covered by the applied cursor
	included_block: Option<u64>,
}

#[derive(Default)]
struct ObserverState {
	pending: HashMap<TxHash, PendingWrite>,
	applied: Cursor,
}

pub struct WriteObserver {
	ledger: Arc<dyn LedgerTransport>,
	state: Mutex<ObserverState>,
	events: broadcast::Sender<WriteEvent>,
	timeout: Duration,
	timeout_blocks: Option<u64>,
	status_interval: Duration,
}

impl WriteObserver {
	pub fn new(ledger: Arc<dyn LedgerTransport>, options: &SyncOptions) -> Self {
		let (events, _) = broadcast::channel(WRITE_EVENT_CHANNEL_CAPACITY);
		Self {
			ledger,
			state: Mutex::new(ObserverState::default()),
			events,
			timeout: options.write_timeout,
			timeout_blocks: options.write_timeout_blocks,
			status_interval: options.write_status_interval,
		}
	}

	fn state(&self) -> std::sync::MutexGuard<'_, ObserverState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn subscribe(&self) -> broadcast::Receiver<WriteEvent> {
		self.events.subscribe()
	}

	pub fn pending_count(&self) -> usize {
		self.state().pending.len()
	}

	/// Start tracking a submitted transaction.
	pub fn track(&self, id: TxHash) -> Result<WriteHandle, SyncError> {
		let mut state = self.state();
		if state.pending.contains_key(&id) {
			return Err(SyncError::AlreadyTracked(id));
		}
		let (sender, rx) = oneshot::channel();
		let tracked_at_block = state.applied.block_number;
		state.pending.insert(
			id,
			PendingWrite {
				sender,
				tracked_at: Instant::now(),
				tracked_at_block,
				included_block: None,
			},
		);
		debug!("Tracking write {} from block {}", id, tracked_at_block);
		Ok(WriteHandle { id, rx })
	}

	/// Deliver the outcomes of writes already removed from the pending set.
	fn deliver(&self, completed: Vec<(TxHash, PendingWrite, WriteOutcome)>) {
		for (id, pending, outcome) in completed {
			match outcome {
				WriteOutcome::Included(cursor) => info!("Write {} included at {}", id, cursor),
				WriteOutcome::Failed(failure) => warn!("Write {} failed: {:?}", id, failure),
				WriteOutcome::Cancelled => debug!("Write {} cancelled", id),
			}
			// The caller may have dropped its handle
			let _ = pending.sender.send(outcome);
			let cursor = match outcome {
				WriteOutcome::Included(cursor) => Some(cursor),
				_ => None,
			};
			let _ = self.events.send(WriteEvent {
				id,
				outcome,
				cursor,
				completed_at: Utc::now(),
			});
		}
	}

	fn take_where<F>(state: &mut ObserverState, mut decide: F) -> Vec<(TxHash, PendingWrite, WriteOutcome)>
	where
		F: FnMut(&TxHash, &PendingWrite) -> Option<WriteOutcome>,
	{
		let decided: Vec<(TxHash, WriteOutcome)> = state
			.pending
			.iter()
			.filter_map(|(id, pending)| decide(id, pending).map(|outcome| (*id, outcome)))
			.collect();
		decided
			.into_iter()
			.filter_map(|(id, outcome)| {
				state
					.pending
					.remove(&id)
					.map(|pending| (id, pending, outcome))
			})
			.collect()
	}

	fn expired(&self, pending: &PendingWrite, applied_block: u64) -> bool {
		if pending.tracked_at.elapsed() >= self.timeout {
			return true;
		}
		self.timeout_blocks.is_some_and(|blocks| {
			applied_block.saturating_sub(pending.tracked_at_block) >= blocks
		})
	}

	fn on_batch_applied(&self, cursor: Cursor, transactions: impl Iterator<Item = TxHash>) {
		let completed = {
			let mut state = self.state();
			state.applied = cursor;

			let mut completed = Vec::new();
			for id in transactions {
				if let Some(pending) = state.pending.remove(&id) {
					completed.push((id, pending, WriteOutcome::Included(cursor)));
				}
			}
			completed.extend(Self::take_where(&mut state, |_, pending| {
				match pending.included_block {
					Some(block) if block <= cursor.block_number => {
						Some(WriteOutcome::Included(Cursor::end_of_block(block)))
					}
					_ => self
						.expired(pending, cursor.block_number)
						.then_some(WriteOutcome::Failed(WriteFailure::Timeout)),
				}
			}));
			completed
		};
		self.deliver(completed);
	}

	/// Check every pending write with the ledger, then expire timed-out ones.
	pub async fn poll_statuses(&self) {
		let ids: Vec<TxHash> = self.state().pending.keys().copied().collect();

		for id in ids {
			let status = match self.ledger.transaction_status(&id).await {
				Ok(status) => status,
				Err(e) => {
					debug!("Could not read status of {}: {}", id, e);
					continue;
				}
			};

			let completed = {
				let mut state = self.state();
				let applied_block = state.applied.block_number;
				let Some(pending) = state.pending.get_mut(&id) else {
					continue;
				};
				let outcome = match status {
					TransactionStatus::Pending => None,
					TransactionStatus::Reverted { block_number } => {
						Some(WriteOutcome::Failed(WriteFailure::Reverted { block_number }))
					}
					TransactionStatus::Dropped => Some(WriteOutcome::Failed(WriteFailure::Dropped)),
					TransactionStatus::Included { block_number } if block_number <= applied_block => {
						Some(WriteOutcome::Included(Cursor::end_of_block(block_number)))
					}
					TransactionStatus::Included { block_number } => {
						pending.included_block = Some(block_number);
						None
					}
				};
				outcome.and_then(|outcome| {
					state
						.pending
						.remove(&id)
						.map(|pending| vec![(id, pending, outcome)])
				})
			};
			if let Some(completed) = completed {
				self.deliver(completed);
			}
		}

		let completed = {
			let mut state = self.state();
			let applied_block = state.applied.block_number;
			Self::take_where(&mut state, |_, pending| {
				self.expired(pending, applied_block)
					.then_some(WriteOutcome::Failed(WriteFailure::Timeout))
			})
		};
		self.deliver(completed);
	}

	/// Resolve every outstanding write as cancelled.
	pub fn cancel_all(&self) {
		let completed = {
			let mut state = self.state();
			Self::take_where(&mut state, |_, _| Some(WriteOutcome::Cancelled))
		};
		if !completed.is_empty() {
			info!("Cancelling {} outstanding writes", completed.len());
		}
		self.deliver(completed);
	}

	/// Check statuses on an interval until cancelled, then cancel what is left.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
		let mut interval = tokio::time::interval(self.status_interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = interval.tick() => self.poll_statuses().await,
			}
		}
		self.cancel_all();
	}
}

#[async_trait::async_trait]
impl SyncEventHandler for WriteObserver {
	async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
		match event {
			SyncEvent::SnapshotLoaded { cursor, .. } => {
				self.state().applied = *cursor;
			}
			SyncEvent::BatchApplied(batch) => {
				self.on_batch_applied(batch.cursor, batch.transactions.iter().copied());
			}
			_ => {}
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"WriteObserver"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::{LedgerError, MockLedgerTransport};
	use crate::store::AppliedBatch;
	use crate::testing::{FakeLedger, tx};
	use std::collections::BTreeSet;

	fn options() -> SyncOptions {
		SyncOptions {
			write_timeout: Duration::from_secs(60),
			write_timeout_blocks: Some(10),
			..SyncOptions::default()
		}
	}

	fn applied(block: u64, transactions: &[TxHash]) -> SyncEvent {
		SyncEvent::BatchApplied(Arc::new(AppliedBatch {
			cursor: Cursor::end_of_block(block),
			previous: Cursor::end_of_block(block.saturating_sub(1)),
			changes: Vec::new(),
			transactions: transactions.iter().copied().collect::<BTreeSet<_>>(),
		}))
	}

	#[tokio::test]
	async fn resolves_with_cursor_of_inclusion_batch() {
		let observer = WriteObserver::new(Arc::new(FakeLedger::new(0)), &options());
		let mut events = observer.subscribe();
		let handle = observer.track(tx(1)).unwrap();

		observer.handle(&applied(3, &[tx(2)])).await.unwrap();
		observer.handle(&applied(4, &[tx(1)])).await.unwrap();

		assert_eq!(handle.await, WriteOutcome::Included(Cursor::end_of_block(4)));
		let event = events.try_recv().unwrap();
		assert_eq!(event.id, tx(1));
		assert_eq!(event.cursor, Some(Cursor::end_of_block(4)));
		assert_eq!(observer.pending_count(), 0);
	}

	#[tokio::test]
	async fn tracking_twice_is_rejected() {
		let observer = WriteObserver::new(Arc::new(FakeLedger::new(0)), &options());
		let _handle = observer.track(tx(1)).unwrap();

		assert!(matches!(observer.track(tx(1)), Err(SyncError::AlreadyTracked(_))));
	}

	#[tokio::test]
	async fn dropped_transaction_fails_on_first_status_check() {
		let mut ledger = MockLedgerTransport::new();
		ledger
			.expect_transaction_status()
			.times(1)
			.returning(|_| Ok(TransactionStatus::Dropped));
		let observer = WriteObserver::new(Arc::new(ledger), &options());
		let handle = observer.track(tx(1)).unwrap();

		observer.poll_statuses().await;

		assert_eq!(handle.await, WriteOutcome::Failed(WriteFailure::Dropped));
	}

	#[tokio::test]
	async fn reverted_transaction_fails_and_status_errors_keep_waiting() {
		let mut ledger = MockLedgerTransport::new();
		ledger
			.expect_transaction_status()
			.returning(|id| match id.0[0] {
				1 => Ok(TransactionStatus::Reverted { block_number: 7 }),
				_ => Err(LedgerError::NoData),
			});
		let observer = WriteObserver::new(Arc::new(ledger), &options());
		let reverted = observer.track(tx(1)).unwrap();
		let _unknown = observer.track(tx(2)).unwrap();

		observer.poll_statuses().await;

		assert_eq!(
			reverted.await,
			WriteOutcome::Failed(WriteFailure::Reverted { block_number: 7 })
		);
		assert_eq!(observer.pending_count(), 1);
	}

	#[tokio::test]
	async fn receipt_resolves_once_applied_cursor_covers_its_block() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_status(tx(1), TransactionStatus::Included { block_number: 5 });
		let observer = WriteObserver::new(ledger, &options());
		let handle = observer.track(tx(1)).unwrap();

		observer.handle(&applied(4, &[])).await.unwrap();
		observer.poll_statuses().await;
		assert_eq!(observer.pending_count(), 1);

		observer.handle(&applied(6, &[])).await.unwrap();
		assert_eq!(handle.await, WriteOutcome::Included(Cursor::end_of_block(5)));
	}

	#[tokio::test]
	async fn times_out_after_configured_blocks() {
		let ledger = Arc::new(FakeLedger::new(0));
		let observer = WriteObserver::new(ledger, &options());
		observer
			.handle(&SyncEvent::SnapshotLoaded {
				cursor: Cursor::end_of_block(100),
				head: 100,
				records: 0,
			})
			.await
			.unwrap();
		let handle = observer.track(tx(1)).unwrap();

		observer.handle(&applied(109, &[])).await.unwrap();
		assert_eq!(observer.pending_count(), 1);
		observer.handle(&applied(110, &[])).await.unwrap();

		assert_eq!(handle.await, WriteOutcome::Failed(WriteFailure::Timeout));
	}

	#[tokio::test(start_paused = true)]
	async fn times_out_after_configured_time() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_status(tx(1), TransactionStatus::Pending);
		let observer = WriteObserver::new(ledger, &options());
		let handle = observer.track(tx(1)).unwrap();

		tokio::time::advance(Duration::from_secs(61)).await;
		observer.poll_statuses().await;

		assert_eq!(handle.await, WriteOutcome::Failed(WriteFailure::Timeout));
	}

	#[tokio::test(start_paused = true)]
	async fn shutdown_cancels_outstanding_writes() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_status(tx(1), TransactionStatus::Pending);
		let observer = Arc::new(WriteObserver::new(ledger, &options()));
		let handle = observer.track(tx(1)).unwrap();
		let cancel = CancellationToken::new();
		let task = tokio::spawn(observer.clone().run(cancel.clone()));

		tokio::time::sleep(Duration::from_secs(5)).await;
		cancel.cancel();
		task.await.unwrap();

		assert_eq!(handle.await, WriteOutcome::Cancelled);
		assert_eq!(observer.pending_count(), 0);
	}
}
