//! Event system for store synchronization.
//!
//! This module defines the sync event types, the handler trait, and the dispatcher used throughout
//! the sync process. The snapshot loader and the log applier emit events; registered handlers (the
//! progress tracker and the write observer) react to them, and every event is also broadcast to
//! external subscribers. Handlers are called in registration order and always before the
//! broadcast, so observers never see an event the tracker has not accounted for.

use crate::store::{AppliedBatch, Cursor};
use crate::sync::SyncError;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events that occur during store synchronization
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The snapshot request was accepted; progress is measured from `start_block` to `head`
    SnapshotStarted { start_block: u64, head: u64 },
    /// Ledger replay covered blocks up to `cursor`
    SnapshotProgress { cursor: Cursor, head: u64 },
    /// The initial replica is complete
    SnapshotLoaded {
        cursor: Cursor,
        head: u64,
        records: usize,
    },
    /// A batch was applied to the replica
    BatchApplied(Arc<AppliedBatch>),
    /// A batch at or below the applied cursor was discarded
    DuplicateBatch { cursor: Cursor, applied: Cursor },
    /// Both event sources failed; the stream is retried on a timer
    SyncUnavailable { reason: String },
    /// Batches are flowing again after an outage
    SyncResumed { cursor: Cursor },
}

/// Trait for handling sync events.
///
/// Implementors receive all sync events and update their own state through interior mutability.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers and external subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn SyncEventHandler>>,
    subscribers: broadcast::Sender<SyncEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        let (subscribers, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            handlers: Vec::new(),
            subscribers,
        }
    }

    /// Register a new event handler.
    ///
    /// Handlers are called in the order they are registered.
    pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    /// Receive every dispatched event.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.subscribers.subscribe()
    }

    /// Dispatch an event to all registered handlers, then to subscribers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&self, event: SyncEvent) {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(&event).await {
                error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
        // No subscribers is fine
        let _ = self.subscribers.send(event);
    }
}
