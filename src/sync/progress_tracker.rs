//! Progress tracking for store synchronization.
//!
//! This module provides the `SyncProgressTracker`, a forward-only state machine over
//! {connecting, snapshotting, live} with a completion percentage derived from the distance between
//! the applied cursor and the chain head measured when the snapshot started.
//!
//! The tracker is purely observational: it is registered as a sync event handler and publishes
//! every transition through a `watch` channel.

use crate::store::Cursor;
use crate::sync::SyncError;
use crate::sync::events::{SyncEvent, SyncEventHandler};

use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{info, warn};

/// Synchronization step; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStep {
    Connecting,
    Snapshotting,
    Live,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStep::Connecting => write!(f, "connecting"),
            SyncStep::Snapshotting => write!(f, "snapshotting"),
            SyncStep::Live => write!(f, "live"),
        }
    }
}

/// Observable sync progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    pub step: SyncStep,
    /// 0 to 100
    pub percentage: f64,
    pub message: String,
    /// Set while both event sources are failing; step and percentage are frozen meanwhile
    pub unavailable: bool,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            step: SyncStep::Connecting,
            percentage: 0.0,
            message: "Connecting".to_string(),
            unavailable: false,
        }
    }
}

/// Range progress is measured over.
#[derive(Debug, Clone, Copy, Default)]
struct ProgressRange {
    start_block: u64,
    head: u64,
}

impl ProgressRange {
    fn percentage(&self, cursor: Cursor) -> f64 {
        if self.head <= self.start_block {
            return 100.0;
        }
        let done = cursor.block_number.saturating_sub(self.start_block) as f64;
        let total = (self.head - self.start_block) as f64;
        (done / total * 100.0).clamp(0.0, 100.0)
    }
}

/// Service for tracking synchronization progress
pub struct SyncProgressTracker {
    state: watch::Sender<SyncProgress>,
    range: Mutex<Option<ProgressRange>>,
}

impl Default for SyncProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProgressTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SyncProgress::default());
        Self {
            state,
            range: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.state.subscribe()
    }

    pub fn current(&self) -> SyncProgress {
        self.state.borrow().clone()
    }

    fn range(&self) -> Option<ProgressRange> {
        *self.range.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `step` (never backwards) and update percentage and message.
    fn advance(&self, step: SyncStep, percentage: f64, message: String) {
        self.state.send_if_modified(|progress| {
            if step < progress.step {
                warn!(
                    "Ignoring backwards progress transition {} -> {}",
                    progress.step, step
                );
                return false;
            }
            if progress.step != step {
                info!("Sync step: {} -> {}", progress.step, step);
            }
            let updated = SyncProgress {
                step,
                percentage: if step == SyncStep::Live {
                    100.0
                } else {
                    percentage
                },
                message,
                unavailable: false,
            };
            if *progress == updated {
                return false;
            }
            *progress = updated;
            true
        });
    }

    fn on_batch_applied(&self, cursor: Cursor) {
        let step = self.current().step;
        if step == SyncStep::Live {
            // Terminal; only clear a stale outage flag
            self.state.send_if_modified(|progress| {
                std::mem::replace(&mut progress.unavailable, false)
            });
            return;
        }

        let Some(range) = self.range() else {
            return;
        };
        if step == SyncStep::Snapshotting && cursor.block_number >= range.head {
            self.advance(SyncStep::Live, 100.0, format!("Live at block {}", cursor.block_number));
        } else {
            self.advance(
                step,
                range.percentage(cursor),
                format!("Catching up: block {} of {}", cursor.block_number, range.head),
            );
        }
    }
}

#[async_trait::async_trait]
impl SyncEventHandler for SyncProgressTracker {
    async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
        match event {
            SyncEvent::SnapshotStarted { start_block, head } => {
                *self.range.lock().unwrap_or_else(PoisonError::into_inner) = Some(ProgressRange {
                    start_block: *start_block,
                    head: *head,
                });
                self.advance(
                    SyncStep::Snapshotting,
                    0.0,
                    format!("Loading snapshot up to block {}", head),
                );
            }
            SyncEvent::SnapshotProgress { cursor, head } => {
                if let Some(range) = self.range() {
                    self.advance(
                        SyncStep::Snapshotting,
                        range.percentage(*cursor),
                        format!("Replaying block {} of {}", cursor.block_number, head),
                    );
                }
            }
            SyncEvent::SnapshotLoaded {
                cursor,
                head,
                records,
            } => {
                if let Some(range) = self.range() {
                    self.advance(
                        SyncStep::Snapshotting,
                        range.percentage(*cursor),
                        format!(
                            "Snapshot loaded: {} records at block {} (head {})",
                            records, cursor.block_number, head
                        ),
                    );
                }
            }
            SyncEvent::BatchApplied(batch) => self.on_batch_applied(batch.cursor),
            SyncEvent::SyncUnavailable { reason } => {
                self.state.send_modify(|progress| {
                    progress.unavailable = true;
                    progress.message = format!("Sync unavailable: {}", reason);
                });
            }
            SyncEvent::SyncResumed { cursor } => {
                self.state.send_modify(|progress| {
                    progress.unavailable = false;
                    progress.message = format!("Resumed at block {}", cursor.block_number);
                });
            }
            SyncEvent::DuplicateBatch { .. } => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SyncProgressTracker"
    }
}
