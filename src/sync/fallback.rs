//! Health-tracking selector over the indexer and ledger polling sources.
//!
//! The indexer is preferred. When it errors, ends, or stays silent longer than the configured
//! timeout, the same logical stream resumes from the highest delivered cursor on the ledger. Only
//! batches at or below the cursor the current source was opened from are dropped, so a switch
//! never duplicates a block. Within one source, late and repeated batches pass through untouched
//! and are left to the applier's reorder buffer. A failed indexer is skipped for a cooldown
//! period, after which it is tried again at a batch boundary.
//! When both sources fail without delivering a batch in between, the stream yields
//! `SourceError::Unavailable` and ends.

use crate::store::{Cursor, EventBatch};
use crate::sync::SourceError;
use crate::sync::source::{BatchStream, EventSource};
use crate::sync::types::SourceKind;

use futures_util::{StreamExt, stream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tracks when the preferred source last failed.
#[derive(Debug, Default)]
struct SourceHealth {
    failed_at: Option<Instant>,
}

impl SourceHealth {
    fn is_ready(&self, cooldown: Duration) -> bool {
        self.failed_at
            .is_none_or(|failed_at| failed_at.elapsed() >= cooldown)
    }
}

/// Event source preferring the indexer and falling back to ledger polling
pub struct FallbackSource {
    preferred: Option<Arc<dyn EventSource>>,
    fallback: Arc<dyn EventSource>,
    timeout: Duration,
    cooldown: Duration,
    health: Arc<Mutex<SourceHealth>>,
}

impl FallbackSource {
    /// `preferred` is absent when no indexer is configured, forcing polling only.
    pub fn new(
        preferred: Option<Arc<dyn EventSource>>,
        fallback: Arc<dyn EventSource>,
        timeout: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            preferred,
            fallback,
            timeout,
            cooldown,
            health: Arc::new(Mutex::new(SourceHealth::default())),
        }
    }
}

struct ActiveStream {
    kind: SourceKind,
    stream: BatchStream,
}

/// State of one logical fallback stream.
struct FallbackState {
    preferred: Option<Arc<dyn EventSource>>,
    fallback: Arc<dyn EventSource>,
    timeout: Duration,
    cooldown: Duration,
    health: Arc<Mutex<SourceHealth>>,
    active: Option<ActiveStream>,
    /// Highest delivered cursor
    last: Cursor,
    /// Cursor the active source was opened from
    floor: Cursor,
    preferred_failed: bool,
    fallback_failed: bool,
    done: bool,
}

impl FallbackState {
    fn preferred_ready(&self) -> bool {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_ready(self.cooldown)
    }

    fn record_failure(&mut self, kind: SourceKind, reason: &str) {
        warn!("{} failed after {}: {}", kind, self.last, reason);
        match kind {
            SourceKind::Indexer => {
                self.preferred_failed = true;
                self.health
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .failed_at = Some(Instant::now());
            }
            SourceKind::Ledger => self.fallback_failed = true,
        }
    }

    /// Pick the next source to open, or `None` when every source failed this round.
    fn next_candidate(&self) -> Option<Arc<dyn EventSource>> {
        if let Some(preferred) = &self.preferred {
            if !self.preferred_failed && (self.fallback_failed || self.preferred_ready()) {
                return Some(preferred.clone());
            }
        }
        if !self.fallback_failed {
            return Some(self.fallback.clone());
        }
        None
    }

    async fn open(&mut self, source: Arc<dyn EventSource>) -> bool {
        let kind = source.kind();
        let opened = match kind {
            SourceKind::Indexer => {
                match tokio::time::timeout(self.timeout, source.stream_from(self.last)).await {
                    Ok(result) => result,
                    Err(_) => Err(SourceError::Timeout(format!("opening {}", kind))),
                }
            }
            SourceKind::Ledger => source.stream_from(self.last).await,
        };

        match opened {
            Ok(stream) => {
                info!("Event stream now served by {} from {}", kind, self.last);
                self.active = Some(ActiveStream { kind, stream });
                self.floor = self.last;
                true
            }
            Err(e) => {
                self.record_failure(kind, &e.to_string());
                false
            }
        }
    }

    /// Switch back to the preferred source once its cooldown is over.
    async fn maybe_restore_preferred(&mut self) {
        let on_fallback = matches!(&self.active, Some(active) if active.kind == SourceKind::Ledger);
        if !on_fallback || self.preferred_failed || !self.preferred_ready() {
            return;
        }
        let Some(preferred) = self.preferred.clone() else {
            return;
        };
        let previous = self.active.take();
        if !self.open(preferred).await {
            self.active = previous;
        }
    }

    async fn next_item(&mut self) -> Option<Result<EventBatch, SourceError>> {
        if self.done {
            return None;
        }

        loop {
            self.maybe_restore_preferred().await;

            if self.active.is_none() {
                let Some(source) = self.next_candidate() else {
                    self.done = true;
                    return Some(Err(SourceError::Unavailable(format!(
                        "no event source could continue after {}",
                        self.last
                    ))));
                };
                self.open(source).await;
            }
            let Some(active) = self.active.as_mut() else {
                continue;
            };

            let kind = active.kind;
            let item = match kind {
                SourceKind::Indexer => {
                    match tokio::time::timeout(self.timeout, active.stream.next()).await {
                        Ok(item) => item,
                        Err(_) => Some(Err(SourceError::Timeout(format!(
                            "no {} response within {:?}",
                            kind, self.timeout
                        )))),
                    }
                }
                SourceKind::Ledger => active.stream.next().await,
            };

            match item {
                Some(Ok(batch)) => {
                    if batch.cursor <= self.floor {
                        debug!(
                            "Dropping batch {} from {}: opened after {}",
                            batch.cursor, kind, self.floor
                        );
                        continue;
                    }
                    self.last = self.last.max(batch.cursor);
                    self.preferred_failed = false;
                    self.fallback_failed = false;
                    return Some(Ok(batch));
                }
                Some(Err(e)) => {
                    self.active = None;
                    self.record_failure(kind, &e.to_string());
                }
                None => {
                    self.active = None;
                    self.record_failure(kind, "stream ended");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl EventSource for FallbackSource {
    async fn stream_from(&self, cursor: Cursor) -> Result<BatchStream, SourceError> {
        let state = FallbackState {
            preferred: self.preferred.clone(),
            fallback: self.fallback.clone(),
            timeout: self.timeout,
            cooldown: self.cooldown,
            health: self.health.clone(),
            active: None,
            last: cursor,
            floor: cursor,
            preferred_failed: false,
            fallback_failed: false,
            done: false,
        };

        Ok(Box::pin(stream::unfold(state, |mut state| async move {
            let item = state.next_item().await?;
            Some((item, state))
        })))
    }

    fn kind(&self) -> SourceKind {
        self.preferred
            .as_ref()
            .map_or_else(|| self.fallback.kind(), |preferred| preferred.kind())
    }
}
