use crate::indexer::IndexerError;
use crate::ledger::LedgerError;
use crate::store::TxHash;

use std::fmt;

/// Which provider an event stream comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
	Indexer,
	Ledger,
}

impl fmt::Display for SourceKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SourceKind::Indexer => write!(f, "indexer"),
			SourceKind::Ledger => write!(f, "ledger polling"),
		}
	}
}

/// Errors produced by event sources
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
	#[error("Indexer error: {0}")]
	Indexer(#[from] IndexerError),

	#[error("Ledger error: {0}")]
	Ledger(#[from] LedgerError),

	#[error("Timed out: {0}")]
	Timeout(String),

	#[error("All event sources unavailable: {0}")]
	Unavailable(String),

	#[error("No tables to subscribe to")]
	NoTables,
}

/// Errors surfaced by the sync layer
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Snapshot failed: {0}")]
	SnapshotError(String),

	#[error("Transaction submission failed: {0}")]
	SubmissionError(String),

	#[error("Transaction {0} is already tracked")]
	AlreadyTracked(TxHash),

	#[error("Sync task failed: {0}")]
	TaskError(String),
}
