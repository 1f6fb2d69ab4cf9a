//! Types for direct JSON-RPC access to the ledger

use serde::Deserialize;

/// Store event kinds, identified on the ledger by their topic0 signature hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    SetRecord,
    DeleteRecord,
    SpliceStaticData,
    SpliceDynamicData,
}

/// Topic0 hashes of the four store events emitted by the world contract.
///
/// Loaded from the environment (`STORE_TOPIC_SET_RECORD`, ...) because they depend on the store
/// version the world was deployed with.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StoreEventTopics {
    pub set_record: String,
    pub delete_record: String,
    pub splice_static_data: String,
    pub splice_dynamic_data: String,
}

impl StoreEventTopics {
    /// Resolve the event kind for a log's topic0.
    pub fn kind_of(&self, topic: &str) -> Option<StoreEventKind> {
        let matches = |candidate: &str| candidate.eq_ignore_ascii_case(topic);
        if matches(&self.set_record) {
            Some(StoreEventKind::SetRecord)
        } else if matches(&self.delete_record) {
            Some(StoreEventKind::DeleteRecord)
        } else if matches(&self.splice_static_data) {
            Some(StoreEventKind::SpliceStaticData)
        } else if matches(&self.splice_dynamic_data) {
            Some(StoreEventKind::SpliceDynamicData)
        } else {
            None
        }
    }

    pub fn all(&self) -> Vec<String> {
        vec![
            self.set_record.clone(),
            self.delete_record.clone(),
            self.splice_static_data.clone(),
            self.splice_dynamic_data.clone(),
        ]
    }
}

/// Status of a submitted transaction as reported by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Known to the node, not yet in a block
    Pending,
    /// Included in a block and executed successfully
    Included { block_number: u64 },
    /// Included in a block but reverted
    Reverted { block_number: u64 },
    /// No longer known to the node
    Dropped,
}

/// Log entry as returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: Option<String>,
    pub log_index: Option<String>,
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

/// Subset of a transaction receipt used for write confirmation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub status: Option<String>,
    pub block_number: Option<String>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Error types for ledger RPC operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    RpcError { code: i64, message: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("No data returned")]
    NoData,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Malformed log: {0}")]
    MalformedLog(String),
}

impl LedgerError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::HttpError(_) | LedgerError::RateLimited(_) | LedgerError::NoData => true,
            // -32005 is the conventional "limit exceeded" code
            LedgerError::RpcError { code, .. } => *code == -32005,
            _ => false,
        }
    }
}
