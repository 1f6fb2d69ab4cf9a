//! Types for the store indexer's snapshot endpoint and log subscription

use crate::store::types::decode_fixed;
use crate::store::{
    Cursor, EventBatch, RowEvent, RowKey, RowOp, StoreTypeError, TableId, TxHash, raw_record,
};
use crate::utils::decode_hex;
use serde::{Deserialize, Serialize};

/// Block number as reported by the indexer, which serializes big integers as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BlockNumber {
    Number(u64),
    Text(String),
}

impl BlockNumber {
    pub fn value(&self) -> Result<u64, IndexerError> {
        match self {
            BlockNumber::Number(n) => Ok(*n),
            BlockNumber::Text(text) => text
                .parse()
                .map_err(|_| IndexerError::Malformed(format!("invalid block number {}", text))),
        }
    }
}

/// Store event names as they appear in indexer logs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StoreEventName {
    #[serde(rename = "Store_SetRecord")]
    SetRecord,
    #[serde(rename = "Store_DeleteRecord")]
    DeleteRecord,
    #[serde(rename = "Store_SpliceStaticData")]
    SpliceStaticData,
    #[serde(rename = "Store_SpliceDynamicData")]
    SpliceDynamicData,
}

/// Decoded arguments of a store event. Which fields are present depends on the event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreLogArgs {
    pub table_id: String,
    pub key_tuple: Vec<String>,
    pub static_data: Option<String>,
    pub encoded_lengths: Option<String>,
    pub dynamic_data: Option<String>,
    pub start: Option<u64>,
    pub delete_count: Option<u64>,
    pub data: Option<String>,
}

/// A store event log as returned by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerLog {
    pub event_name: StoreEventName,
    pub args: StoreLogArgs,
    /// Absent on snapshot logs, which are already collapsed per record.
    #[serde(default)]
    pub log_index: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

impl IndexerLog {
    /// Convert into a row event.
    ///
    /// `position` stands in for a missing log index; without it the log must carry its own.
    pub fn into_row_event(self, position: Option<u64>) -> Result<RowEvent, IndexerError> {
        let args = self.args;
        let table = TableId::from_hex(&args.table_id)?;
        let key = RowKey::from_words(
            args.key_tuple
                .iter()
                .map(|word| decode_fixed::<32>(word))
                .collect::<Result<Vec<_>, _>>()?,
        );

        let op = match self.event_name {
            StoreEventName::SetRecord => RowOp::Set(raw_record(
                hex_field(args.static_data.as_deref(), "staticData")?,
                hex_field(args.encoded_lengths.as_deref(), "encodedLengths")?,
                hex_field(args.dynamic_data.as_deref(), "dynamicData")?,
            )),
            StoreEventName::DeleteRecord => RowOp::Delete,
            StoreEventName::SpliceStaticData => RowOp::SpliceStatic {
                start: usize_field(args.start, "start")?,
                data: hex_field(args.data.as_deref(), "data")?,
            },
            StoreEventName::SpliceDynamicData => RowOp::SpliceDynamic {
                start: usize_field(args.start, "start")?,
                delete_count: usize_field(args.delete_count, "deleteCount")?,
                encoded_lengths: hex_field(args.encoded_lengths.as_deref(), "encodedLengths")?,
                data: hex_field(args.data.as_deref(), "data")?,
            },
        };
        op.check_bounds()?;
        let log_index = self
            .log_index
            .or(position)
            .ok_or_else(|| IndexerError::Malformed("missing logIndex".to_string()))?;

        let transaction_hash = self
            .transaction_hash
            .as_deref()
            .map(TxHash::from_hex)
            .transpose()?;

        Ok(RowEvent {
            table,
            key,
            op,
            log_index,
            transaction_hash,
        })
    }
}

fn hex_field(value: Option<&str>, field: &str) -> Result<Vec<u8>, IndexerError> {
    let value = value.ok_or_else(|| IndexerError::Malformed(format!("missing {}", field)))?;
    decode_hex(value)
        .map_err(|e| IndexerError::Store(StoreTypeError::InvalidHex(format!("{}: {}", field, e))))
}

fn usize_field(value: Option<u64>, field: &str) -> Result<usize, IndexerError> {
    value
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| IndexerError::Malformed(format!("missing or invalid {}", field)))
}

/// One block worth of logs, as delivered by the snapshot endpoint and each subscription message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexerBlock {
    pub block_number: BlockNumber,
    #[serde(default)]
    pub logs: Vec<IndexerLog>,
}

impl IndexerBlock {
    /// Convert a snapshot block into a batch. Snapshot logs may omit their index, in which case
    /// the record order is used.
    pub fn into_snapshot_batch(self) -> Result<EventBatch, IndexerError> {
        self.into_batch(true)
    }

    /// Convert a subscription block into a batch. Every log must carry its index.
    pub fn into_stream_batch(self) -> Result<EventBatch, IndexerError> {
        self.into_batch(false)
    }

    fn into_batch(self, positional: bool) -> Result<EventBatch, IndexerError> {
        let block_number = self.block_number.value()?;
        let mut events = self
            .logs
            .into_iter()
            .enumerate()
            .map(|(position, log)| log.into_row_event(positional.then_some(position as u64)))
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|event| event.log_index);
        Ok(EventBatch::new(Cursor::end_of_block(block_number), events))
    }
}

/// Envelope of the snapshot endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResponse {
    pub result: SnapshotResult,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotResult {
    pub data: IndexerBlock,
}

/// Table state as of `block_number`, in record order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerSnapshot {
    pub block_number: u64,
    pub events: Vec<RowEvent>,
}

/// Error types for indexer operations
#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("GraphQL error: {0}")]
    GraphQLError(String),

    #[error("No data returned")]
    NoData,

    #[error("WebSocket error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid store data: {0}")]
    Store(#[from] StoreTypeError),
}
