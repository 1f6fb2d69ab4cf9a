//!
//! JSON-RPC client for reading store events from, and submitting transactions to, the ledger.
//!
//! This is the direct-polling side of synchronization: it is always available, but slower and
//! rate-limited compared to the indexer. All methods are async and designed for use with Tokio.

use super::abi::decode_store_event;
use super::types::*;
use crate::store::{Address, Cursor, EventBatch, RowEvent, TableId, TxHash};
use crate::utils::{decode_hex, encode_hex, parse_quantity, to_quantity};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Capabilities the sync layer needs from the ledger.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerTransport: Send + Sync {
	/// Latest block number.
	async fn get_chain_head(&self) -> Result<u64, LedgerError>;

	/// Store events for the given tables after `from`, up to and including block `to` (the
	/// chain head when `None`). One batch per block; the last block of the range is always
	/// represented, with an empty batch if it had no events.
	async fn get_events_in_range(
		&self,
		from: Cursor,
		to: Option<u64>,
		filters: &[TableId],
	) -> Result<Vec<EventBatch>, LedgerError>;

	/// Submit a signed transaction, returning its hash.
	async fn submit_transaction(&self, payload: &[u8]) -> Result<TxHash, LedgerError>;

	async fn get_balance(&self, address: &Address) -> Result<u128, LedgerError>;

	async fn transaction_status(&self, tx: &TxHash) -> Result<TransactionStatus, LedgerError>;
}

/// Source of the chain head used for progress reporting.
#[async_trait]
pub trait ChainHead: Send + Sync {
	async fn chain_head(&self) -> Result<u64, LedgerError>;
}

/// Chain head measured directly on the ledger.
pub struct LedgerChainHead {
	ledger: Arc<dyn LedgerTransport>,
}

impl LedgerChainHead {
	pub fn new(ledger: Arc<dyn LedgerTransport>) -> Self {
		Self { ledger }
	}
}

#[async_trait]
impl ChainHead for LedgerChainHead {
	async fn chain_head(&self) -> Result<u64, LedgerError> {
		self.ledger.get_chain_head().await
	}
}

/// JSON-RPC ledger client
pub struct JsonRpcLedgerClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// The JSON-RPC endpoint.
	rpc_url: String,
	/// Address of the world contract emitting store events.
	world_address: Address,
	/// Topic hashes of the store events.
	topics: StoreEventTopics,
	next_id: AtomicU64,
}

impl JsonRpcLedgerClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `rpc_url` - The JSON-RPC HTTP endpoint.
	/// * `world_address` - Address of the contract whose store events are synchronized.
	/// * `topics` - Store event topic hashes.
	pub fn new(
		rpc_url: String,
		world_address: Address,
		topics: StoreEventTopics,
	) -> Result<Self, LedgerError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			world_address,
			topics,
			next_id: AtomicU64::new(1),
		})
	}

	/// Execute a JSON-RPC call and return its `result` (which may be `null`).
	async fn call(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<serde_json::Value, LedgerError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": self.next_id.fetch_add(1, Ordering::Relaxed),
			"method": method,
			"params": params,
		});

		let response = self
			.http_client
			.post(&self.rpc_url)
			.json(&request_body)
			.send()
			.await?;

		if response.status() == StatusCode::TOO_MANY_REQUESTS {
			return Err(LedgerError::RateLimited(format!("{} rate limited", method)));
		}
		if !response.status().is_success() {
			return Err(LedgerError::MalformedResponse(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let mut response_json: serde_json::Value = response.json().await?;

		if let Some(error) = response_json.get("error") {
			let error: RpcErrorObject = serde_json::from_value(error.clone())?;
			return Err(LedgerError::RpcError {
				code: error.code,
				message: error.message,
			});
		}

		Ok(response_json
			.get_mut("result")
			.map(serde_json::Value::take)
			.unwrap_or(serde_json::Value::Null))
	}

	async fn call_quantity(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<u128, LedgerError> {
		let result = self.call(method, params).await?;
		result
			.as_str()
			.and_then(parse_quantity)
			.ok_or_else(|| LedgerError::MalformedResponse(format!("{} returned {}", method, result)))
	}

	async fn get_logs(
		&self,
		from_block: u64,
		to_block: u64,
		filters: &[TableId],
	) -> Result<Vec<RpcLog>, LedgerError> {
		let table_topics: Vec<String> = filters.iter().map(TableId::to_hex).collect();
		let params = json!([{
			"address": self.world_address.to_string(),
			"fromBlock": to_quantity(from_block),
			"toBlock": to_quantity(to_block),
			"topics": [self.topics.all(), table_topics],
		}]);

		let result = self.call("eth_getLogs", params).await?;
		Ok(serde_json::from_value(result)?)
	}

	/// Decode one log into a block number and row event.
	fn decode_log(&self, log: &RpcLog) -> Result<(u64, RowEvent), LedgerError> {
		if log.removed {
			return Err(LedgerError::MalformedLog(
				"log was removed by a reorg".to_string(),
			));
		}

		let block_number = quantity_field(log.block_number.as_deref(), "blockNumber")?;
		let log_index = quantity_field(log.log_index.as_deref(), "logIndex")?;

		let topic = log
			.topics
			.first()
			.ok_or_else(|| LedgerError::MalformedLog("log without topics".to_string()))?;
		let kind = self
			.topics
			.kind_of(topic)
			.ok_or_else(|| LedgerError::MalformedLog(format!("unknown event topic {}", topic)))?;
		let table = log
			.topics
			.get(1)
			.ok_or_else(|| LedgerError::MalformedLog("log without table id topic".to_string()))
			.and_then(|t| {
				TableId::from_hex(t).map_err(|e| LedgerError::MalformedLog(e.to_string()))
			})?;

		let data = decode_hex(&log.data).map_err(|e| LedgerError::MalformedLog(e.to_string()))?;
		let (key, op) = decode_store_event(kind, &data)?;

		let transaction_hash = log
			.transaction_hash
			.as_deref()
			.map(TxHash::from_hex)
			.transpose()
			.map_err(|e| LedgerError::MalformedLog(e.to_string()))?;

		Ok((
			block_number,
			RowEvent {
				table,
				key,
				op,
				log_index,
				transaction_hash,
			},
		))
	}
}

fn quantity_field(value: Option<&str>, field: &str) -> Result<u64, LedgerError> {
	value
		.and_then(parse_quantity)
		.and_then(|v| u64::try_from(v).ok())
		.ok_or_else(|| LedgerError::MalformedLog(format!("missing or invalid {}", field)))
}

#[async_trait]
impl LedgerTransport for JsonRpcLedgerClient {
	async fn get_chain_head(&self) -> Result<u64, LedgerError> {
		let head = self.call_quantity("eth_blockNumber", json!([])).await?;
		u64::try_from(head).map_err(|_| LedgerError::MalformedResponse(format!("head {}", head)))
	}

	async fn get_events_in_range(
		&self,
		from: Cursor,
		to: Option<u64>,
		filters: &[TableId],
	) -> Result<Vec<EventBatch>, LedgerError> {
		let from_block = from.next_block();
		let to_block = match to {
			Some(to) => to,
			None => self.get_chain_head().await?,
		};
		if to_block < from_block {
			return Ok(Vec::new());
		}

		// An empty allow-list must never turn into an unfiltered log query
		let logs = if filters.is_empty() {
			Vec::new()
		} else {
			self.get_logs(from_block, to_block, filters).await?
		};
		debug!(
			"Fetched {} store logs for blocks {}..={}",
			logs.len(),
			from_block,
			to_block
		);

		let mut blocks: BTreeMap<u64, Vec<RowEvent>> = BTreeMap::new();
		for log in &logs {
			let (block_number, event) = self.decode_log(log)?;
			if Cursor::new(block_number, event.log_index) <= from {
				continue;
			}
			blocks.entry(block_number).or_default().push(event);
		}
		blocks.entry(to_block).or_default();

		Ok(blocks
			.into_iter()
			.map(|(block_number, mut events)| {
				events.sort_by_key(|event| event.log_index);
				EventBatch::new(Cursor::end_of_block(block_number), events)
			})
			.collect())
	}

	async fn submit_transaction(&self, payload: &[u8]) -> Result<TxHash, LedgerError> {
		let result = self
			.call("eth_sendRawTransaction", json!([encode_hex(payload)]))
			.await?;
		let hash = result.as_str().ok_or(LedgerError::NoData)?;
		TxHash::from_hex(hash).map_err(|e| LedgerError::MalformedResponse(e.to_string()))
	}

	async fn get_balance(&self, address: &Address) -> Result<u128, LedgerError> {
		self.call_quantity("eth_getBalance", json!([address.to_string(), "latest"]))
			.await
	}

	async fn transaction_status(&self, tx: &TxHash) -> Result<TransactionStatus, LedgerError> {
		let receipt = self
			.call("eth_getTransactionReceipt", json!([tx.to_string()]))
			.await?;

		if receipt.is_null() {
			let transaction = self
				.call("eth_getTransactionByHash", json!([tx.to_string()]))
				.await?;
			return Ok(if transaction.is_null() {
				warn!("Transaction {} is no longer known to the node", tx);
				TransactionStatus::Dropped
			} else {
				TransactionStatus::Pending
			});
		}

		let receipt: RpcReceipt = serde_json::from_value(receipt)?;
		let block_number = quantity_field(receipt.block_number.as_deref(), "blockNumber")
			.map_err(|_| LedgerError::MalformedResponse("receipt without block".to_string()))?;

		match receipt.status.as_deref().and_then(parse_quantity) {
			Some(1) => Ok(TransactionStatus::Included { block_number }),
			Some(0) => Ok(TransactionStatus::Reverted { block_number }),
			other => Err(LedgerError::MalformedResponse(format!(
				"unexpected receipt status {:?}",
				other
			))),
		}
	}
}
