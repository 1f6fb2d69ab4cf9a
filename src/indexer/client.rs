//!
//! Client for the store indexer.
//!
//! This module provides an async client for the indexing service that pre-aggregates store events.
//! It supports fetching a snapshot of the allow-listed tables over HTTP and a real-time GraphQL
//! subscription to store logs from a given block. All methods are async and designed for use with
//! Tokio.

use super::types::*;
use crate::store::{Address, Cursor, EventBatch, TableId};

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt, stream};
use reqwest::Client;
use serde_json::json;
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::{
	connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, error, info};

/// Stream of whole-block batches from the indexer subscription.
pub type IndexerEventStream = Pin<Box<dyn Stream<Item = Result<EventBatch, IndexerError>> + Send>>;

/// Capabilities the sync layer needs from the indexer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IndexerTransport: Send + Sync {
	/// Fetch the current state of the given tables.
	async fn get_snapshot(&self, filters: &[TableId]) -> Result<IndexerSnapshot, IndexerError>;

	/// Subscribe to store logs of the given tables for every block after `from`.
	async fn subscribe_events(
		&self,
		from: Cursor,
		filters: &[TableId],
	) -> Result<IndexerEventStream, IndexerError>;
}

const STORE_LOGS_SUBSCRIPTION: &str = r#"
    subscription StoreLogs($chainId: Int!, $address: String!, $tableIds: [String!]!, $fromBlock: Int!) {
        storeLogs(chainId: $chainId, address: $address, tableIds: $tableIds, fromBlock: $fromBlock) {
            blockNumber
            logs {
                eventName
                logIndex
                transactionHash
                args {
                    tableId
                    keyTuple
                    staticData
                    encodedLengths
                    dynamicData
                    start
                    deleteCount
                    data
                }
            }
        }
    }
"#;

/// Outcome of handling one subscription frame.
enum Frame {
	Batch(Result<EventBatch, IndexerError>),
	Ping,
	Skip,
	Complete,
}

/// Store indexer client
#[derive(Clone)]
pub struct IndexerClient {
	/// The underlying HTTP client for snapshot requests.
	http_client: Client,
	/// The base URL of the indexer HTTP API.
	indexer_url: String,
	/// The WebSocket URL for real-time subscriptions, if the indexer offers one.
	ws_url: Option<String>,
	chain_id: u64,
	world_address: Address,
}

impl IndexerClient {
	/// Create a new indexer client.
	///
	/// # Arguments
	/// * `indexer_url` - The HTTP endpoint of the indexer.
	/// * `ws_url` - The WebSocket endpoint for subscriptions.
	/// * `chain_id` - Chain the indexed world is deployed on.
	/// * `world_address` - Address of the indexed world.
	///
	/// # Returns
	/// A new `IndexerClient` instance, or an `IndexerError` if the HTTP client cannot be built.
	pub fn new(
		indexer_url: String,
		ws_url: Option<String>,
		chain_id: u64,
		world_address: Address,
	) -> Result<Self, IndexerError> {
		let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

		Ok(Self {
			http_client,
			indexer_url: indexer_url.trim_end_matches('/').to_string(),
			ws_url,
			chain_id,
			world_address,
		})
	}

	fn handle_frame(msg: Result<Message, tokio_tungstenite::tungstenite::Error>) -> Frame {
		let text = match msg {
			Ok(Message::Text(text)) => text,
			Ok(Message::Close(_)) => return Frame::Complete,
			Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => return Frame::Skip,
			Ok(_) => {
				return Frame::Batch(Err(IndexerError::GraphQLError(
					"Unexpected message type".to_string(),
				)));
			}
			Err(e) => return Frame::Batch(Err(IndexerError::WebSocketError(e))),
		};

		let parsed = match serde_json::from_str::<serde_json::Value>(&text) {
			Ok(parsed) => parsed,
			Err(e) => return Frame::Batch(Err(IndexerError::JsonError(e))),
		};

		let Some(msg_type) = parsed.get("type").and_then(|t| t.as_str()) else {
			return Frame::Batch(Err(IndexerError::GraphQLError(
				"Message missing type field".to_string(),
			)));
		};

		match msg_type {
			"next" => {
				let Some(block_data) = parsed
					.get("payload")
					.and_then(|p| p.get("data"))
					.and_then(|d| d.get("storeLogs"))
				else {
					return Frame::Batch(Err(IndexerError::NoData));
				};
				let batch = serde_json::from_value::<IndexerBlock>(block_data.clone())
					.map_err(|e| {
						error!("Failed to deserialize store logs: {}", e);
						IndexerError::JsonError(e)
					})
					.and_then(IndexerBlock::into_stream_batch);
				Frame::Batch(batch)
			}
			"error" => {
				let error_msg = parsed
					.get("payload")
					.and_then(|p| p.as_array())
					.and_then(|errors| errors.first())
					.and_then(|e| e.get("message"))
					.and_then(|m| m.as_str())
					.unwrap_or("Unknown subscription error");
				Frame::Batch(Err(IndexerError::GraphQLError(error_msg.to_string())))
			}
			"ping" => Frame::Ping,
			"complete" => {
				info!("Store log subscription completed");
				Frame::Complete
			}
			_ => {
				debug!("Ignoring message type: {}", msg_type);
				Frame::Skip
			}
		}
	}
}

#[async_trait]
impl IndexerTransport for IndexerClient {
	async fn get_snapshot(&self, filters: &[TableId]) -> Result<IndexerSnapshot, IndexerError> {
		let input = json!({
			"chainId": self.chain_id,
			"address": self.world_address.to_string(),
			"filters": filters
				.iter()
				.map(|table| json!({ "tableId": table.to_hex() }))
				.collect::<Vec<_>>(),
		});
		info!(
			"Requesting indexer snapshot of {} tables from {}",
			filters.len(),
			self.indexer_url
		);

		let response = self
			.http_client
			.get(format!("{}/getLogs", self.indexer_url))
			.query(&[("input", input.to_string())])
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(IndexerError::SessionError(format!(
				"HTTP error: {}",
				response.status()
			)));
		}

		let response: SnapshotResponse = response.json().await?;
		let batch = response.result.data.into_snapshot_batch()?;
		debug!(
			"Indexer snapshot at block {} holds {} records",
			batch.cursor.block_number,
			batch.events.len()
		);

		Ok(IndexerSnapshot {
			block_number: batch.cursor.block_number,
			events: batch.events,
		})
	}

	async fn subscribe_events(
		&self,
		from: Cursor,
		filters: &[TableId],
	) -> Result<IndexerEventStream, IndexerError> {
		let ws_url = self.ws_url.clone().ok_or_else(|| {
			IndexerError::SessionError("No subscription endpoint configured".to_string())
		})?;
		debug!("Attempting WebSocket connection to: {}", ws_url);

		// Create WebSocket request with required subprotocol
		let mut request = ws_url.into_client_request()?;
		request.headers_mut().insert(
			"Sec-WebSocket-Protocol",
			"graphql-transport-ws".parse().map_err(|_| {
				IndexerError::GraphQLError("Invalid WebSocket subprotocol header value".to_string())
			})?,
		);

		let (ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		// Send connection init
		let init_message = json!({
			"type": "connection_init"
		});
		ws_sender
			.send(Message::Text(init_message.to_string()))
			.await?;

		// Wait for connection ack
		match ws_receiver.next().await {
			Some(msg) => match msg? {
				Message::Text(text) => {
					let parsed: serde_json::Value = serde_json::from_str(&text)?;
					if parsed.get("type").and_then(|t| t.as_str()) != Some("connection_ack") {
						return Err(IndexerError::SessionError(
							"Connection not acknowledged".to_string(),
						));
					}
				}
				_ => {
					return Err(IndexerError::SessionError(
						"Unexpected message type during handshake".to_string(),
					));
				}
			},
			None => {
				return Err(IndexerError::SessionError(
					"Connection closed during handshake".to_string(),
				));
			}
		}

		// Start store log subscription
		let start_message = json!({
			"id": format!("store-logs-{}", rand::random::<u32>()),
			"type": "subscribe",
			"payload": {
				"query": STORE_LOGS_SUBSCRIPTION,
				"variables": {
					"chainId": self.chain_id,
					"address": self.world_address.to_string(),
					"tableIds": filters.iter().map(TableId::to_hex).collect::<Vec<_>>(),
					"fromBlock": from.next_block(),
				}
			}
		});

		ws_sender
			.send(Message::Text(start_message.to_string()))
			.await?;
		info!("Subscribed to indexer store logs from block {}", from.next_block());

		// The stream ends after the first error or on completion
		let stream = stream::unfold(Some((ws_sender, ws_receiver)), |state| async move {
			let (mut ws_sender, mut ws_receiver) = state?;
			loop {
				let msg = ws_receiver.next().await?;
				match IndexerClient::handle_frame(msg) {
					Frame::Batch(Ok(batch)) => {
						return Some((Ok(batch), Some((ws_sender, ws_receiver))));
					}
					Frame::Batch(Err(e)) => return Some((Err(e), None)),
					Frame::Ping => {
						let pong = json!({ "type": "pong" });
						if let Err(e) = ws_sender.send(Message::Text(pong.to_string())).await {
							return Some((Err(IndexerError::WebSocketError(e)), None));
						}
					}
					Frame::Skip => continue,
					Frame::Complete => return None,
				}
			}
		});

		Ok(Box::pin(stream))
	}
}
