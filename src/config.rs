//! Process configuration loaded from the environment, and in-process sync tuning.

use crate::ledger::StoreEventTopics;
use crate::store::{Address, StoreTypeError, TableId};

use serde::Deserialize;
use std::time::Duration;

/// Errors raised while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid store identifier: {0}")]
    Store(#[from] StoreTypeError),
}

/// Chain and endpoint configuration, read from environment variables.
#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    pub world_address: String,
    /// Block the world was deployed in; replay from the ledger starts here.
    #[serde(default)]
    pub initial_block_number: u64,
    #[serde(default)]
    pub namespace: String,
    /// Comma-separated table names inside `namespace`.
    #[serde(default = "default_tables_to_fetch")]
    pub tables_to_fetch: Vec<String>,
    pub indexer_url: Option<String>,
    pub indexer_ws_url: Option<String>,
    pub faucet_service_url: Option<String>,
    pub player_address: Option<String>,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
}

fn default_chain_id() -> u64 {
    31337
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_tables_to_fetch() -> Vec<String> {
    vec!["UnitLevel".to_string()]
}

fn default_polling_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    /// Allow-list of tables to synchronize.
    pub fn table_ids(&self) -> Result<Vec<TableId>, ConfigError> {
        self.tables_to_fetch
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(|name| Ok(TableId::new(&self.namespace, name)?))
            .collect()
    }

    pub fn world_address(&self) -> Result<Address, ConfigError> {
        Ok(Address::from_hex(&self.world_address)?)
    }

    pub fn player_address(&self) -> Result<Option<Address>, ConfigError> {
        Ok(self
            .player_address
            .as_deref()
            .map(Address::from_hex)
            .transpose()?)
    }

    /// Sync tuning derived from this configuration.
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            start_block: self.initial_block_number,
            ..SyncOptions::default()
        }
    }
}

pub fn get_app_config() -> Result<AppConfig, ConfigError> {
    Ok(envy::from_env::<AppConfig>()?)
}

/// Store event topic hashes from `STORE_TOPIC_SET_RECORD`, `STORE_TOPIC_DELETE_RECORD`,
/// `STORE_TOPIC_SPLICE_STATIC_DATA` and `STORE_TOPIC_SPLICE_DYNAMIC_DATA`.
pub fn get_store_event_topics() -> Result<StoreEventTopics, ConfigError> {
    Ok(envy::prefixed("STORE_TOPIC_").from_env::<StoreEventTopics>()?)
}

/// Tuning of the sync pipeline.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Delay between chain head polls once caught up
    pub polling_interval: Duration,
    /// Largest block range requested from the ledger at once
    pub max_block_range: u64,
    /// Bound on indexer responses: snapshot, subscription setup and each streamed block
    pub indexer_timeout: Duration,
    /// How long a failed indexer is skipped before it is preferred again
    pub indexer_cooldown: Duration,
    /// Time budget for retrying transient errors against one source
    pub retry_max_elapsed: Duration,
    /// Delay before reopening the event stream after both sources failed
    pub retry_interval: Duration,
    /// Batches held back to restore ordering before the oldest is applied
    pub reorder_window: usize,
    /// Idle time after which held-back batches are applied anyway
    pub reorder_idle: Duration,
    /// A pending write fails after this long
    pub write_timeout: Duration,
    /// A pending write fails once this many blocks were applied after it was tracked
    pub write_timeout_blocks: Option<u64>,
    /// Interval between transaction status checks
    pub write_status_interval: Duration,
    /// First block replayed when snapshotting from the ledger
    pub start_block: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            max_block_range: 1000,
            indexer_timeout: Duration::from_secs(10),
            indexer_cooldown: Duration::from_secs(60),
            retry_max_elapsed: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
            reorder_window: 8,
            reorder_idle: Duration::from_millis(200),
            write_timeout: Duration::from_secs(120),
            write_timeout_blocks: None,
            write_status_interval: Duration::from_secs(2),
            start_block: 0,
        }
    }
}
