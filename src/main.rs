use std::sync::Arc;

use dotenv::dotenv;
use store_sync::config::{AppConfig, get_app_config, get_store_event_topics};
use store_sync::faucet::{FundingLoop, HttpFaucetClient};
use store_sync::indexer::{IndexerClient, IndexerTransport};
use store_sync::ledger::{JsonRpcLedgerClient, LedgerTransport};
use store_sync::sync::{StoreSync, StoreSyncConfig, SyncStep};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	// A missing .env file is fine; the environment may be set directly
	if let Err(e) = dotenv() {
		warn!("No .env file loaded: {}", e);
	}

	let config = match get_app_config() {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			return;
		}
	};

	let sync_config = match build_sync_config(&config) {
		Ok(sync_config) => sync_config,
		Err(e) => {
			error!("Failed to set up clients: {}", e);
			return;
		}
	};
	let ledger = sync_config.ledger.clone();

	info!("Starting store sync for world {}", config.world_address);
	let mut sync = match StoreSync::start(sync_config).await {
		Ok(sync) => sync,
		Err(e) => {
			error!("Failed to start store sync: {}", e);
			return;
		}
	};

	let tables: Vec<String> = sync.tables().iter().map(|table| table.to_string()).collect();
	info!("Synchronizing tables: [{}]", tables.join(", "));

	match (&config.faucet_service_url, config.player_address()) {
		(Some(faucet_url), Ok(Some(player))) => {
			let faucet = Arc::new(HttpFaucetClient::new(faucet_url.clone()));
			sync.spawn_funding(FundingLoop::new(ledger, faucet, player));
		}
		(_, Err(e)) => warn!("Funding disabled, invalid player address: {}", e),
		_ => info!("No faucet configured, funding disabled"),
	}

	let mut progress = sync.progress();
	let reporter = tokio::spawn(async move {
		loop {
			let current = progress.borrow_and_update().clone();
			info!(
				"[{}] {:.1}% {}{}",
				current.step,
				current.percentage,
				current.message,
				if current.unavailable { " (sources unavailable)" } else { "" }
			);
			if current.step == SyncStep::Live {
				info!("Replica is live");
			}
			if progress.changed().await.is_err() {
				break;
			}
		}
	});

	if let Err(e) = tokio::signal::ctrl_c().await {
		error!("Failed to listen for shutdown signal: {}", e);
	}
	info!("Shutting down");
	if let Err(e) = sync.shutdown().await {
		error!("Shutdown incomplete: {}", e);
	}
	reporter.abort();
}

/// Build the ledger and optional indexer clients from the configuration.
fn build_sync_config(config: &AppConfig) -> Result<StoreSyncConfig, Box<dyn std::error::Error>> {
	let world_address = config.world_address()?;
	let topics = get_store_event_topics()?;

	let ledger: Arc<dyn LedgerTransport> = Arc::new(JsonRpcLedgerClient::new(
		config.rpc_url.clone(),
		world_address,
		topics,
	)?);

	let indexer = match &config.indexer_url {
		Some(indexer_url) => {
			let client = IndexerClient::new(
				indexer_url.clone(),
				config.indexer_ws_url.clone(),
				config.chain_id,
				world_address,
			)?;
			Some(Arc::new(client) as Arc<dyn IndexerTransport>)
		}
		None => {
			info!("No indexer configured, polling the ledger only");
			None
		}
	};

	Ok(StoreSyncConfig {
		tables: config.table_ids()?,
		ledger,
		indexer,
		chain_head: None,
		options: config.sync_options(),
	})
}
