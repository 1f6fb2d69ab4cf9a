//!
//! Development faucet client and the periodic funding loop.
//!
//! When a faucet is configured, the player's balance is checked every cycle and topped up with a
//! fixed number of drips whenever it falls below the threshold. The loop never touches the replica.

use crate::ledger::LedgerTransport;
use crate::store::Address;
use crate::utils::{ONE_ETHER, format_ether};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error types for faucet operations
#[derive(Debug, thiserror::Error)]
pub enum FaucetError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("Faucet rejected the request with status {0}")]
	Rejected(u16),

	#[error("Balance check failed: {0}")]
	Balance(String),
}

/// Source of development funds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FaucetClient: Send + Sync {
	/// Request one drip of funds for `address`.
	async fn drip(&self, address: &Address) -> Result<(), FaucetError>;
}

/// Faucet service reached over HTTP
#[derive(Clone)]
pub struct HttpFaucetClient {
	http_client: Client,
	faucet_url: String,
}

impl HttpFaucetClient {
	pub fn new(faucet_url: String) -> Self {
		Self {
			http_client: Client::new(),
			faucet_url: faucet_url.trim_end_matches('/').to_string(),
		}
	}
}

#[async_trait]
impl FaucetClient for HttpFaucetClient {
	async fn drip(&self, address: &Address) -> Result<(), FaucetError> {
		let url = format!("{}/dripDev", self.faucet_url);
		debug!("Requesting drip for {} from {}", address, url);

		let response = self
			.http_client
			.post(&url)
			.json(&json!({ "address": address.to_string() }))
			.send()
			.await?;
		if !response.status().is_success() {
			return Err(FaucetError::Rejected(response.status().as_u16()));
		}
		Ok(())
	}
}

/// Keeps the player funded from a development faucet.
pub struct FundingLoop {
	ledger: Arc<dyn LedgerTransport>,
	faucet: Arc<dyn FaucetClient>,
	address: Address,
	threshold: u128,
	drips_per_cycle: usize,
	interval: Duration,
}

impl FundingLoop {
	pub fn new(ledger: Arc<dyn LedgerTransport>, faucet: Arc<dyn FaucetClient>, address: Address) -> Self {
		Self {
			ledger,
			faucet,
			address,
			threshold: ONE_ETHER,
			drips_per_cycle: 2,
			interval: Duration::from_secs(20),
		}
	}

	pub fn with_drips_per_cycle(mut self, drips_per_cycle: usize) -> Self {
		self.drips_per_cycle = drips_per_cycle;
		self
	}

	/// Check the balance once and drip if it is low. Returns the number of successful drips.
	pub async fn check_once(&self) -> Result<usize, FaucetError> {
		let balance = self
			.ledger
			.get_balance(&self.address)
			.await
			.map_err(|e| FaucetError::Balance(e.to_string()))?;
		info!("Player balance: {} ETH", format_ether(balance));

		if balance >= self.threshold {
			return Ok(0);
		}

		info!(
			"Balance below {} ETH, requesting {} drips for {}",
			format_ether(self.threshold),
			self.drips_per_cycle,
			self.address
		);
		let mut dripped = 0;
		for _ in 0..self.drips_per_cycle {
			match self.faucet.drip(&self.address).await {
				Ok(()) => dripped += 1,
				Err(e) => warn!("Faucet drip failed: {}", e),
			}
		}

		if dripped > 0 {
			if let Ok(balance) = self.ledger.get_balance(&self.address).await {
				info!("Player balance after drip: {} ETH", format_ether(balance));
			}
		}
		Ok(dripped)
	}

	/// Check immediately, then every interval until cancelled.
	pub async fn run(self, cancel: CancellationToken) {
		info!(
			"Funding {} every {:?} while below {} ETH",
			self.address,
			self.interval,
			format_ether(self.threshold)
		);
		let mut interval = tokio::time::interval(self.interval);
		interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = interval.tick() => {
					if let Err(e) = self.check_once().await {
						warn!("Funding check failed: {}", e);
					}
				}
			}
		}
		debug!("Funding loop stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::FakeLedger;

	fn player() -> Address {
		Address([7; 20])
	}

	#[tokio::test]
	async fn low_balance_requests_configured_drips() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_balance(ONE_ETHER / 2);
		let mut faucet = MockFaucetClient::new();
		faucet
			.expect_drip()
			.withf(|address| *address == Address([7; 20]))
			.times(2)
			.returning(|_| Ok(()));
		let funding = FundingLoop::new(ledger, Arc::new(faucet), player());

		assert_eq!(funding.check_once().await.unwrap(), 2);
	}

	#[tokio::test]
	async fn balance_at_threshold_requests_nothing() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_balance(ONE_ETHER);
		let mut faucet = MockFaucetClient::new();
		faucet.expect_drip().times(0);
		let funding = FundingLoop::new(ledger.clone(), Arc::new(faucet), player());

		assert_eq!(funding.check_once().await.unwrap(), 0);
		assert_eq!(ledger.balance_queries(), 1);
	}

	#[tokio::test]
	async fn failed_drip_is_counted_out() {
		let ledger = Arc::new(FakeLedger::new(0));
		let mut faucet = MockFaucetClient::new();
		let mut calls = 0;
		faucet.expect_drip().times(3).returning(move |_| {
			calls += 1;
			if calls == 2 {
				Err(FaucetError::Rejected(503))
			} else {
				Ok(())
			}
		});
		let funding =
			FundingLoop::new(ledger, Arc::new(faucet), player()).with_drips_per_cycle(3);

		assert_eq!(funding.check_once().await.unwrap(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn loop_checks_immediately_then_every_interval() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_balance(ONE_ETHER * 5);
		let funding = FundingLoop::new(ledger.clone(), Arc::new(MockFaucetClient::new()), player());
		let cancel = CancellationToken::new();
		let task = tokio::spawn(funding.run(cancel.clone()));

		tokio::time::sleep(Duration::from_secs(45)).await;
		cancel.cancel();
		task.await.unwrap();

		// t = 0, 20 and 40
		assert_eq!(ledger.balance_queries(), 3);
	}

	#[tokio::test]
	async fn ledger_failure_is_reported() {
		let ledger = Arc::new(FakeLedger::new(0));
		ledger.set_failing(true);
		let funding = FundingLoop::new(ledger, Arc::new(MockFaucetClient::new()), player());

		assert!(matches!(
			funding.check_once().await,
			Err(FaucetError::Balance(_))
		));
	}
}
