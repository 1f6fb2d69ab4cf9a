//! Client-side replica of on-chain store tables.
//!
//! Loads a snapshot of an allow-list of tables, then follows their store events from an indexer
//! with a fallback to direct ledger polling, exposing the replica, sync progress and write
//! completion to the application.

pub mod config;
pub mod faucet;
pub mod indexer;
pub mod ledger;
pub mod store;
pub mod sync;
pub mod utils;

#[cfg(test)]
mod testing;
