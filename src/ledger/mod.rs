//! Ledger integration module
//!
//! This module provides the transport trait the sync layer reads from and writes through, the
//! JSON-RPC implementation of it, and ABI decoding of store event logs.

/// ABI decoding of store event logs
mod abi;
/// JSON-RPC client and the transport traits
mod client;
/// Type definitions for ledger RPC data structures
mod types;

pub use abi::decode_store_event;
#[cfg(test)]
pub use client::MockLedgerTransport;
pub use client::{ChainHead, JsonRpcLedgerClient, LedgerChainHead, LedgerTransport};
pub use types::*;
