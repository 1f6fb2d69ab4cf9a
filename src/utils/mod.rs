//!
//! Utility module for the store sync client.
//!
//! Re-exports formatting and hex helpers used throughout the codebase.
/// Utility functions for formatting and hex encoding
pub mod index;

pub use index::{
    ETHER_DECIMALS, ONE_ETHER, decode_hex, encode_hex, format_ether, format_token_amount,
    parse_quantity, to_quantity,
};
