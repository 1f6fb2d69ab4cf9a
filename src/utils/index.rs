/// Number of decimal places of the native token (wei per ether).
pub const ETHER_DECIMALS: u32 = 18;

/// One ether expressed in wei.
pub const ONE_ETHER: u128 = 1_000_000_000_000_000_000;

pub fn format_token_amount(amount: u128, decimals: u32) -> String {
    format!(
        "{:.*}",
        decimals.min(6) as usize,
        amount as f64 / 10f64.powi(decimals as i32)
    )
}

pub fn format_ether(amount: u128) -> String {
    format_token_amount(amount, ETHER_DECIMALS)
}

/// Encode bytes as a `0x`-prefixed lowercase hex string.
pub fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a hex string with or without the `0x` prefix.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value))
}

/// Parse a JSON-RPC hex quantity (`0x1a`) into an integer.
pub fn parse_quantity(value: &str) -> Option<u128> {
    let digits = value.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

pub fn to_quantity(value: u64) -> String {
    format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_round_trip_through_hex() {
        assert_eq!(parse_quantity("0x1a"), Some(26));
        assert_eq!(parse_quantity(&to_quantity(1_000_000)), Some(1_000_000));
        assert_eq!(parse_quantity("1a"), None);
        assert_eq!(parse_quantity("0x"), None);
    }

    #[test]
    fn formats_wei_as_ether() {
        assert_eq!(format_ether(ONE_ETHER), "1.000000");
        assert_eq!(format_ether(ONE_ETHER / 2), "0.500000");
    }

    #[test]
    fn hex_helpers_accept_optional_prefix() {
        assert_eq!(decode_hex("0x0a0b").unwrap(), vec![10, 11]);
        assert_eq!(decode_hex("0a0b").unwrap(), vec![10, 11]);
        assert_eq!(encode_hex(&[10, 11]), "0x0a0b");
    }
}
