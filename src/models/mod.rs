pub mod candidate;
pub mod position;

pub use candidate::{Candidate, CandidateStatus};
pub use position::{Position, Purchase};

use ethers::types::Address;
use ethers::utils::to_checksum;

/// Pricing-curve multipliers the contract supports, in curve-index order.
pub const CURVE_MULTIPLIERS: [u64; 3] = [1, 5, 10];

/// Map a Trade event's multiplier field to the contract's curve index.
/// Unknown multipliers fall back to the default curve.
pub fn curve_index_for_multiplier(multiplier: u64) -> u8 {
    CURVE_MULTIPLIERS
        .iter()
        .position(|m| *m == multiplier)
        .unwrap_or(0) as u8
}

/// Canonical store key for a subject address: full lowercase hex with the
/// 0x prefix. All lookups are case-insensitive by construction.
pub fn addr_key(address: Address) -> String {
    format!("{:#x}", address)
}

/// EIP-55 checksummed display form.
pub fn addr_checksum(address: Address) -> String {
    to_checksum(&address, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn multiplier_ten_selects_curve_two() {
        assert_eq!(curve_index_for_multiplier(1), 0);
        assert_eq!(curve_index_for_multiplier(5), 1);
        assert_eq!(curve_index_for_multiplier(10), 2);
    }

    #[test]
    fn unknown_multiplier_falls_back_to_default_curve() {
        assert_eq!(curve_index_for_multiplier(42), 0);
    }

    #[test]
    fn addr_key_is_full_lowercase_hex() {
        let addr =
            Address::from_str("0xAb5801a7D398351b8bE11C439e05C5B3259aeC9B").unwrap();
        let key = addr_key(addr);
        assert_eq!(key, "0xab5801a7d398351b8be11c439e05c5b3259aec9b");
        assert_eq!(key.len(), 42);
    }

    #[test]
    fn checksum_round_trips_through_key() {
        let addr =
            Address::from_str("0xAb5801a7D398351b8bE11C439e05C5B3259aeC9B").unwrap();
        let parsed = Address::from_str(&addr_key(addr)).unwrap();
        assert_eq!(addr_checksum(parsed), addr_checksum(addr));
    }
}
