use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One confirmed buy that contributed to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub amount: u64,
    pub tx_hash: String,
    pub timestamp: DateTime<Utc>,
}

/// Owned shares of one subject. The entry exists only while total_amount is
/// positive; the store removes it when a sell takes the total to zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Lowercase subject address; the store key.
    pub address: String,
    pub address_checksum: String,
    pub total_amount: u64,
    pub purchases: Vec<Purchase>,
}

impl Position {
    /// Timestamp of the earliest purchase, used by the max-hold sweep.
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.purchases.iter().map(|p| p.timestamp).min()
    }
}
