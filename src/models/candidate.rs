use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};

use super::{addr_checksum, addr_key, curve_index_for_multiplier};

/// Lifecycle state of a discovered token. Transitions are monotonic except
/// pending <-> error, which the scanner retries on the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Bought,
    Ignored,
    Error,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Bought => "bought",
            Self::Ignored => "ignored",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "bought" => Some(Self::Bought),
            "ignored" => Some(Self::Ignored),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token discovered via a creation event, awaiting a reputation-based
/// admission decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    /// Lowercase subject address; the store key.
    pub address: String,
    /// Checksummed display form.
    pub address_checksum: String,
    pub curve_index: u8,
    pub multiplier: u64,
    /// Transaction that created the token.
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_checked: Option<DateTime<Utc>>,
    pub status: CandidateStatus,

    pub creator_handle: Option<String>,
    pub follower_count: Option<u64>,
    pub is_verified: Option<bool>,

    pub bought_tx_hash: Option<String>,
    pub bought_at: Option<DateTime<Utc>>,
    pub ignored_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub poll_attempts: u32,
}

impl Candidate {
    pub fn new(subject: Address, tx_hash: H256, multiplier: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            address: addr_key(subject),
            address_checksum: addr_checksum(subject),
            curve_index: curve_index_for_multiplier(multiplier),
            multiplier,
            tx_hash: format!("{:#x}", tx_hash),
            created_at,
            last_checked: None,
            status: CandidateStatus::Pending,
            creator_handle: None,
            follower_count: None,
            is_verified: None,
            bought_tx_hash: None,
            bought_at: None,
            ignored_at: None,
            last_error: None,
            poll_attempts: 0,
        }
    }
}
