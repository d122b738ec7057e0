use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Lower bound for the scanner poll interval. Values below this are clamped
/// so a misconfigured environment cannot hammer the reputation APIs.
pub const MIN_SCAN_INTERVAL_SECS: u64 = 2;

/// What happens to a candidate whose room never resolves a creator handle
/// before the eviction threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Remove the row entirely.
    Delete,
    /// Keep the row, marked ignored, as an audit trail.
    Ignore,
}

/// Which persistence backend backs the candidate store and position ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Sqlite,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub rpc_ws_url: String,
    pub wallet_private_key: String,
    pub chain_id: u64,
    pub contract_address: String,

    pub rooms_api_url: String,
    pub social_api_url: String,
    pub social_api_key: Option<String>,
    pub webhook_url: Option<String>,

    pub storage: StorageBackend,
    pub data_dir: String,
    pub database_path: String,

    pub buy_amount: u64,
    pub follower_threshold: u64,
    /// false: followers OR verified admits; true: both are required.
    pub require_verified: bool,
    pub eviction_policy: EvictionPolicy,
    pub max_poll_attempts: u32,
    pub evict_after_secs: u64,
    pub scan_interval_secs: u64,

    pub sell_delay_ms: u64,
    pub sell_gas_fallback: u64,
    pub fee_multiplier_pct: u64,
    /// 0 disables the max-hold position sweep.
    pub max_hold_secs: u64,

    pub heartbeat_secs: u64,
    pub stale_after_secs: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

impl Config {
    pub fn load() -> Result<Self> {
        let storage = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "file".to_string())
            .to_lowercase()
            .as_str()
        {
            "sqlite" => StorageBackend::Sqlite,
            _ => StorageBackend::File,
        };

        let eviction_policy = match env::var("EVICTION_POLICY")
            .unwrap_or_else(|_| "ignore".to_string())
            .to_lowercase()
            .as_str()
        {
            "delete" => EvictionPolicy::Delete,
            _ => EvictionPolicy::Ignore,
        };

        let scan_interval_secs =
            env_or("SCAN_INTERVAL_SECS", 5u64).max(MIN_SCAN_INTERVAL_SECS);

        Ok(Self {
            rpc_ws_url: env::var("WS_RPC_URL").context("WS_RPC_URL not set in environment")?,
            wallet_private_key: env::var("WALLET_PRIVATE_KEY")
                .context("WALLET_PRIVATE_KEY not set in environment")?,
            chain_id: env_or("CHAIN_ID", 8453u64),
            contract_address: env::var("SHARES_CONTRACT_ADDRESS")
                .context("SHARES_CONTRACT_ADDRESS not set in environment")?,

            rooms_api_url: env::var("ROOMS_API_URL")
                .context("ROOMS_API_URL not set in environment")?,
            social_api_url: env::var("SOCIAL_API_URL")
                .context("SOCIAL_API_URL not set in environment")?,
            social_api_key: env::var("SOCIAL_API_KEY").ok(),
            webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),

            storage,
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/sniper.db".to_string()),

            buy_amount: env_or("BUY_AMOUNT", 1u64),
            follower_threshold: env_or("FOLLOWER_THRESHOLD", 10_000u64),
            require_verified: env_or("REQUIRE_VERIFIED", false),
            eviction_policy,
            max_poll_attempts: env_or("MAX_POLL_ATTEMPTS", 30u32),
            evict_after_secs: env_or("EVICT_AFTER_SECS", 900u64),
            scan_interval_secs,

            sell_delay_ms: env_or("SELL_DELAY_MS", 300u64),
            sell_gas_fallback: env_or("SELL_GAS_LIMIT_FALLBACK", 300_000u64),
            fee_multiplier_pct: env_or("FEE_MULTIPLIER_PCT", 120u64),
            max_hold_secs: env_or("MAX_HOLD_SECS", 0u64),

            heartbeat_secs: env_or("HEARTBEAT_SECS", 30u64),
            stale_after_secs: env_or("STALE_AFTER_SECS", 120u64),
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", 10u32),
            reconnect_base_delay_ms: env_or("RECONNECT_BASE_DELAY_MS", 2_000u64),
        })
    }
}
