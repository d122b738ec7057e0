//! Shared test doubles: a programmable in-memory chain and reputation
//! evaluator, plus config/store helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use tokio::sync::{mpsc, Mutex};

use room_sniper::api::{ReputationEvaluator, SocialProfile};
use room_sniper::chain::{SharesChain, TradeEvent, TradeStream, TxConfirmation};
use room_sniper::config::{Config, EvictionPolicy, StorageBackend};
use room_sniper::error::{ApiError, ChainError};
use room_sniper::models::addr_key;
use room_sniper::storage::FileStore;

pub const WALLET: Address = Address::repeat_byte(0xee);

#[derive(Clone, Copy, Debug)]
pub enum EstimateBehavior {
    Ok,
    LastShare,
    InsufficientShares,
    Opaque,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: &'static str,
    pub subject: Address,
    pub amount: u64,
    pub curve_index: Option<u8>,
    pub tx_hash: H256,
}

/// Chain double. Events are injected through the sender returned by
/// `new()`; submissions are recorded and checked for overlap.
pub struct MockChain {
    pub submit_delay: Duration,
    pub estimates: Mutex<HashMap<String, EstimateBehavior>>,
    pub submissions: Mutex<Vec<Submission>>,
    active: AtomicUsize,
    overlapped: AtomicBool,
    next_tx: AtomicU64,
    events_rx: Mutex<Option<mpsc::Receiver<Result<TradeEvent, ChainError>>>>,
}

impl MockChain {
    pub fn new(
        submit_delay: Duration,
    ) -> (Arc<Self>, mpsc::Sender<Result<TradeEvent, ChainError>>) {
        let (tx, rx) = mpsc::channel(64);
        let chain = Arc::new(Self {
            submit_delay,
            estimates: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            next_tx: AtomicU64::new(1),
            events_rx: Mutex::new(Some(rx)),
        });
        (chain, tx)
    }

    pub async fn set_estimate(&self, subject: Address, behavior: EstimateBehavior) {
        self.estimates
            .lock()
            .await
            .insert(addr_key(subject), behavior);
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub async fn submission_count(&self) -> usize {
        self.submissions.lock().await.len()
    }

    async fn submit(
        &self,
        kind: &'static str,
        subject: Address,
        amount: u64,
        curve_index: Option<u8>,
    ) -> Result<TxConfirmation, ChainError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.submit_delay).await;

        let tx_hash = H256::from_low_u64_be(self.next_tx.fetch_add(1, Ordering::SeqCst));
        self.submissions.lock().await.push(Submission {
            kind,
            subject,
            amount,
            curve_index,
            tx_hash,
        });

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(TxConfirmation {
            tx_hash,
            block_number: 1_000,
            gas_used: Some(90_000),
        })
    }
}

#[async_trait]
impl SharesChain for MockChain {
    async fn buy_price_after_fee(
        &self,
        _subject: Address,
        amount: u64,
        _curve_index: u8,
    ) -> Result<U256, ChainError> {
        Ok(U256::from(amount) * U256::exp10(15))
    }

    async fn shares_balance(&self, _subject: Address) -> Result<u64, ChainError> {
        Ok(0)
    }

    async fn estimate_sell(&self, subject: Address, _amount: u64) -> Result<(), ChainError> {
        let behavior = self
            .estimates
            .lock()
            .await
            .get(&addr_key(subject))
            .copied()
            .unwrap_or(EstimateBehavior::Ok);
        match behavior {
            EstimateBehavior::Ok => Ok(()),
            EstimateBehavior::LastShare => Err(ChainError::LastShareUnsellable),
            EstimateBehavior::InsufficientShares => Err(ChainError::InsufficientShares),
            EstimateBehavior::Opaque => {
                Err(ChainError::GasEstimation("provider timeout".to_string()))
            }
        }
    }

    async fn submit_buy(
        &self,
        subject: Address,
        amount: u64,
        curve_index: u8,
    ) -> Result<TxConfirmation, ChainError> {
        self.submit("buy", subject, amount, Some(curve_index)).await
    }

    async fn submit_sell(
        &self,
        subject: Address,
        amount: u64,
        _gas_limit: Option<u64>,
    ) -> Result<TxConfirmation, ChainError> {
        self.submit("sell", subject, amount, None).await
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(1_000)
    }

    async fn subscribe_trades(&self) -> Result<TradeStream, ChainError> {
        let rx = self.events_rx.lock().await.take();
        match rx {
            Some(rx) => {
                let stream = futures::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                });
                Ok(Box::pin(stream))
            }
            None => Ok(Box::pin(futures::stream::pending())),
        }
    }

    fn wallet_address(&self) -> Address {
        WALLET
    }
}

/// Reputation double keyed by lowercase address / handle.
#[derive(Default)]
pub struct MockEvaluator {
    pub handles: Mutex<HashMap<String, Option<String>>>,
    pub profiles: Mutex<HashMap<String, SocialProfile>>,
    pub rooms_unavailable: AtomicBool,
    pub profile_unavailable: AtomicBool,
}

impl MockEvaluator {
    pub async fn set_handle(&self, subject: Address, handle: Option<&str>) {
        self.handles
            .lock()
            .await
            .insert(addr_key(subject), handle.map(str::to_string));
    }

    pub async fn set_profile(&self, handle: &str, followers: u64, verified: bool) {
        self.profiles.lock().await.insert(
            handle.to_string(),
            SocialProfile {
                followers,
                verified,
            },
        );
    }
}

#[async_trait]
impl ReputationEvaluator for MockEvaluator {
    async fn creator_handle(&self, token_address: &str) -> Result<Option<String>, ApiError> {
        if self.rooms_unavailable.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable("rooms down".to_string()));
        }
        Ok(self
            .handles
            .lock()
            .await
            .get(token_address)
            .cloned()
            .flatten())
    }

    async fn profile(&self, handle: &str) -> Result<SocialProfile, ApiError> {
        if self.profile_unavailable.load(Ordering::SeqCst) {
            return Err(ApiError::Unavailable("social down".to_string()));
        }
        self.profiles
            .lock()
            .await
            .get(handle)
            .copied()
            .ok_or_else(|| ApiError::Unavailable(format!("no profile for @{handle}")))
    }
}

pub fn test_config() -> Config {
    Config {
        rpc_ws_url: String::new(),
        wallet_private_key: String::new(),
        chain_id: 8453,
        contract_address: String::new(),
        rooms_api_url: String::new(),
        social_api_url: String::new(),
        social_api_key: None,
        webhook_url: None,
        storage: StorageBackend::File,
        data_dir: String::new(),
        database_path: String::new(),
        buy_amount: 1,
        follower_threshold: 10_000,
        require_verified: false,
        eviction_policy: EvictionPolicy::Ignore,
        max_poll_attempts: 2,
        evict_after_secs: 3_600,
        scan_interval_secs: 2,
        sell_delay_ms: 1,
        sell_gas_fallback: 300_000,
        fee_multiplier_pct: 120,
        max_hold_secs: 0,
        heartbeat_secs: 30,
        stale_after_secs: 120,
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 10,
    }
}

pub async fn temp_file_store() -> Arc<FileStore> {
    let dir = std::env::temp_dir()
        .join("room-sniper-itest")
        .join(uuid::Uuid::new_v4().to_string());
    Arc::new(FileStore::open(dir.to_str().unwrap()).await.unwrap())
}

pub fn trade_event(
    tx: u64,
    log_index: u64,
    trader: Address,
    subject: Address,
    is_buy: bool,
    supply: u64,
    multiplier: u64,
    block: u64,
) -> TradeEvent {
    TradeEvent {
        trader,
        subject,
        is_buy,
        share_amount: U256::one(),
        eth_amount: U256::zero(),
        supply: U256::from(supply),
        multiplier: U256::from(multiplier),
        tx_hash: H256::from_low_u64_be(tx),
        log_index,
        block_number: block,
    }
}
