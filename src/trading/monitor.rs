//! On-chain trade event monitor. Subscribes to the contract's Trade stream,
//! deduplicates, classifies and fans events out to the hook layer without
//! ever blocking delivery. Keeps itself alive with a heartbeat probe and
//! bounded, jittered reconnects.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::chain::{SharesChain, TradeEvent};
use crate::config::Config;
use crate::error::ChainError;
use crate::storage::Store;

/// Downstream reactions to classified trade events. Implementations are
/// invoked on spawned tasks (fire-and-continue): they must catch and log
/// their own failures, and they may run concurrently with an in-flight
/// trade. The executor's gate, not event ordering, provides exclusion.
#[async_trait]
pub trait TradeHooks: Send + Sync {
    /// A buy that took the subject's supply to one: token creation.
    async fn on_new_token(&self, event: TradeEvent);

    /// Any buy, creation included. Downstream decides relevance.
    async fn on_external_buy(&self, event: TradeEvent);

    /// The subject selling shares of their own room.
    async fn on_creator_sell(&self, event: TradeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Monitoring,
    Reconnecting,
    /// Reconnect budget exhausted; monitoring will not resume on its own.
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub events_processed: u64,
    pub duplicates_dropped: u64,
    pub reconnect_attempts: u32,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub events_processed: u64,
    pub duplicates_dropped: u64,
    pub reconnect_attempts: u32,
    pub last_block: u64,
}

/// Bounded (tx-hash, log-index) ring for duplicate suppression.
struct SeenCache {
    cap: usize,
    set: HashSet<(H256, u64)>,
    order: VecDeque<(H256, u64)>,
}

impl SeenCache {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            set: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
        }
    }

    /// Returns false if the key was already present.
    fn insert(&mut self, key: (H256, u64)) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

fn backoff_with_jitter(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempts.saturating_sub(1).min(6);
    let delay = base.saturating_mul(2u32.saturating_pow(exp)).min(max);
    let jitter_ms = (delay.as_millis() as f64 * 0.2 * rand::thread_rng().gen::<f64>()) as u64;
    delay + Duration::from_millis(jitter_ms)
}

const SEEN_CACHE_CAP: usize = 8192;
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

pub struct EventMonitor {
    chain: Arc<dyn SharesChain>,
    store: Arc<dyn Store>,
    hooks: Arc<dyn TradeHooks>,
    heartbeat: Duration,
    stale_after: Duration,
    max_reconnect_attempts: u32,
    reconnect_base_delay: Duration,
    state: Arc<RwLock<MonitorState>>,
    stats: Arc<RwLock<MonitorStats>>,
    seen: Arc<Mutex<SeenCache>>,
    last_block: Arc<AtomicU64>,
    shutdown_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventMonitor {
    pub fn new(
        chain: Arc<dyn SharesChain>,
        store: Arc<dyn Store>,
        hooks: Arc<dyn TradeHooks>,
        config: &Config,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            chain,
            store,
            hooks,
            heartbeat: Duration::from_secs(config.heartbeat_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_base_delay: Duration::from_millis(config.reconnect_base_delay_ms),
            state: Arc::new(RwLock::new(MonitorState::Stopped)),
            stats: Arc::new(RwLock::new(MonitorStats::default())),
            seen: Arc::new(Mutex::new(SeenCache::new(SEEN_CACHE_CAP))),
            last_block: Arc::new(AtomicU64::new(0)),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Load the checkpoint, or fall back to the current chain head when no
    /// checkpoint exists. A checkpoint load failure is degraded to the
    /// head, never fatal.
    pub async fn init(&self) -> Result<(), ChainError> {
        let checkpoint = match self.store.last_processed_block().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!("Failed to load block checkpoint: {}", e);
                None
            }
        };

        let start = match checkpoint {
            Some(block) => block,
            None => self.chain.block_number().await?,
        };
        self.last_block.store(start, Ordering::Release);
        info!("Event monitor initialized at block {}", start);
        Ok(())
    }

    pub async fn start_monitoring(self: Arc<Self>) {
        {
            let mut state = self.state.write().await;
            if *state == MonitorState::Monitoring || *state == MonitorState::Reconnecting {
                warn!("Monitor start requested but already running");
                return;
            }
            *state = MonitorState::Monitoring;
        }

        info!("Starting trade event monitor");
        let monitor = self.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(monitor.run(shutdown_rx));
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop_monitoring(&self) {
        info!("Stopping trade event monitor");
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Monitor task join failed: {}", e);
            }
        }
    }

    pub async fn status(&self) -> MonitorStatus {
        let state = *self.state.read().await;
        let stats = self.stats.read().await.clone();
        MonitorStatus {
            state,
            events_processed: stats.events_processed,
            duplicates_dropped: stats.duplicates_dropped,
            reconnect_attempts: stats.reconnect_attempts,
            last_block: self.last_block.load(Ordering::Acquire),
        }
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut attempts: u32 = 0;

        loop {
            match self.run_subscription(&mut shutdown_rx, &mut attempts).await {
                Ok(()) => {
                    *self.state.write().await = MonitorState::Stopped;
                    break;
                }
                Err(e) => {
                    attempts += 1;
                    self.stats.write().await.reconnect_attempts = attempts;

                    if attempts >= self.max_reconnect_attempts {
                        error!(
                            "Reconnect budget exhausted after {} attempts ({}), monitor halting",
                            attempts, e
                        );
                        *self.state.write().await = MonitorState::Failed;
                        break;
                    }

                    *self.state.write().await = MonitorState::Reconnecting;
                    let delay = backoff_with_jitter(
                        attempts,
                        self.reconnect_base_delay,
                        MAX_RECONNECT_DELAY,
                    );
                    warn!(
                        "Subscription lost ({}), reconnecting in {:?} (attempt {}/{})",
                        e, delay, attempts, self.max_reconnect_attempts
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.recv() => {
                            *self.state.write().await = MonitorState::Stopped;
                            break;
                        }
                    }
                }
            }
        }
        info!("Event monitor loop ended");
    }

    /// One subscription lifetime: establish, then pump events until the
    /// stream drops, the probe fails, or shutdown is requested. Returning
    /// Ok means a clean stop; any Err sends the caller into reconnect.
    async fn run_subscription(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        attempts: &mut u32,
    ) -> Result<(), ChainError> {
        let mut stream = self.chain.subscribe_trades().await?;
        *self.state.write().await = MonitorState::Monitoring;
        if *attempts > 0 {
            info!("Resubscribed to trade events after {} attempt(s)", attempts);
        }
        // A live subscription resets the retry budget.
        *attempts = 0;
        {
            let mut stats = self.stats.write().await;
            stats.reconnect_attempts = 0;
            // Staleness is measured from subscription start until the
            // first event arrives.
            stats.last_event_at = Some(Utc::now());
        }
        info!("Subscribed to trade events");

        let mut heartbeat = interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Monitor received shutdown signal");
                    return Ok(());
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => self.process_event(event).await,
                    Some(Err(e)) => return Err(e),
                    None => return Err(ChainError::Rpc("trade stream closed".to_string())),
                },
                _ = heartbeat.tick() => self.heartbeat_probe().await?,
            }
        }
    }

    async fn heartbeat_probe(&self) -> Result<(), ChainError> {
        let stats = self.stats.read().await.clone();
        info!(
            "Monitor heartbeat: {} events, {} duplicates, last block {}",
            stats.events_processed,
            stats.duplicates_dropped,
            self.last_block.load(Ordering::Acquire)
        );

        let stale = stats
            .last_event_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64 >= self.stale_after.as_secs())
            .unwrap_or(false);

        if stale {
            warn!(
                "No trade events for {}s, probing connection",
                self.stale_after.as_secs()
            );
            let block = self.chain.block_number().await?;
            debug!("Connection probe OK at block {}", block);
        }
        Ok(())
    }

    async fn process_event(&self, event: TradeEvent) {
        if !self
            .seen
            .lock()
            .await
            .insert((event.tx_hash, event.log_index))
        {
            self.stats.write().await.duplicates_dropped += 1;
            debug!(
                "Dropped duplicate event {:#x}:{}",
                event.tx_hash, event.log_index
            );
            return;
        }

        {
            let mut stats = self.stats.write().await;
            stats.events_processed += 1;
            stats.last_event_at = Some(Utc::now());
        }

        if event.is_new_token() {
            debug!(
                "New token {:#x} (multiplier {}) in tx {:#x}",
                event.subject, event.multiplier, event.tx_hash
            );
            let hooks = self.hooks.clone();
            let ev = event.clone();
            tokio::spawn(async move { hooks.on_new_token(ev).await });
        }

        if event.is_buy {
            let hooks = self.hooks.clone();
            let ev = event.clone();
            tokio::spawn(async move { hooks.on_external_buy(ev).await });
        } else if event.is_creator_sell() {
            let hooks = self.hooks.clone();
            let ev = event.clone();
            tokio::spawn(async move { hooks.on_creator_sell(ev).await });
        }

        // Advance the checkpoint monotonically; persistence is best-effort
        // and never takes the monitor down.
        let previous = self.last_block.load(Ordering::Acquire);
        if event.block_number > previous {
            self.last_block.store(event.block_number, Ordering::Release);
            if let Err(e) = self.store.save_last_processed_block(event.block_number).await {
                warn!(
                    "Failed to persist checkpoint block {}: {}",
                    event.block_number, e
                );
            }
        }
    }
}
