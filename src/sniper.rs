//! Application wiring. `SniperHooks` reacts to classified trade events
//! (creating candidates, exiting into external buys, dumping on creator
//! sells); `Sniper` owns component lifecycles, the max-hold sweep and the
//! aggregate status surface.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::ReputationEvaluator;
use crate::chain::{SharesChain, TradeEvent};
use crate::config::Config;
use crate::error::TradeError;
use crate::models::{addr_key, Candidate, CandidateStatus, Position};
use crate::notify::Notifier;
use crate::storage::Store;
use crate::trading::{CandidateScanner, EventMonitor, MonitorStatus, TradeExecutor};

/// Event-hook layer. Runs on spawned tasks; every failure is logged here
/// and nothing propagates back into event delivery.
pub struct SniperHooks {
    store: Arc<dyn Store>,
    executor: Arc<TradeExecutor>,
    wallet: Address,
}

impl SniperHooks {
    pub fn new(store: Arc<dyn Store>, executor: Arc<TradeExecutor>, wallet: Address) -> Self {
        Self {
            store,
            executor,
            wallet,
        }
    }

    /// Sell the full position of a held subject, reporting but never
    /// propagating failures.
    async fn exit_position(&self, subject: Address, trigger: &str) {
        let key = addr_key(subject);
        let held = match self.store.position(&key).await {
            Ok(Some(position)) => position.total_amount,
            Ok(None) => return,
            Err(e) => {
                error!("Position lookup failed for {}: {}", key, e);
                return;
            }
        };
        if held == 0 {
            return;
        }

        info!("Selling {} share(s) of {} ({})", held, key, trigger);
        match self.executor.sell(subject, None).await {
            Ok(receipt) if receipt.deferred => {
                info!("Sell of {} deferred ({})", key, trigger)
            }
            Ok(receipt) => info!(
                "Sold position {} ({}), tx {:?}",
                key, trigger, receipt.tx_hash
            ),
            Err(TradeError::NoHolding(reason)) => debug!("Nothing to sell for {}: {}", key, reason),
            Err(e) => warn!("Sell of {} failed ({}): {}", key, trigger, e),
        }
    }
}

#[async_trait]
impl crate::trading::TradeHooks for SniperHooks {
    async fn on_new_token(&self, event: TradeEvent) {
        let candidate = Candidate::new(
            event.subject,
            event.tx_hash,
            event.multiplier.low_u64(),
            Utc::now(),
        );
        match self.store.insert_candidate(&candidate).await {
            Ok(true) => info!(
                "New candidate {} (curve {}, tx {:#x}, block {})",
                candidate.address_checksum, candidate.curve_index, event.tx_hash, event.block_number
            ),
            Ok(false) => debug!("Candidate {} already tracked", candidate.address),
            Err(e) => error!("Failed to store candidate {}: {}", candidate.address, e),
        }
    }

    async fn on_external_buy(&self, event: TradeEvent) {
        // Our own buys come back through the event stream too.
        if event.trader == self.wallet {
            return;
        }

        let key = addr_key(event.subject);
        match self.store.position(&key).await {
            Ok(Some(position)) if position.total_amount > 0 => {
                // Supply grew, so a previously unsellable last share may be
                // sellable again. Clear the mark before attempting.
                self.executor.clear_deferred(&key).await;
                self.exit_position(event.subject, "external buy").await;
            }
            Ok(_) => {}
            Err(e) => error!("Position lookup failed for {}: {}", key, e),
        }
    }

    async fn on_creator_sell(&self, event: TradeEvent) {
        self.exit_position(event.subject, "creator sell").await;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub candidates: Vec<(CandidateStatus, u64)>,
    pub holdings: Vec<Position>,
    pub executor_busy: bool,
    pub monitor: MonitorStatus,
}

pub struct Sniper {
    store: Arc<dyn Store>,
    executor: Arc<TradeExecutor>,
    scanner: Arc<CandidateScanner>,
    monitor: Arc<EventMonitor>,
    config: Arc<Config>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl Sniper {
    pub fn new(
        chain: Arc<dyn SharesChain>,
        store: Arc<dyn Store>,
        evaluator: Arc<dyn ReputationEvaluator>,
        notifier: Option<Arc<Notifier>>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let executor = Arc::new(TradeExecutor::new(chain.clone(), store.clone(), &config));
        let hooks = Arc::new(SniperHooks::new(
            store.clone(),
            executor.clone(),
            chain.wallet_address(),
        ));
        let monitor = Arc::new(EventMonitor::new(
            chain.clone(),
            store.clone(),
            hooks,
            &config,
        ));
        let scanner = Arc::new(CandidateScanner::new(
            store.clone(),
            evaluator,
            executor.clone(),
            notifier,
            config.clone(),
        ));

        Arc::new(Self {
            store,
            executor,
            scanner,
            monitor,
            config,
            sweep_task: Mutex::new(None),
        })
    }

    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        self.monitor.init().await?;
        self.monitor.clone().start_monitoring().await;
        self.scanner.clone().start().await;

        if self.config.max_hold_secs > 0 {
            let sniper = self.clone();
            let handle = tokio::spawn(async move { sniper.run_hold_sweep().await });
            *self.sweep_task.lock().await = Some(handle);
        }

        info!("Sniper started");
        Ok(())
    }

    /// Periodic timeout sweep: positions held past the configured limit are
    /// sold through the normal sell path.
    async fn run_hold_sweep(&self) {
        let max_hold = chrono::Duration::seconds(self.config.max_hold_secs as i64);
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.max_hold_secs.clamp(10, 300),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let positions = match self.store.positions().await {
                Ok(positions) => positions,
                Err(e) => {
                    warn!("Hold sweep could not list positions: {}", e);
                    continue;
                }
            };

            let now = Utc::now();
            for position in positions {
                let expired = position
                    .opened_at()
                    .map(|opened| now - opened >= max_hold)
                    .unwrap_or(false);
                if !expired {
                    continue;
                }

                let subject = match Address::from_str(&position.address) {
                    Ok(address) => address,
                    Err(e) => {
                        warn!("Bad position key {}: {}", position.address, e);
                        continue;
                    }
                };
                info!(
                    "Position {} exceeded max hold, selling",
                    position.address_checksum
                );
                if let Err(e) = self.executor.sell(subject, None).await {
                    warn!("Hold-sweep sell failed for {}: {}", position.address, e);
                }
            }
        }
    }

    pub async fn status(&self) -> anyhow::Result<StatusReport> {
        Ok(StatusReport {
            candidates: self.store.candidate_counts().await?,
            holdings: self.store.positions().await?,
            executor_busy: self.executor.is_busy(),
            monitor: self.monitor.status().await,
        })
    }

    pub fn executor(&self) -> Arc<TradeExecutor> {
        self.executor.clone()
    }

    /// Graceful shutdown: stop producing work, then drain the executor so
    /// any already-submitted transaction is awaited to its conclusion.
    pub async fn shutdown(&self) {
        info!("Sniper shutting down");
        if let Some(handle) = self.sweep_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.scanner.stop().await;
        self.monitor.stop_monitoring().await;
        self.executor.shutdown().await;
        info!("Sniper shutdown complete");
    }
}
