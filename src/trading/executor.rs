//! Trade execution core. Everything that submits a transaction goes through
//! here: buys take the gate or fail fast, sells queue onto a single worker
//! that drains FIFO, so the wallet never has two transactions in flight.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::Address;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chain::{SharesChain, TxConfirmation};
use crate::config::Config;
use crate::error::{ChainError, TradeError};
use crate::models::{addr_checksum, addr_key};
use crate::storage::Store;
use crate::trading::gate::TradeGate;

/// Structured outcome of a buy or sell. A deferred receipt is the soft
/// success for an unsellable last share: no transaction was submitted and
/// the token is marked so later attempts short-circuit.
#[derive(Debug, Clone)]
pub struct TradeReceipt {
    pub tx_hash: Option<String>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub deferred: bool,
}

impl TradeReceipt {
    fn confirmed(confirmation: TxConfirmation) -> Self {
        Self {
            tx_hash: Some(format!("{:#x}", confirmation.tx_hash)),
            block_number: Some(confirmation.block_number),
            gas_used: confirmation.gas_used,
            deferred: false,
        }
    }

    fn deferred_sell() -> Self {
        Self {
            tx_hash: None,
            block_number: None,
            gas_used: None,
            deferred: true,
        }
    }
}

struct SellJob {
    id: Uuid,
    subject: Address,
    /// None sells whatever is held at execution time.
    amount: Option<u64>,
    respond: oneshot::Sender<Result<TradeReceipt, TradeError>>,
}

pub struct TradeExecutor {
    chain: Arc<dyn SharesChain>,
    store: Arc<dyn Store>,
    gate: Arc<TradeGate>,
    deferred: Arc<Mutex<HashSet<String>>>,
    sell_tx: Mutex<Option<mpsc::UnboundedSender<SellJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sell_delay: Duration,
}

impl TradeExecutor {
    pub fn new(chain: Arc<dyn SharesChain>, store: Arc<dyn Store>, config: &Config) -> Self {
        let gate = Arc::new(TradeGate::new());
        let deferred = Arc::new(Mutex::new(HashSet::new()));
        let (sell_tx, sell_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_sell_worker(
            sell_rx,
            chain.clone(),
            store.clone(),
            gate.clone(),
            deferred.clone(),
            Duration::from_millis(config.sell_delay_ms),
            config.sell_gas_fallback,
        ));

        Self {
            chain,
            store,
            gate,
            deferred,
            sell_tx: Mutex::new(Some(sell_tx)),
            worker: Mutex::new(Some(worker)),
            sell_delay: Duration::from_millis(config.sell_delay_ms),
        }
    }

    /// Buy shares. Fails immediately with `Busy` when another trade holds
    /// the gate; buys are never queued, retrying is the caller's decision
    /// on its next pass. The ledger is credited only after confirmation.
    pub async fn buy(
        &self,
        subject: Address,
        amount: u64,
        curve_index: u8,
    ) -> Result<TradeReceipt, TradeError> {
        let _guard = self.gate.try_acquire().ok_or(TradeError::Busy)?;

        info!(
            "Buying {} share(s) of {} on curve {}",
            amount,
            addr_checksum(subject),
            curve_index
        );
        let confirmation = self.chain.submit_buy(subject, amount, curve_index).await?;

        self.store
            .record_purchase(
                &addr_key(subject),
                &addr_checksum(subject),
                amount,
                &format!("{:#x}", confirmation.tx_hash),
                Utc::now(),
            )
            .await?;

        info!(
            "Buy confirmed for {} in block {} (tx {:#x})",
            addr_checksum(subject),
            confirmation.block_number,
            confirmation.tx_hash
        );
        Ok(TradeReceipt::confirmed(confirmation))
    }

    /// Queue a sell and wait for its outcome. `amount: None` sells the full
    /// holding as resolved when the job executes, not when it is enqueued.
    pub async fn sell(
        &self,
        subject: Address,
        amount: Option<u64>,
    ) -> Result<TradeReceipt, TradeError> {
        let (respond, result) = oneshot::channel();
        let job = SellJob {
            id: Uuid::new_v4(),
            subject,
            amount,
            respond,
        };

        {
            let sender = self.sell_tx.lock().await;
            let sender = sender.as_ref().ok_or(TradeError::Shutdown)?;
            sender.send(job).map_err(|_| TradeError::Shutdown)?;
        }

        result.await.map_err(|_| TradeError::Shutdown)?
    }

    /// Sell every held position, one token at a time, pausing after each
    /// successful submission so same-wallet transactions never go out
    /// back-to-back. Returns per-token outcomes.
    pub async fn sell_all(&self) -> Result<Vec<(String, Result<TradeReceipt, TradeError>)>, TradeError> {
        let positions = self.store.positions().await.map_err(TradeError::Store)?;
        let mut results = Vec::with_capacity(positions.len());

        for position in positions {
            let subject = match Address::from_str(&position.address) {
                Ok(address) => address,
                Err(e) => {
                    warn!("Skipping unparseable position key {}: {}", position.address, e);
                    continue;
                }
            };

            let outcome = self.sell(subject, None).await;
            let pause = matches!(&outcome, Ok(receipt) if !receipt.deferred);
            results.push((position.address, outcome));
            if pause {
                tokio::time::sleep(self.sell_delay).await;
            }
        }

        Ok(results)
    }

    /// Clear the deferred-sell mark, typically because an external buy grew
    /// the supply past the last-share constraint.
    pub async fn clear_deferred(&self, address: &str) -> bool {
        let cleared = self.deferred.lock().await.remove(address);
        if cleared {
            info!("Deferred-sell mark cleared for {}", address);
        }
        cleared
    }

    pub async fn is_deferred(&self, address: &str) -> bool {
        self.deferred.lock().await.contains(address)
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Close the queue, let the worker drain any queued jobs, and wait for
    /// it, so an already-submitted transaction is always awaited to its
    /// confirmation before shutdown completes.
    pub async fn shutdown(&self) {
        self.sell_tx.lock().await.take();
        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Sell worker join failed: {}", e);
            }
        }
    }
}

async fn run_sell_worker(
    mut jobs: mpsc::UnboundedReceiver<SellJob>,
    chain: Arc<dyn SharesChain>,
    store: Arc<dyn Store>,
    gate: Arc<TradeGate>,
    deferred: Arc<Mutex<HashSet<String>>>,
    sell_delay: Duration,
    sell_gas_fallback: u64,
) {
    info!("Sell worker started");
    while let Some(job) = jobs.recv().await {
        let job_id = job.id;
        let subject = job.subject;
        let result = process_sell(
            &job,
            chain.as_ref(),
            store.as_ref(),
            &gate,
            &deferred,
            sell_gas_fallback,
        )
        .await;

        match &result {
            Ok(receipt) if receipt.deferred => {
                info!("Sell job {} deferred for {:#x}", job_id, subject)
            }
            Ok(receipt) => info!(
                "Sell job {} confirmed for {:#x} (tx {:?})",
                job_id, subject, receipt.tx_hash
            ),
            Err(e) => warn!("Sell job {} failed for {:#x}: {}", job_id, subject, e),
        }

        let _ = job.respond.send(result);

        // Keep same-wallet submissions spaced apart.
        tokio::time::sleep(sell_delay).await;
    }
    info!("Sell queue drained, worker stopped");
}

async fn process_sell(
    job: &SellJob,
    chain: &dyn SharesChain,
    store: &dyn Store,
    gate: &TradeGate,
    deferred: &Mutex<HashSet<String>>,
    sell_gas_fallback: u64,
) -> Result<TradeReceipt, TradeError> {
    let key = addr_key(job.subject);

    // Resolve the amount at execution time against the ledger, and reject
    // anything that would take the position negative before touching the
    // chain.
    let held = store
        .position(&key)
        .await?
        .map(|p| p.total_amount)
        .unwrap_or(0);
    let amount = job.amount.unwrap_or(held);

    if held == 0 || amount == 0 {
        return Err(TradeError::NoHolding(format!("no shares of {key} held")));
    }
    if amount > held {
        return Err(TradeError::NoHolding(format!(
            "requested {amount} but holding {held} of {key}"
        )));
    }

    if deferred.lock().await.contains(&key) {
        debug!("{} is deferred, skipping futile sell attempt", key);
        return Ok(TradeReceipt::deferred_sell());
    }

    // Waits for any in-flight buy (or earlier sell) to finish.
    let _guard = gate.acquire().await;

    let gas_limit = match chain.estimate_sell(job.subject, amount).await {
        Ok(()) => None,
        Err(ChainError::LastShareUnsellable) => {
            deferred.lock().await.insert(key.clone());
            info!(
                "Cannot sell the last share of {}, deferred until supply grows",
                key
            );
            return Ok(TradeReceipt::deferred_sell());
        }
        Err(ChainError::InsufficientShares) => {
            return Err(TradeError::Chain(ChainError::InsufficientShares));
        }
        Err(e) => {
            warn!(
                "Sell gas estimation failed for {} ({}), using fallback limit {}",
                key, e, sell_gas_fallback
            );
            Some(sell_gas_fallback)
        }
    };

    let confirmation = chain.submit_sell(job.subject, amount, gas_limit).await?;
    let remaining = store.reduce_position(&key, amount).await?;
    info!(
        "Sold {} share(s) of {}, {} remaining (tx {:#x})",
        amount, key, remaining, confirmation.tx_hash
    );

    Ok(TradeReceipt::confirmed(confirmation))
}
