//! Candidate scanner. Polls unresolved candidates on a fixed interval,
//! drives them through the reputation lookups, applies the admission policy
//! and hands admitted tokens to the executor. One candidate's failure never
//! aborts the pass.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::Address;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::ReputationEvaluator;
use crate::config::{Config, EvictionPolicy, MIN_SCAN_INTERVAL_SECS};
use crate::error::StoreError;
use crate::models::{Candidate, CandidateStatus};
use crate::notify::Notifier;
use crate::storage::Store;
use crate::trading::executor::TradeExecutor;

/// OR policy: enough followers or a verified creator admits. The
/// `require_verified` switch turns this into AND.
fn admitted(followers: u64, verified: bool, threshold: u64, require_verified: bool) -> bool {
    if require_verified {
        followers > threshold && verified
    } else {
        followers > threshold || verified
    }
}

pub struct CandidateScanner {
    store: Arc<dyn Store>,
    evaluator: Arc<dyn ReputationEvaluator>,
    executor: Arc<TradeExecutor>,
    notifier: Option<Arc<Notifier>>,
    config: Arc<Config>,
    running: Arc<RwLock<bool>>,
    stop_signal: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CandidateScanner {
    pub fn new(
        store: Arc<dyn Store>,
        evaluator: Arc<dyn ReputationEvaluator>,
        executor: Arc<TradeExecutor>,
        notifier: Option<Arc<Notifier>>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            evaluator,
            executor,
            notifier,
            config,
            running: Arc::new(RwLock::new(false)),
            stop_signal: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Scanner start requested but already running");
                return;
            }
            *running = true;
        }

        let secs = self.config.scan_interval_secs.max(MIN_SCAN_INTERVAL_SECS);
        info!("Candidate scanner started, interval {}s", secs);

        let scanner = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                // Only the idle wait is interruptible; an in-flight pass
                // always completes before shutdown.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = scanner.stop_signal.notified() => break,
                }
                if !*scanner.running.read().await {
                    break;
                }
                if let Err(e) = scanner.scan_once().await {
                    error!("Scan pass failed: {}", e);
                }
            }
            info!("Candidate scanner stopped");
        });

        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        self.stop_signal.notify_waiters();
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Scanner task join failed: {}", e);
            }
        }
    }

    /// One pass over every pending or errored candidate, oldest first.
    /// Callable on its own, which is how the tests drive it.
    pub async fn scan_once(&self) -> Result<(), StoreError> {
        let candidates = self
            .store
            .candidates_with_status(&[CandidateStatus::Pending, CandidateStatus::Error])
            .await?;

        if candidates.is_empty() {
            debug!("No unresolved candidates");
            return Ok(());
        }

        debug!("Evaluating {} candidate(s)", candidates.len());
        for candidate in candidates {
            let address = candidate.address.clone();
            if let Err(e) = self.evaluate(candidate).await {
                warn!("Candidate {} evaluation failed: {}", address, e);
            }
        }
        Ok(())
    }

    async fn evaluate(&self, candidate: Candidate) -> Result<(), StoreError> {
        let now = Utc::now();

        // Step 1: room metadata. Missing room, missing handle and API
        // outage all count as one more unsuccessful poll.
        let handle = match self.evaluator.creator_handle(&candidate.address).await {
            Ok(Some(handle)) => handle,
            Ok(None) => return self.note_unresolved(&candidate, "room has no creator handle").await,
            Err(e) => return self.note_unresolved(&candidate, &e.to_string()).await,
        };

        // Step 2: social profile. Failures are retryable errors, picked up
        // again on the next pass.
        let profile = match self.evaluator.profile(&handle).await {
            Ok(profile) => profile,
            Err(e) => {
                self.store
                    .mark_error(
                        &candidate.address,
                        &format!("profile lookup failed for @{handle}: {e}"),
                    )
                    .await?;
                return Ok(());
            }
        };

        // Step 3: persist the signals regardless of what the policy says.
        self.store
            .record_reputation(&candidate.address, &handle, profile.followers, profile.verified)
            .await?;

        // Step 4: admission policy.
        if admitted(
            profile.followers,
            profile.verified,
            self.config.follower_threshold,
            self.config.require_verified,
        ) {
            info!(
                "Admitting {} (@{}): {} followers, verified={}",
                candidate.address_checksum, handle, profile.followers, profile.verified
            );

            if let Some(notifier) = &self.notifier {
                let mut enriched = candidate.clone();
                enriched.creator_handle = Some(handle.clone());
                notifier.notify_admission(&enriched, profile.followers, profile.verified);
            }

            let subject = match Address::from_str(&candidate.address) {
                Ok(address) => address,
                Err(e) => {
                    self.store
                        .mark_error(&candidate.address, &format!("bad address key: {e}"))
                        .await?;
                    return Ok(());
                }
            };

            match self
                .executor
                .buy(subject, self.config.buy_amount, candidate.curve_index)
                .await
            {
                Ok(receipt) => {
                    let tx_hash = receipt.tx_hash.unwrap_or_default();
                    self.store
                        .mark_bought(&candidate.address, &tx_hash, now)
                        .await?;
                    info!("Candidate {} bought ({})", candidate.address_checksum, tx_hash);
                }
                Err(e) => {
                    // Stays in error state; the next pass retries the buy.
                    self.store
                        .mark_error(&candidate.address, &format!("buy failed: {e}"))
                        .await?;
                    warn!("Buy failed for {}: {}", candidate.address_checksum, e);
                }
            }
        } else {
            let reason = format!(
                "followers {} vs threshold {}, verified={} (require_verified={})",
                profile.followers,
                self.config.follower_threshold,
                profile.verified,
                self.config.require_verified
            );
            self.store
                .mark_ignored(&candidate.address, &reason, now)
                .await?;
            info!("Ignoring {}: {}", candidate.address_checksum, reason);
        }

        Ok(())
    }

    /// Bump the poll counter and evict once the candidate has aged or been
    /// polled past the configured thresholds.
    async fn note_unresolved(&self, candidate: &Candidate, why: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        let attempts = candidate.poll_attempts + 1;
        self.store
            .touch_poll(&candidate.address, attempts, now)
            .await?;
        debug!(
            "Candidate {} unresolved ({}), attempt {}",
            candidate.address, why, attempts
        );

        let age_secs = (now - candidate.created_at).num_seconds().max(0) as u64;
        if attempts >= self.config.max_poll_attempts || age_secs >= self.config.evict_after_secs {
            match self.config.eviction_policy {
                EvictionPolicy::Delete => {
                    self.store.delete_candidate(&candidate.address).await?;
                    info!(
                        "Evicted candidate {} after {} attempts / {}s: {}",
                        candidate.address_checksum, attempts, age_secs, why
                    );
                }
                EvictionPolicy::Ignore => {
                    self.store
                        .mark_ignored(
                            &candidate.address,
                            &format!("evicted after {attempts} attempts: {why}"),
                            now,
                        )
                        .await?;
                    info!(
                        "Marked candidate {} ignored after {} attempts / {}s: {}",
                        candidate.address_checksum, attempts, age_secs, why
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn or_policy_admits_on_either_signal() {
        assert!(admitted(15_000, false, 10_000, false));
        assert!(admitted(3, true, 10_000, false));
        assert!(!admitted(3, false, 10_000, false));
        // Threshold is strict: exactly at the threshold is not enough.
        assert!(!admitted(10_000, false, 10_000, false));
    }

    #[test]
    fn and_policy_requires_both_signals() {
        assert!(!admitted(15_000, false, 10_000, true));
        assert!(!admitted(3, true, 10_000, true));
        assert!(admitted(15_000, true, 10_000, true));
    }
}
