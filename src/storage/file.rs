//! Flat-file store: candidates, positions and the block checkpoint live as
//! pretty-printed JSON under a data directory, loaded into memory on open
//! and flushed after every mutation.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{Candidate, CandidateStatus, Position, Purchase};
use crate::storage::Store;

const CANDIDATES_FILE: &str = "candidates.json";
const POSITIONS_FILE: &str = "positions.json";
const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct Checkpoint {
    last_block: Option<u64>,
}

pub struct FileStore {
    dir: PathBuf,
    candidates: RwLock<HashMap<String, Candidate>>,
    positions: RwLock<HashMap<String, Position>>,
    checkpoint: RwLock<Checkpoint>,
}

async fn load_json<T: DeserializeOwned>(path: &PathBuf) -> Result<Option<T>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(data) if data.trim().is_empty() => Ok(None),
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn save_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<(), StoreError> {
    let data = serde_json::to_string_pretty(value)?;
    fs::write(path, data).await?;
    Ok(())
}

impl FileStore {
    pub async fn open(dir: &str) -> Result<Self, StoreError> {
        let dir = PathBuf::from(dir);
        fs::create_dir_all(&dir).await?;

        let candidates: Vec<Candidate> = load_json(&dir.join(CANDIDATES_FILE))
            .await?
            .unwrap_or_default();
        let positions: Vec<Position> = load_json(&dir.join(POSITIONS_FILE))
            .await?
            .unwrap_or_default();
        let checkpoint: Checkpoint = load_json(&dir.join(CHECKPOINT_FILE))
            .await?
            .unwrap_or_default();

        info!(
            "File store opened at {:?}: {} candidates, {} positions",
            dir,
            candidates.len(),
            positions.len()
        );

        Ok(Self {
            dir,
            candidates: RwLock::new(
                candidates.into_iter().map(|c| (c.address.clone(), c)).collect(),
            ),
            positions: RwLock::new(
                positions.into_iter().map(|p| (p.address.clone(), p)).collect(),
            ),
            checkpoint: RwLock::new(checkpoint),
        })
    }

    async fn flush_candidates(&self) -> Result<(), StoreError> {
        let snapshot: Vec<Candidate> = {
            let map = self.candidates.read().await;
            let mut rows: Vec<Candidate> = map.values().cloned().collect();
            rows.sort_by_key(|c| c.created_at);
            rows
        };
        save_json(&self.dir.join(CANDIDATES_FILE), &snapshot).await
    }

    async fn flush_positions(&self) -> Result<(), StoreError> {
        let snapshot: Vec<Position> = {
            let map = self.positions.read().await;
            map.values().cloned().collect()
        };
        save_json(&self.dir.join(POSITIONS_FILE), &snapshot).await
    }

    /// Apply a closure to an existing candidate and flush.
    async fn update_candidate<F>(&self, address: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Candidate),
    {
        {
            let mut map = self.candidates.write().await;
            let candidate = map
                .get_mut(address)
                .ok_or_else(|| StoreError::NotFound(address.to_string()))?;
            apply(candidate);
        }
        self.flush_candidates().await
    }
}

#[async_trait]
impl Store for FileStore {
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<bool, StoreError> {
        {
            let mut map = self.candidates.write().await;
            if map.contains_key(&candidate.address) {
                return Ok(false);
            }
            map.insert(candidate.address.clone(), candidate.clone());
        }
        self.flush_candidates().await?;
        Ok(true)
    }

    async fn candidate(&self, address: &str) -> Result<Option<Candidate>, StoreError> {
        Ok(self.candidates.read().await.get(address).cloned())
    }

    async fn candidates_with_status(
        &self,
        statuses: &[CandidateStatus],
    ) -> Result<Vec<Candidate>, StoreError> {
        let map = self.candidates.read().await;
        let mut rows: Vec<Candidate> = map
            .values()
            .filter(|c| statuses.contains(&c.status))
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn candidate_counts(&self) -> Result<Vec<(CandidateStatus, u64)>, StoreError> {
        let map = self.candidates.read().await;
        let mut counts: HashMap<CandidateStatus, u64> = HashMap::new();
        for candidate in map.values() {
            *counts.entry(candidate.status).or_insert(0) += 1;
        }
        let mut rows: Vec<(CandidateStatus, u64)> = counts.into_iter().collect();
        rows.sort_by_key(|(s, _)| s.as_str());
        Ok(rows)
    }

    async fn delete_candidate(&self, address: &str) -> Result<(), StoreError> {
        {
            let mut map = self.candidates.write().await;
            map.remove(address);
        }
        self.flush_candidates().await
    }

    async fn touch_poll(
        &self,
        address: &str,
        attempts: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_candidate(address, |c| {
            c.poll_attempts = attempts;
            c.last_checked = Some(checked_at);
        })
        .await
    }

    async fn record_reputation(
        &self,
        address: &str,
        handle: &str,
        followers: u64,
        verified: bool,
    ) -> Result<(), StoreError> {
        self.update_candidate(address, |c| {
            c.creator_handle = Some(handle.to_string());
            c.follower_count = Some(followers);
            c.is_verified = Some(verified);
        })
        .await
    }

    async fn mark_bought(
        &self,
        address: &str,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_candidate(address, |c| {
            c.status = CandidateStatus::Bought;
            c.bought_tx_hash = Some(tx_hash.to_string());
            c.bought_at = Some(at);
            c.last_error = None;
        })
        .await
    }

    async fn mark_ignored(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update_candidate(address, |c| {
            c.status = CandidateStatus::Ignored;
            c.ignored_at = Some(at);
            c.last_error = Some(reason.to_string());
        })
        .await
    }

    async fn mark_error(&self, address: &str, reason: &str) -> Result<(), StoreError> {
        self.update_candidate(address, |c| {
            c.status = CandidateStatus::Error;
            c.last_error = Some(reason.to_string());
        })
        .await
    }

    async fn position(&self, address: &str) -> Result<Option<Position>, StoreError> {
        Ok(self.positions.read().await.get(address).cloned())
    }

    async fn positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.positions.read().await.values().cloned().collect())
    }

    async fn record_purchase(
        &self,
        address: &str,
        checksum: &str,
        amount: u64,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        {
            let mut map = self.positions.write().await;
            let position = map.entry(address.to_string()).or_insert_with(|| Position {
                address: address.to_string(),
                address_checksum: checksum.to_string(),
                total_amount: 0,
                purchases: Vec::new(),
            });
            position.total_amount += amount;
            position.purchases.push(Purchase {
                amount,
                tx_hash: tx_hash.to_string(),
                timestamp: at,
            });
        }
        self.flush_positions().await
    }

    async fn reduce_position(&self, address: &str, amount: u64) -> Result<u64, StoreError> {
        let remaining = {
            let mut map = self.positions.write().await;
            let position = map
                .get_mut(address)
                .ok_or_else(|| StoreError::NotFound(address.to_string()))?;
            if amount > position.total_amount {
                return Err(StoreError::Conflict(format!(
                    "cannot remove {} shares of {}, holding {}",
                    amount, address, position.total_amount
                )));
            }
            position.total_amount -= amount;
            let remaining = position.total_amount;
            if remaining == 0 {
                map.remove(address);
                debug!("Position {} fully closed, entry removed", address);
            }
            remaining
        };
        self.flush_positions().await?;
        Ok(remaining)
    }

    async fn last_processed_block(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.checkpoint.read().await.last_block)
    }

    async fn save_last_processed_block(&self, block: u64) -> Result<(), StoreError> {
        {
            let mut checkpoint = self.checkpoint.write().await;
            checkpoint.last_block = Some(block);
        }
        let snapshot = Checkpoint {
            last_block: Some(block),
        };
        save_json(&self.dir.join(CHECKPOINT_FILE), &snapshot).await
    }
}
