//! Persistence boundary. One trait covers the candidate store, the position
//! ledger and the block checkpoint; the file-backed and SQLite
//! implementations are interchangeable behind it.

pub mod file;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{Candidate, CandidateStatus, Position};

pub use file::FileStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    // --- Candidates ---

    /// Insert if absent. Returns false when the address is already tracked,
    /// which keeps event processing idempotent.
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<bool, StoreError>;

    async fn candidate(&self, address: &str) -> Result<Option<Candidate>, StoreError>;

    /// Candidates in any of the given states, oldest first.
    async fn candidates_with_status(
        &self,
        statuses: &[CandidateStatus],
    ) -> Result<Vec<Candidate>, StoreError>;

    async fn candidate_counts(&self) -> Result<Vec<(CandidateStatus, u64)>, StoreError>;

    async fn delete_candidate(&self, address: &str) -> Result<(), StoreError>;

    // Partial-field updates. Each touches only the named columns so the
    // relational backend does not rewrite whole rows.

    async fn touch_poll(
        &self,
        address: &str,
        attempts: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_reputation(
        &self,
        address: &str,
        handle: &str,
        followers: u64,
        verified: bool,
    ) -> Result<(), StoreError>;

    async fn mark_bought(
        &self,
        address: &str,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_ignored(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_error(&self, address: &str, reason: &str) -> Result<(), StoreError>;

    // --- Positions ---

    async fn position(&self, address: &str) -> Result<Option<Position>, StoreError>;

    async fn positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Credit a confirmed buy, creating the position on first purchase.
    async fn record_purchase(
        &self,
        address: &str,
        checksum: &str,
        amount: u64,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Debit a confirmed sell and return the remaining amount. The entry is
    /// removed when the total reaches zero; debiting more than is held is a
    /// conflict, never a negative balance.
    async fn reduce_position(&self, address: &str, amount: u64) -> Result<u64, StoreError>;

    // --- Checkpoint ---

    async fn last_processed_block(&self) -> Result<Option<u64>, StoreError>;

    async fn save_last_processed_block(&self, block: u64) -> Result<(), StoreError>;
}
