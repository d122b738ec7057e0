//! SQLite-backed store. Schema is created on connect; partial-field updates
//! are targeted UPDATE statements rather than whole-row rewrites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, Pool, Sqlite};
use tracing::info;

use crate::error::StoreError;
use crate::models::{Candidate, CandidateStatus, Position, Purchase};
use crate::storage::Store;

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

#[derive(FromRow)]
struct CandidateRow {
    address: String,
    address_checksum: String,
    curve_index: i64,
    multiplier: i64,
    tx_hash: String,
    created_at: i64,
    last_checked: Option<i64>,
    status: String,
    creator_handle: Option<String>,
    follower_count: Option<i64>,
    is_verified: Option<bool>,
    bought_tx_hash: Option<String>,
    bought_at: Option<i64>,
    ignored_at: Option<i64>,
    last_error: Option<String>,
    poll_attempts: i64,
}

#[derive(FromRow)]
struct PositionRow {
    address: String,
    address_checksum: String,
    total_amount: i64,
}

#[derive(FromRow)]
struct PurchaseRow {
    amount: i64,
    tx_hash: String,
    timestamp: i64,
}

fn from_ts(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Database(format!("timestamp {secs} out of range")))
}

impl CandidateRow {
    fn into_candidate(self) -> Result<Candidate, StoreError> {
        let status = CandidateStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Database(format!("unknown status {:?}", self.status)))?;
        Ok(Candidate {
            address: self.address,
            address_checksum: self.address_checksum,
            curve_index: self.curve_index as u8,
            multiplier: self.multiplier as u64,
            tx_hash: self.tx_hash,
            created_at: from_ts(self.created_at)?,
            last_checked: self.last_checked.map(from_ts).transpose()?,
            status,
            creator_handle: self.creator_handle,
            follower_count: self.follower_count.map(|v| v as u64),
            is_verified: self.is_verified,
            bought_tx_hash: self.bought_tx_hash,
            bought_at: self.bought_at.map(from_ts).transpose()?,
            ignored_at: self.ignored_at.map(from_ts).transpose()?,
            last_error: self.last_error,
            poll_attempts: self.poll_attempts as u32,
        })
    }
}

impl SqliteStore {
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&format!("sqlite:{path}?mode=rwc"))
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("SQLite store connected at {}", path);
        Ok(store)
    }

    /// In-memory database, single connection so every query sees the same
    /// schema. Used by tests.
    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                address TEXT PRIMARY KEY,
                address_checksum TEXT NOT NULL,
                curve_index INTEGER NOT NULL,
                multiplier INTEGER NOT NULL,
                tx_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_checked INTEGER,
                status TEXT NOT NULL,
                creator_handle TEXT,
                follower_count INTEGER,
                is_verified INTEGER,
                bought_tx_hash TEXT,
                bought_at INTEGER,
                ignored_at INTEGER,
                last_error TEXT,
                poll_attempts INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                address TEXT PRIMARY KEY,
                address_checksum TEXT NOT NULL,
                total_amount INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                tx_hash TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                block INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_candidate(&self, candidate: &Candidate) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO candidates (
                address, address_checksum, curve_index, multiplier, tx_hash,
                created_at, last_checked, status, creator_handle, follower_count,
                is_verified, bought_tx_hash, bought_at, ignored_at, last_error,
                poll_attempts
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candidate.address)
        .bind(&candidate.address_checksum)
        .bind(candidate.curve_index as i64)
        .bind(candidate.multiplier as i64)
        .bind(&candidate.tx_hash)
        .bind(candidate.created_at.timestamp())
        .bind(candidate.last_checked.map(|t| t.timestamp()))
        .bind(candidate.status.as_str())
        .bind(&candidate.creator_handle)
        .bind(candidate.follower_count.map(|v| v as i64))
        .bind(candidate.is_verified)
        .bind(&candidate.bought_tx_hash)
        .bind(candidate.bought_at.map(|t| t.timestamp()))
        .bind(candidate.ignored_at.map(|t| t.timestamp()))
        .bind(&candidate.last_error)
        .bind(candidate.poll_attempts as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn candidate(&self, address: &str) -> Result<Option<Candidate>, StoreError> {
        let row = sqlx::query_as::<_, CandidateRow>(
            "SELECT * FROM candidates WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CandidateRow::into_candidate).transpose()
    }

    async fn candidates_with_status(
        &self,
        statuses: &[CandidateStatus],
    ) -> Result<Vec<Candidate>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM candidates WHERE status IN ({placeholders}) ORDER BY created_at ASC"
        );
        let mut query = sqlx::query_as::<_, CandidateRow>(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(CandidateRow::into_candidate).collect()
    }

    async fn candidate_counts(&self) -> Result<Vec<(CandidateStatus, u64)>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM candidates GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(status, count)| {
                CandidateStatus::parse(&status)
                    .map(|s| (s, count as u64))
                    .ok_or_else(|| StoreError::Database(format!("unknown status {status:?}")))
            })
            .collect()
    }

    async fn delete_candidate(&self, address: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM candidates WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_poll(
        &self,
        address: &str,
        attempts: u32,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE candidates SET poll_attempts = ?, last_checked = ? WHERE address = ?",
        )
        .bind(attempts as i64)
        .bind(checked_at.timestamp())
        .bind(address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(address.to_string()));
        }
        Ok(())
    }

    async fn record_reputation(
        &self,
        address: &str,
        handle: &str,
        followers: u64,
        verified: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE candidates
            SET creator_handle = ?, follower_count = ?, is_verified = ?
            WHERE address = ?
            "#,
        )
        .bind(handle)
        .bind(followers as i64)
        .bind(verified)
        .bind(address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(address.to_string()));
        }
        Ok(())
    }

    async fn mark_bought(
        &self,
        address: &str,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE candidates
            SET status = 'bought', bought_tx_hash = ?, bought_at = ?, last_error = NULL
            WHERE address = ?
            "#,
        )
        .bind(tx_hash)
        .bind(at.timestamp())
        .bind(address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(address.to_string()));
        }
        Ok(())
    }

    async fn mark_ignored(
        &self,
        address: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE candidates
            SET status = 'ignored', ignored_at = ?, last_error = ?
            WHERE address = ?
            "#,
        )
        .bind(at.timestamp())
        .bind(reason)
        .bind(address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(address.to_string()));
        }
        Ok(())
    }

    async fn mark_error(&self, address: &str, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE candidates SET status = 'error', last_error = ? WHERE address = ?",
        )
        .bind(reason)
        .bind(address)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(address.to_string()));
        }
        Ok(())
    }

    async fn position(&self, address: &str) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query_as::<_, PositionRow>(
            "SELECT address, address_checksum, total_amount FROM positions WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let purchases = sqlx::query_as::<_, PurchaseRow>(
            "SELECT amount, tx_hash, timestamp FROM purchases WHERE position_address = ? ORDER BY id ASC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Position {
            address: row.address,
            address_checksum: row.address_checksum,
            total_amount: row.total_amount as u64,
            purchases: purchases
                .into_iter()
                .map(|p| {
                    Ok(Purchase {
                        amount: p.amount as u64,
                        tx_hash: p.tx_hash,
                        timestamp: from_ts(p.timestamp)?,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?,
        }))
    }

    async fn positions(&self) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query_as::<_, PositionRow>(
            "SELECT address, address_checksum, total_amount FROM positions",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut positions = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(position) = self.position(&row.address).await? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn record_purchase(
        &self,
        address: &str,
        checksum: &str,
        amount: u64,
        tx_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO positions (address, address_checksum, total_amount)
            VALUES (?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET total_amount = total_amount + excluded.total_amount
            "#,
        )
        .bind(address)
        .bind(checksum)
        .bind(amount as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO purchases (position_address, amount, tx_hash, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(address)
        .bind(amount as i64)
        .bind(tx_hash)
        .bind(at.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reduce_position(&self, address: &str, amount: u64) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> =
            sqlx::query_as("SELECT total_amount FROM positions WHERE address = ?")
                .bind(address)
                .fetch_optional(&mut *tx)
                .await?;

        let held = row
            .map(|(n,)| n as u64)
            .ok_or_else(|| StoreError::NotFound(address.to_string()))?;

        if amount > held {
            return Err(StoreError::Conflict(format!(
                "cannot remove {amount} shares of {address}, holding {held}"
            )));
        }

        let remaining = held - amount;
        if remaining == 0 {
            sqlx::query("DELETE FROM positions WHERE address = ?")
                .bind(address)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM purchases WHERE position_address = ?")
                .bind(address)
                .execute(&mut *tx)
                .await?;
        } else {
            sqlx::query("UPDATE positions SET total_amount = ? WHERE address = ?")
                .bind(remaining as i64)
                .bind(address)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(remaining)
    }

    async fn last_processed_block(&self) -> Result<Option<u64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT block FROM checkpoint WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(b,)| b as u64))
    }

    async fn save_last_processed_block(&self, block: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoint (id, block) VALUES (0, ?)
            ON CONFLICT(id) DO UPDATE SET block = excluded.block
            "#,
        )
        .bind(block as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
