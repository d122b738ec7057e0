use thiserror::Error;

/// Errors surfaced by the chain adapter. Revert sub-kinds are classified at
/// this boundary so callers can branch on them instead of parsing provider
/// messages themselves.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Rpc(String),

    #[error("insufficient funds to cover the transaction")]
    InsufficientFunds,

    #[error("cannot sell the last share")]
    LastShareUnsellable,

    #[error("insufficient shares held on chain")]
    InsufficientShares,

    #[error("gas estimation failed: {0}")]
    GasEstimation(String),

    #[error("contract reverted: {0}")]
    Reverted(String),

    #[error("transaction {0} was included but rolled back")]
    RolledBack(String),

    #[error("transaction dropped from the mempool before inclusion")]
    Dropped,
}

/// Errors returned by the trade executor. Never thrown past the executor
/// boundary as a panic; callers receive one of these and decide whether the
/// operation is retryable.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("another trade is already in flight")]
    Busy,

    #[error("no sellable holding: {0}")]
    NoHolding(String),

    #[error("executor is shut down")]
    Shutdown,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Persistence-layer errors, shared by the file and relational backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io failure: {0}")]
    Io(String),

    #[error("serialization failure: {0}")]
    Serialize(String),

    #[error("database failure: {0}")]
    Database(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("conflicting update: {0}")]
    Conflict(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialize(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Reputation API errors. Timeouts and non-success responses all map to
/// `Unavailable` so the scanner treats them as "try again next pass".
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("reputation api unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected response: {0}")]
    Malformed(String),
}
