use crate::domain::balance::Coins;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Step of a settlement replace that was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStage {
    /// Writing the new generation. The previous result set is still the visible one.
    Stage,
    /// Swapping the current-generation pointer. The previous result set is still visible.
    Publish,
    /// Deleting superseded generations. The new result set is visible; stale rows linger.
    Prune,
}

impl fmt::Display for ReplaceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceStage::Stage => f.write_str("stage"),
            ReplaceStage::Publish => f.write_str("publish"),
            ReplaceStage::Prune => f.write_str("prune"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("No balance record for user {user_id}")]
    NoBalanceRecord { user_id: String },
    #[error("Insufficient balance for user {user_id}: available {available}, requested {requested}")]
    InsufficientBalance {
        user_id: String,
        available: Coins,
        requested: u64,
    },
    #[error("Cannot transfer to self ({user_id})")]
    SelfTransfer { user_id: String },
    #[error("Package not found: {package_id}")]
    PackageNotFound { package_id: String },
    #[error("Invalid package: {0}")]
    InvalidPackage(String),
    #[error("Rating {0} is outside 1..=5")]
    InvalidRating(i64),
    #[error("Invalid month key '{0}', expected YYYY-MM")]
    InvalidMonth(String),
    #[error("Invalid commission percent {0}")]
    InvalidPercent(f64),
    #[error("{kind} not found: {id}")]
    RecordNotFound { kind: &'static str, id: String },
    #[error("{kind} {id} cannot move from {from} to {to}")]
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },
    #[error("Write conflict on {key} after {attempts} attempts")]
    WriteConflict { key: String, attempts: u32 },
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Settlement replace of {scope} interrupted during {stage}: {source}")]
    PartialReplace {
        scope: String,
        stage: ReplaceStage,
        #[source]
        source: Box<CoreError>,
    },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Wraps a backing-store failure.
    pub fn store<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        CoreError::StoreUnavailable(err.into())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::store(err)
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for CoreError {
    fn from(err: rocksdb::Error) -> Self {
        CoreError::store(err)
    }
}
