//! Persistence boundary: records, error taxonomy, and the store traits the
//! authenticator and tag resolver are injected with.

mod sqlite;

pub use sqlite::{EventRow, PersistedEvent, SqliteStore};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::RpcCode;

/// Persisted API-key credential. Immutable except for `revoked`, which a
/// separate revocation operation flips.
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialRecord {
    pub id: String,
    pub key_hash: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub revoked: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("user insert failed: {0}")]
    UserInsertFailed(String),
    #[error("event insert failed: {0}")]
    EventInsertFailed(String),
    #[error("timestamp could not be converted: {0}")]
    InvalidTimestamp(String),
    #[error("insert produced no row id")]
    EmptyResult,
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),
    #[error("price calculation failed: {0}")]
    PriceCalculationFailed(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::TransactionFailed(_) => "TRANSACTION_FAILED",
            StoreError::UserInsertFailed(_) => "USER_INSERT_FAILED",
            StoreError::EventInsertFailed(_) => "EVENT_INSERT_FAILED",
            StoreError::InvalidTimestamp(_) => "INVALID_TIMESTAMP",
            StoreError::EmptyResult => "EMPTY_RESULT",
            StoreError::UnknownEventType(_) => "UNKNOWN_EVENT_TYPE",
            StoreError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            StoreError::DuplicateKey(_) => "DUPLICATE_KEY",
            StoreError::ForeignKeyViolation(_) => "FOREIGN_KEY_VIOLATION",
            StoreError::PriceCalculationFailed(_) => "PRICE_CALCULATION_FAILED",
            StoreError::Query(_) | StoreError::Join(_) | StoreError::Json(_) => "DATABASE_ERROR",
        }
    }

    pub fn code(&self) -> RpcCode {
        match self {
            StoreError::ConstraintViolation(_)
            | StoreError::DuplicateKey(_)
            | StoreError::ForeignKeyViolation(_)
            | StoreError::PriceCalculationFailed(_) => RpcCode::FailedPrecondition,
            _ => RpcCode::Internal,
        }
    }
}

/// Select-by-hash lookup consumed by the authenticator.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn credential_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<CredentialRecord>, StoreError>;
}

/// Select-by-tag lookup consumed by the tag resolver. Amounts are integer
/// cents as stored, never rescaled.
#[async_trait]
pub trait TagStore: Send + Sync {
    async fn tag_amount(&self, tag: &str) -> Result<Option<i64>, StoreError>;
}
