//! Error taxonomy shared by every [`ShopStore`](crate::store::ShopStore)
//! implementation.

use thiserror::Error;

use crate::geohash::GeohashError;

/// Failure of a store operation.
///
/// Callers can tell a missing record and a malformed request apart from a
/// backend that is down. Empty result sets are never errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup by id found nothing.
    #[error("shop {0} not found")]
    NotFound(i64),

    /// The request was rejected before reaching storage.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The backend could not be reached. Not retried internally.
    #[error("backend unavailable: {0}")]
    Connection(String),

    /// The backend was reachable but the operation failed.
    #[error("query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn query(msg: impl std::fmt::Display) -> Self {
        StoreError::Query(msg.to_string())
    }

    /// True for errors that mean "try again later" rather than "bad input".
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<GeohashError> for StoreError {
    fn from(err: GeohashError) -> Self {
        StoreError::Validation(err.to_string())
    }
}
