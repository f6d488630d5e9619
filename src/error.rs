//! Error types for cache operations.

use thiserror::Error;

/// Errors returned by the cache facade.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("absent values cannot be stored in the cache")]
    RejectedNullValue,
}

pub type CacheResult<T> = Result<T, CacheError>;
