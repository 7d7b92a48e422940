//! Error types for mirrorkit-core

use thiserror::Error;

/// Result type alias using mirrorkit-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mirrorkit-core operations
///
/// Nothing in this crate retries internally; every failure is surfaced as a
/// value so the caller owns the retry/notification policy.
#[derive(Error, Debug)]
pub enum Error {
    /// Live feed could not be established or dropped mid-subscription
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Remote store has no document with the given id
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Remote store refused a create/update/delete
    ///
    /// Produced by network-backed [`RemoteFeed`](crate::feed::RemoteFeed)
    /// implementations for authorization and validation refusals; the
    /// in-memory backend has no refusal path of its own
    #[error("Mutation rejected: {0}")]
    Rejected(String),

    /// Upload bytes could not be sent
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Bytes were fully transferred but no durable URL could be obtained
    #[error("URL resolution failed: {0}")]
    UrlResolution(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
