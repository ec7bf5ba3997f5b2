//! Error types for the signaling engine.

use crate::scheduler::SourceId;
use crate::transaction::TransactionKey;
use thiserror::Error;

/// Result type for signaling operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during signaling operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-related errors: the channel failed to send, or reported a
    /// connection-level failure. Terminates the owning transaction.
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol timeout: the transaction gave up waiting for the peer
    /// (timers B/F/H). Distinct from transport failure.
    #[error("transaction timed out: {0}")]
    TransactionTimeout(TransactionKey),

    /// Transaction not found for the given key.
    #[error("transaction not found: {0}")]
    TransactionNotFound(TransactionKey),

    /// A transaction with the same key already exists.
    #[error("transaction already exists: {0}")]
    TransactionExists(TransactionKey),

    /// Invalid state transition attempted on a transaction.
    #[error("invalid transaction state transition: {0}")]
    InvalidStateTransition(String),

    /// A source with the same id is already registered with the main loop.
    #[error("source already registered: {0}")]
    SourceExists(SourceId),

    /// No source registered under the given id.
    #[error("source not found: {0}")]
    SourceNotFound(SourceId),

    /// The message is missing a field the engine routes on (branch, tags).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No dialog matches the given identity triple.
    #[error("dialog not found: {0}")]
    DialogNotFound(String),

    /// Other errors.
    #[error("{0}")]
    Other(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}
