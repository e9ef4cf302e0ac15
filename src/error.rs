//! Error types for the message log and the streaming core.

use crate::types::{MessageId, SubscriberId};
use thiserror::Error;

/// Persistence failures from a [`MessageStore`](crate::store::MessageStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Log is locked by another process")]
    Locked,

    #[error("Log not initialized")]
    NotInitialized,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// A sink could not accept an event.
///
/// Always handled by the component that attempted the send; it is never
/// surfaced to the author of a message.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Sink closed")]
    Closed,

    #[error("Send timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Write error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Top-level error for hub and session operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Cursor for {subscriber} would move backward: {current} -> {attempted}")]
    RegistryInconsistency {
        subscriber: SubscriberId,
        current: MessageId,
        attempted: MessageId,
    },

    #[error("Subscriber not registered: {0}")]
    SubscriberNotFound(SubscriberId),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for streaming operations.
pub type Result<T> = std::result::Result<T, StreamError>;
