//! Append-only message storage.
//!
//! The streaming core only needs an ordered log it can append to and query
//! by cursor. Two adapters are provided:
//!
//! - [`MemoryStore`]: in-process, for tests and ephemeral rooms
//! - [`MessageLog`]: durable, file-backed, checksummed records
//!
//! Both assign ids from a high-water mark that survives [`truncate`], so
//! an id is never handed out twice.
//!
//! [`truncate`]: MessageStore::truncate

mod log;
mod memory;

pub use log::{LogConfig, MessageLog};
pub use memory::MemoryStore;

use crate::error::StoreResult;
use crate::types::{Message, MessageId, NewMessage};

/// An ordered, append-only message log.
pub trait MessageStore: Send + Sync {
    /// Persist a message.
    ///
    /// Returns the stored message and the id of the message that preceded
    /// it in the log (`MessageId::ZERO` if it is the first one).
    fn append(&self, input: NewMessage) -> StoreResult<(Message, MessageId)>;

    /// Messages with `id > cursor`, ascending by id, at most `limit`.
    fn query_after(&self, cursor: MessageId, limit: Option<usize>) -> StoreResult<Vec<Message>>;

    /// The newest `limit` messages, newest first.
    fn recent(&self, limit: usize) -> StoreResult<Vec<Message>>;

    /// Newest-first pagination. `page` is zero-based.
    fn page(&self, page: usize, size: usize) -> StoreResult<Vec<Message>>;

    /// Largest id ever assigned (`MessageId::ZERO` if none).
    fn last_id(&self) -> MessageId;

    /// Number of messages currently stored.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete every message. Returns the preserved high-water mark.
    fn truncate(&self) -> StoreResult<MessageId>;
}

/// Newest-first window over an ascending slice.
pub(crate) fn newest_first(messages: &[Message], skip: usize, take: usize) -> Vec<Message> {
    messages.iter().rev().skip(skip).take(take).cloned().collect()
}
