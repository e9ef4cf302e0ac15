//! In-memory message store.

use super::{newest_first, MessageStore};
use crate::error::StoreResult;
use crate::types::{Message, MessageId, NewMessage, Timestamp};
use parking_lot::RwLock;

struct Inner {
    /// Ascending by id.
    messages: Vec<Message>,
    /// Largest id ever assigned, kept across truncation.
    high_water: MessageId,
}

/// Process-local append-only log.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                messages: Vec::new(),
                high_water: MessageId::ZERO,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryStore {
    fn append(&self, input: NewMessage) -> StoreResult<(Message, MessageId)> {
        let mut inner = self.inner.write();

        let previous = inner
            .messages
            .last()
            .map(|m| m.id)
            .unwrap_or(MessageId::ZERO);
        let id = inner.high_water.next();
        let message = input.into_message(id, Timestamp::now());

        inner.messages.push(message.clone());
        inner.high_water = id;

        Ok((message, previous))
    }

    fn query_after(&self, cursor: MessageId, limit: Option<usize>) -> StoreResult<Vec<Message>> {
        let inner = self.inner.read();
        let start = inner.messages.partition_point(|m| m.id <= cursor);
        let tail = &inner.messages[start..];
        let take = limit.unwrap_or(tail.len()).min(tail.len());
        Ok(tail[..take].to_vec())
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<Message>> {
        Ok(newest_first(&self.inner.read().messages, 0, limit))
    }

    fn page(&self, page: usize, size: usize) -> StoreResult<Vec<Message>> {
        let skip = page.saturating_mul(size);
        Ok(newest_first(&self.inner.read().messages, skip, size))
    }

    fn last_id(&self) -> MessageId {
        self.inner.read().high_water
    }

    fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    fn truncate(&self) -> StoreResult<MessageId> {
        let mut inner = self.inner.write();
        inner.messages.clear();
        Ok(inner.high_water)
    }
}
