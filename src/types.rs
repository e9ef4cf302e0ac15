//! Core types for the message log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a message in the log.
///
/// Assigned by the store at append time. Ids are strictly increasing and
/// are the only ordering key; `0` is the "before everything" cursor.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Cursor that precedes every message.
    pub const ZERO: MessageId = MessageId(0);

    pub fn next(self) -> Self {
        MessageId(self.0 + 1)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one streaming connection.
///
/// Drawn from a process-wide atomic counter, so two connections opened in
/// the same instant still get distinct ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub u64);

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Identity of an author, validated upstream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(pub u64);

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self.0)
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A message in the log. Immutable once appended.
///
/// The serialized field names are the ones streaming clients already
/// consume (`userId`, `username`, `message`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the store.
    pub id: MessageId,

    #[serde(rename = "userId")]
    pub author_id: AuthorId,

    #[serde(rename = "username")]
    pub display_name: String,

    #[serde(rename = "message")]
    pub body: String,

    /// Informational only. Never used for ordering.
    #[serde(rename = "createdAt")]
    pub created_at: Timestamp,
}

/// Input for appending a message (before id/timestamp are assigned).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    pub author_id: AuthorId,
    pub display_name: String,
    pub body: String,
}

impl NewMessage {
    pub fn new(
        author_id: AuthorId,
        display_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            author_id,
            display_name: display_name.into(),
            body: body.into(),
        }
    }

    /// Stamp the input with its assigned id and creation time.
    pub(crate) fn into_message(self, id: MessageId, created_at: Timestamp) -> Message {
        Message {
            id,
            author_id: self.author_id,
            display_name: self.display_name,
            body: self.body,
            created_at,
        }
    }
}
