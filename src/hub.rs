//! Main hub tying the log, registry, broadcaster and poller together.

use crate::error::{Result, StreamError};
use crate::store::{LogConfig, MemoryStore, MessageLog, MessageStore};
use crate::stream::{
    sink, Broadcaster, EventStream, Poller, PollerConfig, PollerHandle, SessionState, Sink,
    StreamSession, SubscriberRegistry, TickReport,
};
use crate::types::{AuthorId, Message, MessageId, NewMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Poller tick interval.
    /// Default: 1s
    pub poll_interval: Duration,

    /// Bound on any single send to a subscriber.
    /// Default: 250ms
    pub send_timeout: Duration,

    /// Buffer size of sinks created by [`ChatHub::subscribe`]. Also bounds
    /// the backlog sent before `subscribe` returns.
    /// Default: 256
    pub channel_capacity: usize,

    /// Max messages the poller fetches per subscriber per tick.
    pub poll_batch_limit: Option<usize>,

    /// Idle ceiling for sessions (None = unbounded).
    pub idle_timeout: Option<Duration>,

    /// Default size for [`ChatHub::recent`] and [`ChatHub::page`], and the
    /// most `recent` will ever return.
    /// Default: 50
    pub recent_limit: usize,

    /// Whether to start the background poller on construction.
    pub start_poller: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            send_timeout: Duration::from_millis(250),
            channel_capacity: 256,
            poll_batch_limit: Some(500),
            idle_timeout: None,
            recent_limit: 50,
            start_poller: true,
        }
    }
}

impl HubConfig {
    fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: self.poll_interval,
            send_timeout: self.send_timeout,
            batch_limit: self.poll_batch_limit,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Parse a client-supplied resume cursor (e.g. a `lastId` query value).
///
/// Missing or blank means "from the beginning".
pub fn parse_last_id(raw: Option<&str>) -> Result<MessageId> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(MessageId::ZERO),
        Some(raw) => raw,
    };

    match raw.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(MessageId(n as u64)),
        Ok(n) => Err(StreamError::InvalidCursor(format!("negative lastId {}", n))),
        Err(_) => Err(StreamError::InvalidCursor(format!("malformed lastId {:?}", raw))),
    }
}

/// A single shared message stream.
///
/// Provides a unified interface for:
/// - Appending messages and fanning them out
/// - Opening streaming sessions with backlog replay
/// - History queries for non-streaming consumers
/// - Administrative truncation
pub struct ChatHub {
    config: HubConfig,
    store: Arc<dyn MessageStore>,
    registry: Arc<SubscriberRegistry>,
    broadcaster: Broadcaster,
    poller: Mutex<Option<PollerHandle>>,
}

impl ChatHub {
    /// Build a hub over an existing store.
    pub fn new(store: Arc<dyn MessageStore>, config: HubConfig) -> Result<Self> {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.send_timeout);

        let poller = if config.start_poller {
            let poller = Poller::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                config.poller_config(),
            );
            Some(poller.spawn()?)
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            registry,
            broadcaster,
            poller: Mutex::new(poller),
        })
    }

    /// Hub over an in-memory log.
    pub fn in_memory(config: HubConfig) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), config)
    }

    /// Hub over a durable file-backed log.
    pub fn open_log(log_config: LogConfig, config: HubConfig) -> Result<Self> {
        let log = MessageLog::open(log_config)?;
        Self::new(Arc::new(log), config)
    }

    // --- Write Path ---

    /// Append a message and push it to live subscribers.
    ///
    /// `author_id` is assumed authenticated. An empty display name falls
    /// back to `"user <id>"`. Store failures are returned and nothing is
    /// broadcast; delivery failures never reach the caller.
    pub fn post(
        &self,
        author_id: AuthorId,
        display_name: &str,
        body: &str,
    ) -> Result<Message> {
        if body.trim().is_empty() {
            return Err(StreamError::InvalidMessage("message body is empty".into()));
        }

        let display_name = match display_name.trim() {
            "" => format!("user {}", author_id),
            name => name.to_string(),
        };

        let (message, previous) = self
            .store
            .append(NewMessage::new(author_id, display_name, body))
            .map_err(|e| {
                tracing::warn!(author = %author_id, error = %e, "Append failed");
                e
            })?;

        tracing::debug!(message_id = %message.id, author = %author_id, "Message appended");
        self.broadcaster.fan_out(&message, previous);

        Ok(message)
    }

    // --- Streaming ---

    /// Open a session backed by an in-process channel.
    ///
    /// The returned [`EventStream`] yields `connected`, the backlog after
    /// `last_id`, then live messages and pings. Drop it to disconnect.
    /// Only as much backlog as fits in the channel is sent up front; the
    /// poller delivers the remainder once the stream is being drained.
    pub fn subscribe(&self, last_id: MessageId) -> Result<(StreamSession, EventStream)> {
        let capacity = self.config.channel_capacity;
        let (sink, events) = sink::channel(capacity);

        // One slot goes to `connected`.
        let fits = capacity.saturating_sub(1);
        let limit = Some(self.config.poll_batch_limit.map_or(fits, |batch| batch.min(fits)));

        let session = self.open_session(last_id, Box::new(sink), limit)?;
        Ok((session, events))
    }

    /// Open a session delivering into a caller-provided sink.
    ///
    /// The connect-time backlog is capped at `poll_batch_limit`.
    pub fn subscribe_with(&self, last_id: MessageId, sink: Box<dyn Sink>) -> Result<StreamSession> {
        self.open_session(last_id, sink, self.config.poll_batch_limit)
    }

    fn open_session(
        &self,
        last_id: MessageId,
        sink: Box<dyn Sink>,
        backlog_limit: Option<usize>,
    ) -> Result<StreamSession> {
        StreamSession::open(
            self.store.as_ref(),
            Arc::clone(&self.registry),
            last_id,
            sink,
            self.config.send_timeout,
            backlog_limit,
        )
    }

    /// Like [`subscribe`](Self::subscribe), taking the raw `lastId` value.
    pub fn subscribe_raw(&self, last_id: Option<&str>) -> Result<(StreamSession, EventStream)> {
        self.subscribe(parse_last_id(last_id)?)
    }

    // --- Queries ---

    /// Messages after `cursor`, ascending.
    pub fn query_after(&self, cursor: MessageId, limit: Option<usize>) -> Result<Vec<Message>> {
        Ok(self.store.query_after(cursor, limit)?)
    }

    /// Newest messages first, at most `recent_limit` of them.
    pub fn recent(&self, limit: Option<usize>) -> Result<Vec<Message>> {
        let cap = self.config.recent_limit;
        Ok(self.store.recent(limit.map_or(cap, |limit| limit.min(cap)))?)
    }

    /// Newest-first page. Defaults to `recent_limit` per page.
    pub fn page(&self, page: usize, size: Option<usize>) -> Result<Vec<Message>> {
        Ok(self
            .store
            .page(page, size.unwrap_or(self.config.recent_limit))?)
    }

    pub fn last_id(&self) -> MessageId {
        self.store.last_id()
    }

    // --- Administration ---

    /// Delete every message.
    ///
    /// Ids are not reused, so existing cursors stay valid; any cursor above
    /// the store's high-water mark is rewound to it.
    pub fn delete_all(&self) -> Result<MessageId> {
        let high_water = self.store.truncate()?;
        let rewound = self.registry.rewind_cursors(high_water);

        tracing::info!(high_water = %high_water, rewound, "All messages deleted");
        Ok(high_water)
    }

    /// Run one catch-up pass now, outside the poller's schedule.
    pub fn poll_now(&self) -> TickReport {
        Poller::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.poller_config(),
        )
        .tick()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Stop the poller and end every open session.
    pub fn shutdown(&self) {
        if let Some(mut poller) = self.poller.lock().take() {
            poller.stop();
        }
        for subscriber in self.registry.snapshot() {
            self.registry.close(&subscriber, SessionState::Completed);
        }
    }
}

impl Drop for ChatHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}
