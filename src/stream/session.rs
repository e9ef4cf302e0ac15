//! Per-connection streaming session.

use super::event::{SessionState, StreamEvent};
use super::registry::{Delivery, Subscriber, SubscriberRegistry};
use super::sink::Sink;
use crate::error::{Result, StreamError};
use crate::store::MessageStore;
use crate::types::{MessageId, SubscriberId};
use std::sync::Arc;
use std::time::Duration;

/// A live streaming connection.
///
/// Opening a session registers it, sends `connected` and the backlog, then
/// leaves it `Active` for the broadcaster and poller to feed. Every way a
/// session can end (close, drop, idle timeout, send failure) goes through
/// [`SubscriberRegistry::close`], which unregisters exactly once.
pub struct StreamSession {
    subscriber: Arc<Subscriber>,
    registry: Arc<SubscriberRegistry>,
}

/// Outcome of one backlog pass.
#[derive(Clone, Copy)]
enum Backlog {
    /// Everything past the cursor was read.
    Complete(usize),
    /// The read hit its limit or failed; the poller picks up the rest.
    Truncated(usize),
}

impl Backlog {
    fn sent(self) -> usize {
        match self {
            Backlog::Complete(sent) | Backlog::Truncated(sent) => sent,
        }
    }
}

impl StreamSession {
    /// Register a subscriber resuming after `last_id` and bring it live.
    ///
    /// At most `backlog_limit` messages are sent before this returns; the
    /// poller delivers the rest in order once the caller starts draining.
    /// A failed backlog query is not fatal: the session still goes live and
    /// the poller retries from the same cursor. A failed send is.
    pub fn open(
        store: &dyn MessageStore,
        registry: Arc<SubscriberRegistry>,
        last_id: MessageId,
        sink: Box<dyn Sink>,
        send_timeout: Duration,
        backlog_limit: Option<usize>,
    ) -> Result<Self> {
        let subscriber = registry.register(last_id, sink);
        let session = Self {
            subscriber,
            registry,
        };

        if let Err(e) = session.connect(store, last_id, send_timeout, backlog_limit) {
            session.registry.drop_failed(&session.subscriber, &e);
            return Err(e);
        }

        Ok(session)
    }

    fn connect(
        &self,
        store: &dyn MessageStore,
        last_id: MessageId,
        send_timeout: Duration,
        backlog_limit: Option<usize>,
    ) -> Result<()> {
        self.subscriber
            .send_control(StreamEvent::Connected, send_timeout)?;

        let backlog = self.send_backlog(store, last_id, backlog_limit, send_timeout)?;

        if !self.subscriber.activate() {
            return Err(StreamError::SubscriberNotFound(self.id()));
        }

        // Anything appended while we were connecting was skipped by the
        // broadcaster; pick it up now rather than on the next tick.
        let late = match backlog {
            Backlog::Complete(sent) => {
                let remaining = backlog_limit.map(|limit| limit.saturating_sub(sent));
                self.send_backlog(store, self.subscriber.cursor(), remaining, send_timeout)?
                    .sent()
            }
            Backlog::Truncated(_) => 0,
        };

        tracing::info!(
            subscriber = %self.id(),
            last_id = %last_id,
            backlog = backlog.sent() + late,
            "Stream session active"
        );
        Ok(())
    }

    fn send_backlog(
        &self,
        store: &dyn MessageStore,
        cursor: MessageId,
        limit: Option<usize>,
        send_timeout: Duration,
    ) -> Result<Backlog> {
        let backlog = match store.query_after(cursor, limit) {
            Ok(backlog) => backlog,
            Err(e) => {
                tracing::warn!(subscriber = %self.id(), error = %e, "Backlog query failed");
                return Ok(Backlog::Truncated(0));
            }
        };

        let mut sent = 0;
        let mut after = cursor;
        for message in &backlog {
            match self.subscriber.deliver(message, after, send_timeout)? {
                Delivery::Sent => sent += 1,
                Delivery::AlreadyDelivered => {}
                Delivery::Gap | Delivery::Busy => break,
            }
            after = message.id;
        }

        if limit.is_some_and(|limit| backlog.len() >= limit) {
            tracing::debug!(subscriber = %self.id(), sent, "Backlog capped, poller continues");
            Ok(Backlog::Truncated(sent))
        } else {
            Ok(Backlog::Complete(sent))
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    pub fn state(&self) -> SessionState {
        self.subscriber.state()
    }

    /// Last message id delivered on this session.
    pub fn cursor(&self) -> MessageId {
        self.subscriber.cursor()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// The client closed the connection cleanly.
    pub fn close(&self) -> bool {
        self.registry.close(&self.subscriber, SessionState::Completed)
    }

    /// The idle ceiling was hit.
    pub fn time_out(&self) -> bool {
        self.registry.close(&self.subscriber, SessionState::TimedOut)
    }

    /// The transport reported an error.
    pub fn fail(&self, error: &StreamError) -> bool {
        tracing::warn!(subscriber = %self.id(), error = %error, "Transport error");
        self.registry.close(&self.subscriber, SessionState::Errored)
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}
