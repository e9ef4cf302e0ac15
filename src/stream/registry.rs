//! Registry of live streaming subscribers.
//!
//! # Locking discipline
//!
//! - The membership map sits behind a `RwLock` that is only held long
//!   enough to insert, remove, or clone `Arc`s out of it. No send ever
//!   happens under it.
//! - Each [`Subscriber`] has a delivery lane (a `Mutex<()>`) held for the
//!   duration of one bounded send. Push and poll for the same subscriber
//!   queue on it, so their sends never interleave.
//! - The cursor is an `AtomicU64` advanced with compare-and-set after each
//!   successful send. It never moves backward outside of
//!   [`SubscriberRegistry::rewind_cursors`].
//! - The session state is an `AtomicU8`; the first terminal transition wins
//!   and is the only one that unregisters.

use super::event::{SessionState, StreamEvent};
use super::sink::Sink;
use crate::error::{DeliveryError, StreamError};
use crate::types::{Message, MessageId, SubscriberId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of offering one message to a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the sink; cursor advanced to the message id.
    Sent,
    /// The subscriber already has this message.
    AlreadyDelivered,
    /// The subscriber is missing an earlier message; left for catch-up.
    Gap,
    /// Another send held the lane past the wait bound; left for catch-up.
    Busy,
}

/// One live streaming connection.
pub struct Subscriber {
    id: SubscriberId,
    cursor: AtomicU64,
    state: AtomicU8,
    sink: Box<dyn Sink>,
    lane: Mutex<()>,
    connected_at: Instant,
    /// Millis after `connected_at` of the last delivered message.
    last_activity_ms: AtomicU64,
}

impl Subscriber {
    fn new(id: SubscriberId, cursor: MessageId, sink: Box<dyn Sink>) -> Self {
        Self {
            id,
            cursor: AtomicU64::new(cursor.0),
            state: AtomicU8::new(SessionState::Connecting as u8),
            sink,
            lane: Mutex::new(()),
            connected_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Last message id this subscriber has received.
    pub fn cursor(&self) -> MessageId {
        MessageId(self.cursor.load(Ordering::Acquire))
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Time since the last message was delivered (or since connect).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last)
    }

    /// Move the cursor forward to `new`.
    ///
    /// Compare-and-set: fails with `RegistryInconsistency` unless `new` is
    /// strictly greater than the current cursor.
    pub fn advance_cursor(&self, new: MessageId) -> Result<(), StreamError> {
        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            if new.0 <= current {
                return Err(StreamError::RegistryInconsistency {
                    subscriber: self.id,
                    current: MessageId(current),
                    attempted: new,
                });
            }
            match self.cursor.compare_exchange_weak(
                current,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Offer `message` to this subscriber.
    ///
    /// `after` is the id of the message that precedes `message` in the log.
    /// The message is only sent when the cursor sits in `[after, id)`, so a
    /// subscriber never skips over a message it has not received yet.
    pub(crate) fn deliver(
        &self,
        message: &Message,
        after: MessageId,
        timeout: Duration,
    ) -> Result<Delivery, StreamError> {
        let _lane = self.lane.lock();
        self.deliver_in_lane(message, after, timeout)
    }

    /// Like [`deliver`](Self::deliver), but waits at most `timeout` for the
    /// lane. Returns [`Delivery::Busy`] instead of queueing behind a send
    /// that is already in flight.
    pub(crate) fn try_deliver(
        &self,
        message: &Message,
        after: MessageId,
        timeout: Duration,
    ) -> Result<Delivery, StreamError> {
        match self.lane.try_lock_for(timeout) {
            Some(_lane) => self.deliver_in_lane(message, after, timeout),
            None => Ok(Delivery::Busy),
        }
    }

    fn deliver_in_lane(
        &self,
        message: &Message,
        after: MessageId,
        timeout: Duration,
    ) -> Result<Delivery, StreamError> {
        let cursor = self.cursor();
        if message.id <= cursor {
            return Ok(Delivery::AlreadyDelivered);
        }
        if cursor < after {
            return Ok(Delivery::Gap);
        }

        self.sink.send(StreamEvent::Message(message.clone()), timeout)?;
        self.advance_cursor(message.id)?;
        self.touch();

        tracing::trace!(subscriber = %self.id, message_id = %message.id, "Message delivered");
        Ok(Delivery::Sent)
    }

    /// Send an event that does not move the cursor (`connected`, `ping`).
    pub(crate) fn send_control(
        &self,
        event: StreamEvent,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        debug_assert!(event.id().is_none());
        let _lane = self.lane.lock();
        self.sink.send(event, timeout)
    }

    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to a terminal state. Returns true for the caller that won.
    fn finish(&self, to: SessionState) -> bool {
        debug_assert!(to.is_terminal());
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if SessionState::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn touch(&self) {
        let elapsed = self.connected_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Lower the cursor to `ceiling` if it is above it.
    fn clamp_cursor(&self, ceiling: MessageId) -> bool {
        let _lane = self.lane.lock();
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > ceiling.0).then_some(ceiling.0)
            })
            .is_ok()
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("cursor", &self.cursor())
            .field("state", &self.state())
            .finish()
    }
}

/// Concurrent collection of active subscribers.
///
/// Shared by the accept path (register), the write path and the poller
/// (snapshot + cursor CAS). Pass it around as `Arc<SubscriberRegistry>`.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber in the `Connecting` state.
    pub fn register(&self, initial_cursor: MessageId, sink: Box<dyn Sink>) -> Arc<Subscriber> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber::new(id, initial_cursor, sink));

        let count = {
            let mut subs = self.subscribers.write();
            subs.insert(id, Arc::clone(&subscriber));
            subs.len()
        };

        tracing::info!(
            subscriber = %id,
            cursor = %initial_cursor,
            subscribers = count,
            "Subscriber registered"
        );
        subscriber
    }

    /// Remove a subscriber. No-op if it is already gone.
    pub fn unregister(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        let removed = self.subscribers.write().remove(&id);
        if removed.is_some() {
            tracing::debug!(subscriber = %id, "Subscriber unregistered");
        }
        removed
    }

    /// Terminal transition plus cleanup.
    ///
    /// Every completion, timeout and failure path ends here. Only the first
    /// call for a subscriber wins; it unregisters and returns true.
    pub fn close(&self, subscriber: &Subscriber, to: SessionState) -> bool {
        if !subscriber.finish(to) {
            return false;
        }
        self.unregister(subscriber.id);

        tracing::info!(
            subscriber = %subscriber.id,
            state = ?to,
            cursor = %subscriber.cursor(),
            "Stream session ended"
        );
        true
    }

    /// Drop a subscriber after a failed delivery attempt.
    pub(crate) fn drop_failed(&self, subscriber: &Subscriber, error: &StreamError) {
        match error {
            StreamError::RegistryInconsistency { .. } => {
                tracing::error!(subscriber = %subscriber.id, error = %error, "Cursor invariant violated");
            }
            _ => {
                tracing::warn!(subscriber = %subscriber.id, error = %error, "Dropping subscriber");
            }
        }
        self.close(subscriber, SessionState::Errored);
    }

    /// Point-in-time copy of the registered subscribers.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.read().values().cloned().collect()
    }

    pub fn get(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(&id).cloned()
    }

    /// Advance a subscriber's cursor by id. See [`Subscriber::advance_cursor`].
    pub fn advance_cursor(&self, id: SubscriberId, new_cursor: MessageId) -> Result<(), StreamError> {
        let subscriber = self.get(id).ok_or(StreamError::SubscriberNotFound(id))?;
        subscriber.advance_cursor(new_cursor)
    }

    /// Lower every cursor above `high_water` to it.
    ///
    /// Used after the log is truncated so no subscriber waits on ids that
    /// will never exist. Returns how many cursors moved.
    pub fn rewind_cursors(&self, high_water: MessageId) -> usize {
        let mut moved = 0;
        for subscriber in self.snapshot() {
            if subscriber.clamp_cursor(high_water) {
                tracing::warn!(
                    subscriber = %subscriber.id,
                    high_water = %high_water,
                    "Cursor rewound after truncation"
                );
                moved += 1;
            }
        }
        moved
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
