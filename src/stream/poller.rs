//! Periodic catch-up and keep-alive.
//!
//! One shared thread walks the registry snapshot every tick, no matter how
//! many subscribers are connected. For each active subscriber it queries
//! the store past the subscriber's cursor and delivers whatever is there,
//! or sends a `ping` when there is nothing new. This is what guarantees
//! delivery within one interval when a push was missed.

use super::event::{SessionState, StreamEvent};
use super::registry::{Delivery, Subscriber, SubscriberRegistry};
use crate::error::StreamError;
use crate::store::MessageStore;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poller configuration.
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Time between ticks.
    /// Default: 1s
    pub interval: Duration,

    /// Bound on each send.
    ///
    /// A tick stops starting new subscribers once it has run for
    /// `interval`; the ones it did not reach go first on the next tick. A
    /// single subscriber can still hold a tick for up to `send_timeout`
    /// per message in its batch before it is dropped.
    pub send_timeout: Duration,

    /// Max messages fetched per subscriber per tick (None = no limit).
    pub batch_limit: Option<usize>,

    /// Drop subscribers that have not received a message for this long
    /// (None = sessions never time out).
    pub idle_timeout: Option<Duration>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            send_timeout: Duration::from_millis(250),
            batch_limit: Some(500),
            idle_timeout: None,
        }
    }
}

/// Counts from one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub subscribers: usize,
    pub delivered: usize,
    pub heartbeats: usize,
    pub dropped: usize,
    pub timed_out: usize,
    pub query_failures: usize,
    /// Subscribers not reached before the tick ran out of time.
    pub deferred: usize,
}

/// Catch-up loop over the registry.
pub struct Poller {
    store: Arc<dyn MessageStore>,
    registry: Arc<SubscriberRegistry>,
    config: PollerConfig,
    /// Where the next tick starts in the id-ordered snapshot.
    resume_at: AtomicUsize,
}

impl Poller {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<SubscriberRegistry>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            resume_at: AtomicUsize::new(0),
        }
    }

    /// Run one pass over every registered subscriber.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let started = Instant::now();

        let mut subscribers = self.registry.snapshot();
        subscribers.sort_by_key(|subscriber| subscriber.id());
        if !subscribers.is_empty() {
            let start = self.resume_at.load(Ordering::Relaxed) % subscribers.len();
            subscribers.rotate_left(start);
        }
        let total = subscribers.len();

        for (served, subscriber) in subscribers.into_iter().enumerate() {
            if served > 0 && started.elapsed() >= self.config.interval {
                report.deferred = total - served;
                self.resume_at.fetch_add(served, Ordering::Relaxed);
                tracing::warn!(
                    served,
                    deferred = report.deferred,
                    elapsed = ?started.elapsed(),
                    "Poll tick overran its interval"
                );
                break;
            }

            if subscriber.state() != SessionState::Active {
                continue;
            }
            report.subscribers += 1;

            if let Some(idle) = self.config.idle_timeout {
                if subscriber.idle_for() > idle {
                    if self.registry.close(&subscriber, SessionState::TimedOut) {
                        report.timed_out += 1;
                    }
                    continue;
                }
            }

            self.catch_up(&subscriber, &mut report);
        }

        if report.delivered > 0 || report.dropped > 0 || report.timed_out > 0 {
            tracing::debug!(
                subscribers = report.subscribers,
                delivered = report.delivered,
                dropped = report.dropped,
                timed_out = report.timed_out,
                "Poll tick"
            );
        }
        report
    }

    fn catch_up(&self, subscriber: &Subscriber, report: &mut TickReport) {
        let cursor = subscriber.cursor();
        let batch = match self.store.query_after(cursor, self.config.batch_limit) {
            Ok(batch) => batch,
            Err(e) => {
                // Retried next tick.
                tracing::warn!(subscriber = %subscriber.id(), error = %e, "Catch-up query failed");
                report.query_failures += 1;
                return;
            }
        };

        if batch.is_empty() {
            match subscriber.send_control(StreamEvent::Ping, self.config.send_timeout) {
                Ok(()) => report.heartbeats += 1,
                Err(e) => {
                    self.registry.drop_failed(subscriber, &StreamError::from(e));
                    report.dropped += 1;
                }
            }
            return;
        }

        let mut after = cursor;
        for message in &batch {
            match subscriber.deliver(message, after, self.config.send_timeout) {
                Ok(Delivery::Sent) => report.delivered += 1,
                Ok(Delivery::AlreadyDelivered) => {}
                Ok(Delivery::Gap | Delivery::Busy) => break,
                Err(e) => {
                    self.registry.drop_failed(subscriber, &e);
                    report.dropped += 1;
                    return;
                }
            }
            after = message.id;
        }
    }

    /// Start the poller on its own thread.
    pub fn spawn(self) -> std::io::Result<PollerHandle> {
        let (shutdown, stop) = bounded::<()>(1);
        let interval = self.config.interval;

        let thread = thread::Builder::new()
            .name("chatfan-poller".into())
            .spawn(move || {
                let ticker = tick(interval);
                tracing::debug!(?interval, "Poller started");
                loop {
                    let stopped = select! {
                        recv(stop) -> _ => true,
                        recv(ticker) -> _ => false,
                    };
                    if stopped {
                        break;
                    }
                    self.tick();
                }
                tracing::debug!("Poller stopped");
            })?;

        Ok(PollerHandle {
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }
}

/// Owner of a running poller thread. Stops it on drop.
pub struct PollerHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Signal the poller and wait for it to exit.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the loop.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Poller thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::stream::sink::channel;
    use crate::types::{AuthorId, MessageId, NewMessage};

    fn setup() -> (Arc<MemoryStore>, Arc<SubscriberRegistry>, Poller) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let poller = Poller::new(
            store.clone(),
            Arc::clone(&registry),
            PollerConfig {
                interval: Duration::from_millis(20),
                send_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        (store, registry, poller)
    }

    fn append(store: &MemoryStore, n: usize) {
        for i in 0..n {
            store
                .append(NewMessage::new(AuthorId(1), "t", format!("m{}", i)))
                .unwrap();
        }
    }

    #[test]
    fn test_tick_catches_up_in_order() {
        let (store, registry, poller) = setup();
        append(&store, 4);

        let (sink, stream) = channel(16);
        let sub = registry.register(MessageId(1), Box::new(sink));
        sub.activate();

        let report = poller.tick();
        assert_eq!(report.delivered, 3);
        assert_eq!(sub.cursor(), MessageId(4));

        let ids: Vec<_> = stream.drain().iter().filter_map(|e| e.id()).collect();
        assert_eq!(ids, vec![MessageId(2), MessageId(3), MessageId(4)]);
    }

    #[test]
    fn test_tick_sends_ping_when_idle() {
        let (_store, registry, poller) = setup();

        let (sink, stream) = channel(4);
        let sub = registry.register(MessageId::ZERO, Box::new(sink));
        sub.activate();

        let report = poller.tick();
        assert_eq!(report.heartbeats, 1);
        assert_eq!(stream.drain(), vec![StreamEvent::Ping]);
        assert_eq!(sub.cursor(), MessageId::ZERO);
    }

    #[test]
    fn test_partial_batch_failure_keeps_last_good_cursor() {
        let (store, registry, poller) = setup();
        append(&store, 3);

        // Room for exactly two messages, then the send times out.
        let (sink, _stream) = channel(2);
        let sub = registry.register(MessageId::ZERO, Box::new(sink));
        sub.activate();

        let report = poller.tick();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);
        assert_eq!(sub.cursor(), MessageId(2));
        assert_eq!(sub.state(), SessionState::Errored);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_batch_limit() {
        let (store, registry, _) = setup();
        let poller = Poller::new(
            store.clone(),
            Arc::clone(&registry),
            PollerConfig {
                batch_limit: Some(2),
                send_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        append(&store, 5);

        let (sink, _stream) = channel(16);
        let sub = registry.register(MessageId::ZERO, Box::new(sink));
        sub.activate();

        poller.tick();
        assert_eq!(sub.cursor(), MessageId(2));
        poller.tick();
        assert_eq!(sub.cursor(), MessageId(4));
    }

    #[test]
    fn test_idle_timeout() {
        let (store, registry, _) = setup();
        let poller = Poller::new(
            store,
            Arc::clone(&registry),
            PollerConfig {
                idle_timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );

        let (sink, _stream) = channel(4);
        let sub = registry.register(MessageId::ZERO, Box::new(sink));
        sub.activate();

        thread::sleep(Duration::from_millis(30));
        let report = poller.tick();
        assert_eq!(report.timed_out, 1);
        assert_eq!(sub.state(), SessionState::TimedOut);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_spawned_poller_delivers_and_stops() {
        let (store, registry, poller) = setup();
        let mut handle = poller.spawn().unwrap();

        let (sink, stream) = channel(64);
        let sub = registry.register(MessageId::ZERO, Box::new(sink));
        sub.activate();
        append(&store, 1);

        let delivered = (0..50).find_map(|_| {
            match stream.recv_timeout(Duration::from_millis(100)) {
                Ok(StreamEvent::Message(m)) => Some(m.id),
                _ => None,
            }
        });
        assert_eq!(delivered, Some(MessageId(1)));

        assert!(handle.is_running());
        handle.stop();
        assert!(!handle.is_running());
    }

    /// Sink that stalls for the whole send timeout, then gives up.
    struct StalledSink;

    impl crate::stream::Sink for StalledSink {
        fn send(
            &self,
            _event: StreamEvent,
            timeout: Duration,
        ) -> Result<(), crate::error::DeliveryError> {
            thread::sleep(timeout);
            Err(crate::error::DeliveryError::Timeout(timeout))
        }
    }

    #[test]
    fn test_overrunning_tick_defers_remaining_subscribers() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SubscriberRegistry::new());
        let poller = Poller::new(
            store,
            Arc::clone(&registry),
            PollerConfig {
                interval: Duration::from_millis(30),
                send_timeout: Duration::from_millis(25),
                ..Default::default()
            },
        );

        for _ in 0..3 {
            registry
                .register(MessageId::ZERO, Box::new(StalledSink))
                .activate();
        }

        let report = poller.tick();
        assert!(report.dropped >= 1);
        assert!(report.deferred >= 1);
        assert_eq!(report.dropped + report.deferred, 3);

        // The ones left over are served on later ticks.
        for _ in 0..3 {
            if registry.is_empty() {
                break;
            }
            poller.tick();
        }
        assert!(registry.is_empty());
    }
}
