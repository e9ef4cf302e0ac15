//! Immediate push of freshly appended messages.

use super::event::SessionState;
use super::registry::{Delivery, SubscriberRegistry};
use crate::types::{Message, MessageId};
use std::sync::Arc;
use std::time::Duration;

/// Counts from one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Subscribers that received the message.
    pub delivered: usize,
    /// Subscribers that already had it, or are still connecting.
    pub skipped: usize,
    /// Subscribers missing an earlier message; the poller will catch them up.
    pub deferred: usize,
    /// Subscribers dropped because the send failed or timed out.
    pub dropped: usize,
}

/// Pushes new messages to every caught-up subscriber.
///
/// Runs on the writer's thread right after a successful append. Each send
/// is bounded by `send_timeout`, and a subscriber that fails or stalls is
/// dropped rather than retried. Waiting for a subscriber's lane is bounded
/// by the same timeout; if the poller is mid-send, the push is deferred. Delivery here is best effort; the poller is
/// the backstop.
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Fan `message` out to the registry.
    ///
    /// `previous` is the id that preceded `message` in the log, as returned
    /// by the store's append.
    pub fn fan_out(&self, message: &Message, previous: MessageId) -> FanOutReport {
        let mut report = FanOutReport::default();

        for subscriber in self.registry.snapshot() {
            if subscriber.state() != SessionState::Active || subscriber.cursor() >= message.id {
                report.skipped += 1;
                continue;
            }

            match subscriber.try_deliver(message, previous, self.send_timeout) {
                Ok(Delivery::Sent) => report.delivered += 1,
                Ok(Delivery::AlreadyDelivered) => report.skipped += 1,
                Ok(outcome @ (Delivery::Gap | Delivery::Busy)) => {
                    tracing::debug!(
                        subscriber = %subscriber.id(),
                        cursor = %subscriber.cursor(),
                        message_id = %message.id,
                        ?outcome,
                        "Push deferred to poller"
                    );
                    report.deferred += 1;
                }
                Err(e) => {
                    self.registry.drop_failed(&subscriber, &e);
                    report.dropped += 1;
                }
            }
        }

        tracing::debug!(
            message_id = %message.id,
            delivered = report.delivered,
            skipped = report.skipped,
            deferred = report.deferred,
            dropped = report.dropped,
            "Fan-out complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::stream::event::StreamEvent;
    use crate::stream::sink::{channel, Sink};
    use crate::types::{AuthorId, Timestamp};

    const TIMEOUT: Duration = Duration::from_millis(20);

    fn message(id: u64) -> Message {
        Message {
            id: MessageId(id),
            author_id: AuthorId(1),
            display_name: "t".into(),
            body: format!("m{}", id),
            created_at: Timestamp(0),
        }
    }

    struct DeadSink;

    impl Sink for DeadSink {
        fn send(&self, _event: StreamEvent, _timeout: Duration) -> Result<(), DeliveryError> {
            Err(DeliveryError::Closed)
        }
    }

    #[test]
    fn test_fan_out_to_caught_up_subscribers() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let (sink, stream) = channel(8);
        let sub = registry.register(MessageId(4), Box::new(sink));
        sub.activate();

        let report = broadcaster.fan_out(&message(5), MessageId(4));
        assert_eq!(report.delivered, 1);
        assert_eq!(sub.cursor(), MessageId(5));
        assert_eq!(stream.drain(), vec![StreamEvent::Message(message(5))]);

        // Same message again is a no-op.
        let report = broadcaster.fan_out(&message(5), MessageId(4));
        assert_eq!(report.skipped, 1);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_fan_out_defers_on_gap() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let (sink, stream) = channel(8);
        let sub = registry.register(MessageId(2), Box::new(sink));
        sub.activate();

        let report = broadcaster.fan_out(&message(5), MessageId(4));
        assert_eq!(report.deferred, 1);
        assert_eq!(sub.cursor(), MessageId(2));
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_fan_out_skips_connecting() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let (sink, stream) = channel(8);
        registry.register(MessageId::ZERO, Box::new(sink));

        let report = broadcaster.fan_out(&message(1), MessageId::ZERO);
        assert_eq!(report.skipped, 1);
        assert!(stream.drain().is_empty());
    }

    #[test]
    fn test_failed_sink_is_unregistered() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let dead = registry.register(MessageId::ZERO, Box::new(DeadSink));
        dead.activate();
        let (sink, stream) = channel(8);
        let live = registry.register(MessageId::ZERO, Box::new(sink));
        live.activate();

        let report = broadcaster.fan_out(&message(1), MessageId::ZERO);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(dead.state(), SessionState::Errored);
        assert_eq!(dead.cursor(), MessageId::ZERO);

        let remaining: Vec<_> = registry.snapshot().iter().map(|s| s.id()).collect();
        assert_eq!(remaining, vec![live.id()]);
        assert_eq!(stream.drain().len(), 1);
    }

    #[test]
    fn test_stalled_subscriber_is_dropped() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let (sink, _stream) = channel(1);
        let sub = registry.register(MessageId::ZERO, Box::new(sink));
        sub.activate();

        assert_eq!(broadcaster.fan_out(&message(1), MessageId::ZERO).delivered, 1);
        // Buffer is full and nobody drains it.
        let report = broadcaster.fan_out(&message(2), MessageId(1));
        assert_eq!(report.dropped, 1);
        assert!(registry.is_empty());
        assert_eq!(sub.cursor(), MessageId(1));
    }

    /// Sink that takes a while to accept anything.
    struct SlowSink(Duration);

    impl Sink for SlowSink {
        fn send(&self, _event: StreamEvent, _timeout: Duration) -> Result<(), DeliveryError> {
            std::thread::sleep(self.0);
            Ok(())
        }
    }

    #[test]
    fn test_busy_lane_defers_instead_of_waiting() {
        let registry = Arc::new(SubscriberRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);

        let sub = registry.register(MessageId::ZERO, Box::new(SlowSink(TIMEOUT * 10)));
        sub.activate();

        std::thread::scope(|s| {
            // A ping in flight holds the lane.
            let pinger = s.spawn(|| sub.send_control(StreamEvent::Ping, TIMEOUT));
            std::thread::sleep(TIMEOUT);

            let start = std::time::Instant::now();
            let report = broadcaster.fan_out(&message(1), MessageId::ZERO);
            assert!(start.elapsed() < TIMEOUT * 5);
            assert_eq!(report.deferred, 1);
            assert_eq!(report.dropped, 0);

            pinger.join().unwrap().unwrap();
        });

        assert_eq!(sub.state(), SessionState::Active);
        assert_eq!(sub.cursor(), MessageId::ZERO);
    }
}
