//! Fan-out of the message log to streaming subscribers.
//!
//! Two delivery paths feed each subscriber:
//!
//! - [`Broadcaster`]: pushes a message on the writer's thread right after
//!   it is appended. Fast, best effort.
//! - [`Poller`]: a single background loop that re-queries the store past
//!   each subscriber's cursor once per interval, and sends `ping` when
//!   there is nothing new. Slow, but it never misses.
//!
//! Both go through the subscriber's delivery lane and cursor CAS, so a
//! message is handed to a given sink at most once and always in id order.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(SubscriberRegistry::new());
//! let (sink, events) = sink::channel(256);
//!
//! let session = StreamSession::open(&store, registry.clone(), MessageId(0), Box::new(sink), timeout, Some(255))?;
//!
//! while let Ok(event) = events.recv() {
//!     write_frame(event.to_sse()?)?;
//! }
//! ```

mod broadcaster;
mod event;
mod poller;
mod registry;
mod session;
pub mod sink;

pub use broadcaster::{Broadcaster, FanOutReport};
pub use event::{SessionState, StreamEvent, CONNECTED_PAYLOAD};
pub use poller::{Poller, PollerConfig, PollerHandle, TickReport};
pub use registry::{Delivery, Subscriber, SubscriberRegistry};
pub use session::StreamSession;
pub use sink::{ChannelSink, EventStream, Sink, SseWriter};
