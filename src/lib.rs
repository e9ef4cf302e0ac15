//! # Chat Fan-out
//!
//! Real-time delivery of a shared, append-only message log to any number of
//! long-lived streaming connections.
//!
//! ## Core Concepts
//!
//! - **Log**: Append-only, ordered by a store-assigned id
//! - **Subscribers**: One per connection, each with its own cursor
//! - **Push**: New messages are fanned out on the writer's thread
//! - **Poll**: A background loop catches up anyone a push missed
//! - **Sessions**: `Connecting → Active → Completed | TimedOut | Errored`
//!
//! ## Example
//!
//! ```ignore
//! use chatfan::{AuthorId, ChatHub, HubConfig, MessageId, StreamEvent};
//!
//! let hub = ChatHub::in_memory(HubConfig::default())?;
//!
//! // A client resuming after message 41
//! let (session, events) = hub.subscribe(MessageId(41))?;
//!
//! // Somebody posts
//! hub.post(AuthorId(1), "alice", "Hello, world!")?;
//!
//! for event in std::iter::from_fn(|| events.recv().ok()) {
//!     match event {
//!         StreamEvent::Message(message) => println!("{}: {}", message.display_name, message.body),
//!         StreamEvent::Connected | StreamEvent::Ping => {}
//!     }
//! }
//! ```

pub mod error;
pub mod hub;
pub mod store;
pub mod stream;
pub mod types;

// Re-exports
pub use error::{DeliveryError, Result, StoreError, StoreResult, StreamError};
pub use hub::{parse_last_id, ChatHub, HubConfig};
pub use store::{LogConfig, MemoryStore, MessageLog, MessageStore};
pub use stream::{
    Broadcaster, ChannelSink, Delivery, EventStream, FanOutReport, Poller, PollerConfig,
    PollerHandle, SessionState, Sink, SseWriter, StreamEvent, StreamSession, Subscriber,
    SubscriberRegistry, TickReport,
};
pub use types::*;
