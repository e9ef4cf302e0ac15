//! Events pushed to streaming subscribers and their wire framing.

use crate::error::DeliveryError;
use crate::types::{Message, MessageId};
use serde::{Deserialize, Serialize};

/// Payload of the `connected` event.
pub const CONNECTED_PAYLOAD: &str = "SSE connection established";

/// One frame on a streaming connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Emitted once, before any message.
    Connected,

    /// A message from the log. Advances the subscriber's cursor.
    Message(Message),

    /// Keep-alive when a poll tick found nothing new. Carries no id.
    Ping,
}

impl StreamEvent {
    /// Event name as it appears on the `event:` line.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected => "connected",
            StreamEvent::Message(_) => "message",
            StreamEvent::Ping => "ping",
        }
    }

    /// Message id carried by this event, if any.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            StreamEvent::Message(message) => Some(message.id),
            _ => None,
        }
    }

    /// Encode as a server-sent-events frame, terminated by a blank line.
    pub fn to_sse(&self) -> Result<String, DeliveryError> {
        let frame = match self {
            StreamEvent::Connected => {
                format!("event: connected\ndata: {}\n\n", CONNECTED_PAYLOAD)
            }
            StreamEvent::Message(message) => {
                let data = serde_json::to_string(message)
                    .map_err(|e| DeliveryError::Encoding(e.to_string()))?;
                format!("id: {}\nevent: message\ndata: {}\n\n", message.id, data)
            }
            StreamEvent::Ping => "event: ping\n: keep-alive\n\n".to_string(),
        };
        Ok(frame)
    }
}

/// Lifecycle of a streaming session.
///
/// `Connecting → Active → {Completed, TimedOut, Errored}`; the last three
/// are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Active = 1,
    Completed = 2,
    TimedOut = 3,
    Errored = 4,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::TimedOut | SessionState::Errored
        )
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Active,
            2 => SessionState::Completed,
            3 => SessionState::TimedOut,
            _ => SessionState::Errored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuthorId, Timestamp};

    #[test]
    fn test_message_frame() {
        let event = StreamEvent::Message(Message {
            id: MessageId(9),
            author_id: AuthorId(2),
            display_name: "bob".into(),
            body: "hi".into(),
            created_at: Timestamp(5),
        });

        let frame = event.to_sse().unwrap();
        assert!(frame.starts_with("id: 9\nevent: message\ndata: {"));
        assert!(frame.contains("\"message\":\"hi\""));
        assert!(frame.ends_with("\n\n"));
        assert_eq!(event.id(), Some(MessageId(9)));
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(
            StreamEvent::Connected.to_sse().unwrap(),
            "event: connected\ndata: SSE connection established\n\n"
        );
        let ping = StreamEvent::Ping.to_sse().unwrap();
        assert!(ping.starts_with("event: ping\n"));
        assert!(!ping.contains("id:"));
        assert_eq!(StreamEvent::Ping.id(), None);
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SessionState::Connecting,
            SessionState::Active,
            SessionState::Completed,
            SessionState::TimedOut,
            SessionState::Errored,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
        assert!(!SessionState::Active.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
    }
}
