//! Delivery sinks: where a subscriber's events go.

use super::event::StreamEvent;
use crate::error::DeliveryError;
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

/// Capability to push one event to one connected client.
///
/// A send that cannot complete within `timeout` must fail with
/// [`DeliveryError::Timeout`]; any failure is treated as permanent and the
/// subscriber is dropped.
pub trait Sink: Send + Sync {
    fn send(&self, event: StreamEvent, timeout: Duration) -> Result<(), DeliveryError>;
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn send(&self, event: StreamEvent, timeout: Duration) -> Result<(), DeliveryError> {
        (**self).send(event, timeout)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn send(&self, event: StreamEvent, timeout: Duration) -> Result<(), DeliveryError> {
        (**self).send(event, timeout)
    }
}

/// Create a bounded in-process sink and the stream that drains it.
///
/// When the buffer stays full for longer than the send timeout the
/// subscriber is considered stalled. Dropping the [`EventStream`] is how a
/// transport signals disconnect.
pub fn channel(capacity: usize) -> (ChannelSink, EventStream) {
    let (sender, receiver) = bounded(capacity);
    (ChannelSink { sender }, EventStream { receiver })
}

/// Sink backed by a bounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    sender: Sender<StreamEvent>,
}

impl Sink for ChannelSink {
    fn send(&self, event: StreamEvent, timeout: Duration) -> Result<(), DeliveryError> {
        self.sender.send_timeout(event, timeout).map_err(|e| match e {
            crossbeam_channel::SendTimeoutError::Timeout(_) => DeliveryError::Timeout(timeout),
            crossbeam_channel::SendTimeoutError::Disconnected(_) => DeliveryError::Closed,
        })
    }
}

/// Receiving end of a [`ChannelSink`].
pub struct EventStream {
    receiver: Receiver<StreamEvent>,
}

impl EventStream {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StreamEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StreamEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StreamEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<StreamEvent> {
        self.receiver.try_iter().collect()
    }
}

/// Sink that writes SSE frames straight to a byte stream.
///
/// The send timeout is not enforced here; configure it on the transport
/// (e.g. `TcpStream::set_write_timeout`) so a stalled write surfaces as
/// `TimedOut`/`WouldBlock`.
pub struct SseWriter<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> SseWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> Sink for SseWriter<W> {
    fn send(&self, event: StreamEvent, timeout: Duration) -> Result<(), DeliveryError> {
        let frame = event.to_sse()?;
        let mut writer = self.writer.lock();

        writer
            .write_all(frame.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| match e.kind() {
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                    DeliveryError::Timeout(timeout)
                }
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::WriteZero => DeliveryError::Closed,
                _ => DeliveryError::Io(e),
            })
    }
}
