//! Outbound event sink
//!
//! A thin wrapper over an unbounded Tokio mpsc channel. Publishing never
//! blocks, so delivery can happen while the coordinator holds its lock.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::types::OutboundEvent;

/// Error type for event sink operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("Event receiver closed, dropped {0} event")]
    Closed(&'static str),
}

/// Result type for event sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// Shared reference to EventSink
pub type SharedEventSink = Arc<EventSink>;

/// Receiving half handed to the transport layer.
pub type EventReceiver = mpsc::UnboundedReceiver<OutboundEvent>;

#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<OutboundEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the transport layer drains.
    pub fn channel() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Create a shared reference to this sink
    pub fn shared(self) -> SharedEventSink {
        Arc::new(self)
    }

    pub fn publish(&self, event: OutboundEvent) -> SinkResult<()> {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(()) => {
                debug!(event_type, "Event published");
                Ok(())
            }
            Err(_) => {
                warn!(event_type, "Event receiver closed, event dropped");
                Err(SinkError::Closed(event_type))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
