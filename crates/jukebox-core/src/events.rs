//! In-process event bus for session updates.
//!
//! Lets the command surface observe playback without polling the orchestrator.

use jukebox_types::{PlaybackEndReason, SessionKey};
use tokio::sync::broadcast;

/// Session event payloads published by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    QueueChanged {
        session: SessionKey,
        queue_len: usize,
    },
    TrackStarted {
        session: SessionKey,
        title: String,
    },
    TrackEnded {
        session: SessionKey,
        title: String,
        reason: PlaybackEndReason,
    },
    TrackFailed {
        session: SessionKey,
        title: String,
        error: String,
    },
    /// Too many consecutive failures; the session gave up and went idle.
    FailureCapReached {
        session: SessionKey,
        failures: u32,
    },
    SessionIdle {
        session: SessionKey,
    },
    SessionStopped {
        session: SessionKey,
    },
}

impl SessionEvent {
    pub fn session(&self) -> &SessionKey {
        match self {
            SessionEvent::QueueChanged { session, .. }
            | SessionEvent::TrackStarted { session, .. }
            | SessionEvent::TrackEnded { session, .. }
            | SessionEvent::TrackFailed { session, .. }
            | SessionEvent::FailureCapReached { session, .. }
            | SessionEvent::SessionIdle { session }
            | SessionEvent::SessionStopped { session } => session,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
