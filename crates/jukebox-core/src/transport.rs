//! Transport sink abstraction.
//!
//! Implementations open a stream reference, emit audio into a live channel, and
//! report the end of each track through a completion callback.

use std::fmt;

use async_trait::async_trait;
use jukebox_types::{ChannelRef, SessionKey};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to open stream: {0}")]
    StreamOpen(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("transport command failed: {0}")]
    Command(String),
}

/// End-of-track signal. `None` is a clean end (EOF or stop), `Some` carries the failure.
pub type CompletionCallback = Box<dyn FnOnce(Option<TransportError>) + Send + 'static>;

/// Connection handle issued by [`TransportSink::connect`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SinkHandle {
    id: String,
}

impl SinkHandle {
    /// Fresh handle for a connection owned by `session`.
    pub fn new(session: &SessionKey) -> Self {
        Self {
            id: format!("sink:{session}:{}", Uuid::new_v4()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Audio transport consumed by the orchestrator.
///
/// `play` returns once the stream has started; `on_complete` is the only
/// authoritative end-of-track signal and must fire exactly once per successful
/// `play`, including after `stop`. When `play` returns `Err` the callback is
/// dropped without being invoked.
#[async_trait]
pub trait TransportSink: Send + Sync + 'static {
    async fn connect(
        &self,
        session: &SessionKey,
        channel: &ChannelRef,
    ) -> Result<SinkHandle, TransportError>;
    async fn move_to(&self, handle: &SinkHandle, channel: &ChannelRef)
        -> Result<(), TransportError>;
    async fn play(
        &self,
        handle: &SinkHandle,
        stream_ref: &str,
        on_complete: CompletionCallback,
    ) -> Result<(), TransportError>;
    fn pause(&self, handle: &SinkHandle) -> Result<(), TransportError>;
    fn resume(&self, handle: &SinkHandle) -> Result<(), TransportError>;
    /// Force the active stream to end; its completion callback still fires.
    fn stop(&self, handle: &SinkHandle) -> Result<(), TransportError>;
    async fn disconnect(&self, handle: &SinkHandle) -> Result<(), TransportError>;
    fn is_playing(&self, handle: &SinkHandle) -> bool;
    fn is_paused(&self, handle: &SinkHandle) -> bool;
    fn is_connected(&self, handle: &SinkHandle) -> bool;
}
