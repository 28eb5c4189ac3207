//! Typed failures returned to the command surface.

use crate::queue_state::QueueError;
use crate::resolver::ResolveError;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaybackError {
    #[error("you must be in a voice channel to use this command")]
    NotInSession,
    #[error("failed to fetch track: {0}")]
    Resolution(String),
    #[error("no results found")]
    NoResults,
    #[error("could not play {title}: {reason}")]
    StreamOpenFailure { title: String, reason: String },
    #[error("invalid position {position}: queue has {len} track(s)")]
    InvalidPosition { position: usize, len: usize },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("nothing is currently playing")]
    NothingPlaying,
    #[error("playback is not paused")]
    NotPaused,
    #[error("the queue is empty")]
    QueueEmpty,
    #[error("playback was stopped before the request finished")]
    SessionStopped,
}

impl From<ResolveError> for PlaybackError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NoResults => PlaybackError::NoResults,
            ResolveError::Backend(msg) => PlaybackError::Resolution(msg),
        }
    }
}

impl From<QueueError> for PlaybackError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InvalidPosition { position, len } => {
                PlaybackError::InvalidPosition { position, len }
            }
            QueueError::Empty => PlaybackError::QueueEmpty,
        }
    }
}
