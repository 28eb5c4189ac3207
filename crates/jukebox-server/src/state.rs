//! Shared application state.

use jukebox_core::PlaybackManager;

/// State handed to every HTTP handler.
pub struct AppState {
    pub playback: PlaybackManager,
}

impl AppState {
    pub fn new(playback: PlaybackManager) -> Self {
        Self { playback }
    }
}
