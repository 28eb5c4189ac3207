//! HTTP API handlers.
//!
//! Defines the Actix routes for session queue and playback control.

#[path = "health.rs"]
pub mod health_handlers;
pub mod sessions;

use actix_web::HttpResponse;
use jukebox_core::PlaybackError;

pub use health_handlers::{HealthResponse, __path_health, health};
pub use sessions::{
    __path_enqueue, __path_now_playing, __path_pause, __path_queue_list, __path_queue_remove,
    __path_resume, __path_sessions_list, __path_set_loop_mode, __path_shuffle, __path_skip,
    __path_stop, enqueue, now_playing, pause, queue_list, queue_remove, resume, sessions_list,
    set_loop_mode, shuffle, skip, stop,
};

/// Conversion of command failures into HTTP responses.
pub(crate) trait IntoHttpResponse {
    fn into_response(self) -> HttpResponse;
}

impl IntoHttpResponse for PlaybackError {
    fn into_response(self) -> HttpResponse {
        let body = self.to_string();
        match self {
            PlaybackError::InvalidPosition { .. } => HttpResponse::BadRequest().body(body),
            PlaybackError::NoResults => HttpResponse::NotFound().body(body),
            PlaybackError::Resolution(_) | PlaybackError::Transport(_) => {
                HttpResponse::BadGateway().body(body)
            }
            PlaybackError::NotInSession
            | PlaybackError::StreamOpenFailure { .. }
            | PlaybackError::NothingPlaying
            | PlaybackError::NotPaused
            | PlaybackError::QueueEmpty
            | PlaybackError::SessionStopped => HttpResponse::Conflict().body(body),
        }
    }
}
