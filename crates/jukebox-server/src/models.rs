//! API models and OpenAPI schemas.
//!
//! Request and response bodies for the session endpoints. Session data types
//! themselves come from `jukebox-types`.

use jukebox_types::{LoopMode, NowPlaying, SessionStatus, TrackRequest};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Enqueue request for `POST /sessions/{key}/queue`.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct EnqueueRequest {
    /// Free-text search or URL (single item or playlist).
    pub query: String,
    /// Display name of the requester.
    pub requested_by: String,
    /// Live channel the requester is in. Absent means the requester is not in one.
    #[serde(default)]
    pub channel: Option<String>,
}

/// Loop mode update payload.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct LoopModeRequest {
    pub mode: LoopMode,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct LoopModeResponse {
    pub mode: LoopMode,
}

/// Track removed from the queue.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RemovedResponse {
    pub removed: TrackRequest,
}

/// Track that was playing when skip was issued.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SkippedResponse {
    pub skipped: TrackRequest,
}

#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ShuffleResponse {
    /// Number of pending tracks that were shuffled.
    pub shuffled: usize,
}

/// Now-playing record plus an elapsed estimate.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct NowPlayingResponse {
    pub now_playing: Option<NowPlaying>,
    /// Milliseconds since the track started, clamped to its duration.
    pub elapsed_ms: Option<u64>,
}

/// Live sessions ordered by key.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionStatus>,
}
