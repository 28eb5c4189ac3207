use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of one community's playback session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Opaque reference to the live channel a session streams into.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(transparent)]
pub struct ChannelRef(String);

impl ChannelRef {
    pub fn new(channel: impl Into<String>) -> Self {
        Self(channel.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolved, immutable description of one playable item.
///
/// Built only through [`TrackRequest::new`], which refuses entries without a
/// stream reference, so a queue never holds placeholder entries. Deserializing
/// goes through the same check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(try_from = "TrackRequestFields")]
pub struct TrackRequest {
    stream_ref: String,
    title: String,
    duration_secs: u64,
    requested_by: String,
}

impl TrackRequest {
    /// Build a track request.
    ///
    /// Returns `None` when `stream_ref` is blank. A blank title becomes `Untitled`.
    pub fn new(
        stream_ref: impl Into<String>,
        title: impl Into<String>,
        duration_secs: u64,
        requested_by: impl Into<String>,
    ) -> Option<Self> {
        let stream_ref = stream_ref.into();
        if stream_ref.trim().is_empty() {
            return None;
        }
        let title = title.into();
        let title = if title.trim().is_empty() {
            "Untitled".to_string()
        } else {
            title
        };
        Some(Self {
            stream_ref,
            title,
            duration_secs,
            requested_by: requested_by.into(),
        })
    }

    /// Locator the transport sink opens.
    pub fn stream_ref(&self) -> &str {
        &self.stream_ref
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Duration in seconds; `0` when unknown.
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    pub fn requested_by(&self) -> &str {
        &self.requested_by
    }
}

#[derive(Deserialize)]
struct TrackRequestFields {
    stream_ref: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration_secs: u64,
    #[serde(default)]
    requested_by: String,
}

impl TryFrom<TrackRequestFields> for TrackRequest {
    type Error = &'static str;

    fn try_from(fields: TrackRequestFields) -> Result<Self, Self::Error> {
        TrackRequest::new(
            fields.stream_ref,
            fields.title,
            fields.duration_secs,
            fields.requested_by,
        )
        .ok_or("stream_ref must not be blank")
    }
}

/// Re-insertion policy applied to a track once it finishes playing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// No re-insertion.
    #[default]
    Off,
    /// Re-insert at the front of the queue.
    Song,
    /// Re-insert at the back of the queue.
    Queue,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::Off => "off",
            LoopMode::Song => "song",
            LoopMode::Queue => "queue",
        }
    }
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason why a track stopped streaming.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PlaybackEndReason {
    /// Natural end of stream.
    Eof,
    /// Stream open, decode, or transport error interrupted playback.
    Error,
    /// Playback was cut short by a skip.
    Stopped,
}

/// Orchestrator state of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No queue and no transport connection.
    #[default]
    Idle,
    /// Attempting to start the next queued track.
    Draining,
    /// Transport is streaming a track.
    Playing,
    /// Explicitly stopped; terminal for this session instance.
    Stopped,
}

/// Ephemeral record of the track a session is streaming.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct NowPlaying {
    pub track: TrackRequest,
    /// Tracks queued (including this one) when it was dequeued.
    pub queue_position_at_start: usize,
    /// Wall-clock start in unix milliseconds.
    pub started_at_ms: i64,
}

impl NowPlaying {
    /// Estimated elapsed playback, clamped to the known duration.
    ///
    /// Not an authoritative position: pauses and buffering are not accounted for.
    pub fn elapsed_ms(&self, now_ms: i64) -> u64 {
        let elapsed = now_ms.saturating_sub(self.started_at_ms).max(0) as u64;
        match self.track.duration_secs() {
            0 => elapsed,
            secs => elapsed.min(secs.saturating_mul(1000)),
        }
    }
}

/// Read-only copy of a session's queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct QueueSnapshot {
    /// Upcoming tracks in play order.
    pub pending: Vec<TrackRequest>,
    pub loop_mode: LoopMode,
    pub now_playing: Option<NowPlaying>,
}

/// Session-level state exposed to the command surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionStatus {
    pub session: SessionKey,
    pub phase: SessionPhase,
    pub loop_mode: LoopMode,
    /// Number of upcoming tracks.
    pub queue_len: usize,
    pub now_playing: Option<NowPlaying>,
    /// `true` when the transport reports a paused stream.
    pub paused: bool,
    /// `true` when the transport holds a live connection.
    pub connected: bool,
    /// Channel the transport is connected to, if any.
    pub channel: Option<ChannelRef>,
}

/// Result of a successful enqueue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct EnqueueReport {
    /// Titles appended, in queue order.
    pub added: Vec<String>,
    /// `true` when the session was idle and playback was started.
    pub started_playback: bool,
    /// Upcoming queue length after the append.
    pub queue_len: usize,
}
