//! Per-session queue state.
//!
//! Pure data: the pending track list, loop mode, and now-playing record.
//! Owned by exactly one session actor, so no locking happens here.

use std::collections::VecDeque;

use jukebox_types::{LoopMode, NowPlaying, QueueSnapshot, TrackRequest};
use rand::Rng;
use rand::seq::SliceRandom;

/// Errors returned by queue mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("invalid position {position}: queue has {len} track(s)")]
    InvalidPosition { position: usize, len: usize },
    #[error("the queue is empty")]
    Empty,
}

#[derive(Debug, Default)]
pub struct QueueState {
    pending: VecDeque<TrackRequest>,
    loop_mode: LoopMode,
    current: Option<NowPlaying>,
}

impl QueueState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one track.
    pub fn enqueue(&mut self, track: TrackRequest) {
        self.pending.push_back(track);
    }

    /// Append a batch in its original order.
    pub fn enqueue_all(&mut self, tracks: impl IntoIterator<Item = TrackRequest>) -> usize {
        let before = self.pending.len();
        self.pending.extend(tracks);
        self.pending.len() - before
    }

    /// Pop the front track without applying loop policy.
    pub fn dequeue_next(&mut self) -> Option<TrackRequest> {
        self.pending.pop_front()
    }

    /// Re-insert a track that finished playing according to the loop mode.
    ///
    /// Song puts it back at the front, Queue at the back. Returns the mode applied.
    pub fn requeue_finished(&mut self, track: TrackRequest) -> Option<LoopMode> {
        match self.loop_mode {
            LoopMode::Off => None,
            LoopMode::Song => {
                self.pending.push_front(track);
                Some(LoopMode::Song)
            }
            LoopMode::Queue => {
                self.pending.push_back(track);
                Some(LoopMode::Queue)
            }
        }
    }

    /// Copy of the pending tracks in play order.
    pub fn peek_all(&self) -> Vec<TrackRequest> {
        self.pending.iter().cloned().collect()
    }

    /// Remove the track at a 1-based position.
    ///
    /// Bounds are checked against the length at call time; out of range leaves
    /// the queue untouched.
    pub fn remove_at(&mut self, position: usize) -> Result<TrackRequest, QueueError> {
        let len = self.pending.len();
        if position == 0 || position > len {
            return Err(QueueError::InvalidPosition { position, len });
        }
        self.pending
            .remove(position - 1)
            .ok_or(QueueError::InvalidPosition { position, len })
    }

    /// Uniformly permute the pending tracks. The current track is not part of `pending`.
    pub fn shuffle(&mut self) -> Result<usize, QueueError> {
        self.shuffle_with(&mut rand::rng())
    }

    pub fn shuffle_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<usize, QueueError> {
        if self.pending.is_empty() {
            return Err(QueueError::Empty);
        }
        self.pending.make_contiguous().shuffle(rng);
        Ok(self.pending.len())
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        self.loop_mode = mode;
    }

    /// Drop every pending track.
    pub fn clear(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn current(&self) -> Option<&NowPlaying> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, now_playing: NowPlaying) {
        self.current = Some(now_playing);
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.peek_all(),
            loop_mode: self.loop_mode,
            now_playing: self.current.clone(),
        }
    }
}
