//! Per-session playback state machine.
//!
//! Each session runs as one actor task that owns its [`QueueState`] and the
//! transport connection. Commands and completion callbacks arrive on a single
//! mailbox and are processed strictly in order, so at most one advance runs per
//! session and queue mutations never interleave with a dequeue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use jukebox_types::{
    ChannelRef, EnqueueReport, LoopMode, NowPlaying, PlaybackEndReason, QueueSnapshot,
    SessionKey, SessionPhase, SessionStatus, TrackRequest,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::PlaybackError;
use crate::events::{EventBus, SessionEvent};
use crate::queue_state::QueueState;
use crate::transport::{CompletionCallback, SinkHandle, TransportError, TransportSink};

const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Tunables for the drain loop.
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    /// Failed tracks in a row before a session gives up and goes idle.
    pub max_consecutive_failures: u32,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, PlaybackError>>;

/// Messages accepted by a session actor.
pub(crate) enum SessionCommand {
    Enqueue {
        tracks: Vec<TrackRequest>,
        channel: ChannelRef,
        reply: Reply<EnqueueReport>,
    },
    List {
        reply: Reply<QueueSnapshot>,
    },
    RemoveAt {
        position: usize,
        reply: Reply<TrackRequest>,
    },
    Shuffle {
        reply: Reply<usize>,
    },
    SetLoopMode {
        mode: LoopMode,
        reply: Reply<LoopMode>,
    },
    Skip {
        reply: Reply<TrackRequest>,
    },
    Pause {
        reply: Reply<()>,
    },
    Resume {
        reply: Reply<()>,
    },
    Stop {
        reply: Reply<()>,
    },
    NowPlaying {
        reply: Reply<Option<NowPlaying>>,
    },
    Status {
        reply: Reply<SessionStatus>,
    },
    /// Completion signal for the play attempt tagged `play_id`.
    TrackEnded {
        play_id: u64,
        error: Option<TransportError>,
    },
}

/// The actor retired before answering; its mailbox is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Retired;

/// Mailbox address of a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    key: SessionKey,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// `true` once the actor has torn the session down.
    pub fn is_retired(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn send(&self, cmd: SessionCommand) -> Result<(), SessionCommand> {
        self.tx.send(cmd).map_err(|err| err.0)
    }

    pub(crate) async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<Result<T, PlaybackError>, Retired> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).map_err(|_| Retired)?;
        rx.await.map_err(|_| Retired)
    }
}

/// Start a session actor and return its handle.
pub(crate) fn spawn_session(
    key: SessionKey,
    sink: Arc<dyn TransportSink>,
    events: EventBus,
    settings: PlaybackSettings,
) -> SessionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = SessionActor {
        key: key.clone(),
        sink,
        events,
        settings,
        queue: QueueState::new(),
        phase: SessionPhase::Idle,
        connection: None,
        active: None,
        next_play_id: 0,
        consecutive_failures: 0,
        tx: tx.clone(),
    };
    tokio::spawn(actor.run(rx));
    SessionHandle { key, tx }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct Connection {
    handle: SinkHandle,
    channel: ChannelRef,
}

struct ActivePlay {
    play_id: u64,
    track: TrackRequest,
    skip_requested: bool,
}

enum Flow {
    Continue,
    Idle,
    Stop(Reply<()>),
}

struct SessionActor {
    key: SessionKey,
    sink: Arc<dyn TransportSink>,
    events: EventBus,
    settings: PlaybackSettings,
    queue: QueueState,
    phase: SessionPhase,
    connection: Option<Connection>,
    active: Option<ActivePlay>,
    next_play_id: u64,
    consecutive_failures: u32,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        tracing::debug!(session = %self.key, "session actor started");
        while let Some(cmd) = rx.recv().await {
            match self.handle(cmd).await {
                Flow::Continue => {}
                Flow::Idle => {
                    rx.close();
                    self.teardown_idle().await;
                    break;
                }
                Flow::Stop(reply) => {
                    rx.close();
                    self.teardown_stopped().await;
                    let _ = reply.send(Ok(()));
                    break;
                }
            }
        }
        tracing::debug!(session = %self.key, phase = ?self.phase, "session actor exited");
    }

    async fn handle(&mut self, cmd: SessionCommand) -> Flow {
        match cmd {
            SessionCommand::Enqueue {
                tracks,
                channel,
                reply,
            } => self.enqueue(tracks, channel, reply).await,
            SessionCommand::List { reply } => {
                let _ = reply.send(Ok(self.queue.snapshot()));
                Flow::Continue
            }
            SessionCommand::RemoveAt { position, reply } => {
                let result = self.queue.remove_at(position).map_err(PlaybackError::from);
                if let Ok(track) = result.as_ref() {
                    tracing::debug!(session = %self.key, position, title = %track.title(), "removed from queue");
                    self.publish_queue_changed();
                }
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionCommand::Shuffle { reply } => {
                let result = self.queue.shuffle().map_err(PlaybackError::from);
                if result.is_ok() {
                    self.publish_queue_changed();
                }
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionCommand::SetLoopMode { mode, reply } => {
                self.queue.set_loop_mode(mode);
                tracing::info!(session = %self.key, mode = %mode, "loop mode set");
                let _ = reply.send(Ok(mode));
                Flow::Continue
            }
            SessionCommand::Skip { reply } => {
                let _ = reply.send(self.skip());
                Flow::Continue
            }
            SessionCommand::Pause { reply } => {
                let _ = reply.send(self.pause());
                Flow::Continue
            }
            SessionCommand::Resume { reply } => {
                let _ = reply.send(self.resume());
                Flow::Continue
            }
            SessionCommand::Stop { reply } => Flow::Stop(reply),
            SessionCommand::NowPlaying { reply } => {
                let _ = reply.send(Ok(self.queue.current().cloned()));
                Flow::Continue
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
                Flow::Continue
            }
            SessionCommand::TrackEnded { play_id, error } => self.track_ended(play_id, error).await,
        }
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    async fn enqueue(
        &mut self,
        tracks: Vec<TrackRequest>,
        channel: ChannelRef,
        reply: Reply<EnqueueReport>,
    ) -> Flow {
        if tracks.is_empty() {
            let _ = reply.send(Err(PlaybackError::NoResults));
            return if self.is_idle() { Flow::Idle } else { Flow::Continue };
        }
        if let Err(err) = self.ensure_connected(&channel).await {
            tracing::warn!(session = %self.key, channel = %channel, error = %err, "transport connect failed");
            let _ = reply.send(Err(err.into()));
            return if self.is_idle() { Flow::Idle } else { Flow::Continue };
        }

        let added: Vec<String> = tracks.iter().map(|t| t.title().to_string()).collect();
        self.queue.enqueue_all(tracks);
        tracing::info!(session = %self.key, added = ?added, "added to queue");
        self.publish_queue_changed();

        let start = self.active.is_none();
        let _ = reply.send(Ok(EnqueueReport {
            added,
            started_playback: start,
            queue_len: self.queue.len(),
        }));
        if start {
            return self.drain().await;
        }
        Flow::Continue
    }

    async fn ensure_connected(&mut self, channel: &ChannelRef) -> Result<(), TransportError> {
        if let Some(conn) = self.connection.as_mut() {
            if self.sink.is_connected(&conn.handle) {
                if &conn.channel != channel {
                    self.sink.move_to(&conn.handle, channel).await?;
                    tracing::info!(session = %self.key, from = %conn.channel, to = %channel, "moved transport");
                    conn.channel = channel.clone();
                }
                return Ok(());
            }
            tracing::warn!(session = %self.key, handle = %conn.handle, "transport dropped; reconnecting");
            self.disconnect().await;
        }
        let handle = self.sink.connect(&self.key, channel).await?;
        tracing::info!(session = %self.key, channel = %channel, handle = %handle, "transport connected");
        self.connection = Some(Connection {
            handle,
            channel: channel.clone(),
        });
        Ok(())
    }

    async fn track_ended(&mut self, play_id: u64, error: Option<TransportError>) -> Flow {
        let active = match self.active.take() {
            Some(active) if active.play_id == play_id => active,
            other => {
                self.active = other;
                tracing::debug!(session = %self.key, play_id, "ignoring stale completion");
                return Flow::Continue;
            }
        };
        let title = active.track.title().to_string();
        match error {
            Some(err) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    session = %self.key,
                    title = %title,
                    error = %err,
                    failures = self.consecutive_failures,
                    "track failed mid-stream"
                );
                self.events.publish(SessionEvent::TrackFailed {
                    session: self.key.clone(),
                    title: title.clone(),
                    error: err.to_string(),
                });
                self.events.publish(SessionEvent::TrackEnded {
                    session: self.key.clone(),
                    title,
                    reason: PlaybackEndReason::Error,
                });
            }
            None => {
                self.consecutive_failures = 0;
                let reason = if active.skip_requested {
                    PlaybackEndReason::Stopped
                } else {
                    PlaybackEndReason::Eof
                };
                // A skipped track is not replayed, but still rotates in queue loop.
                let requeue = !active.skip_requested || self.queue.loop_mode() == LoopMode::Queue;
                if requeue && self.queue.requeue_finished(active.track).is_some() {
                    self.publish_queue_changed();
                }
                tracing::debug!(session = %self.key, title = %title, reason = ?reason, "track ended");
                self.events.publish(SessionEvent::TrackEnded {
                    session: self.key.clone(),
                    title,
                    reason,
                });
            }
        }
        self.drain().await
    }

    /// Start the next playable track, dropping tracks whose stream fails to open.
    async fn drain(&mut self) -> Flow {
        self.phase = SessionPhase::Draining;
        loop {
            if self.consecutive_failures >= self.settings.max_consecutive_failures {
                tracing::warn!(
                    session = %self.key,
                    failures = self.consecutive_failures,
                    dropped = self.queue.len(),
                    "too many consecutive failures; going idle"
                );
                self.events.publish(SessionEvent::FailureCapReached {
                    session: self.key.clone(),
                    failures: self.consecutive_failures,
                });
                if self.queue.clear() > 0 {
                    self.publish_queue_changed();
                }
                return Flow::Idle;
            }
            let position_at_start = self.queue.len();
            let Some(track) = self.queue.dequeue_next() else {
                return Flow::Idle;
            };
            let Some(handle) = self.connection.as_ref().map(|c| c.handle.clone()) else {
                tracing::warn!(session = %self.key, "no transport connection; going idle");
                return Flow::Idle;
            };

            self.next_play_id += 1;
            let play_id = self.next_play_id;
            let tx = self.tx.clone();
            let session = self.key.clone();
            let on_complete: CompletionCallback = Box::new(move |error| {
                if tx.send(SessionCommand::TrackEnded { play_id, error }).is_err() {
                    tracing::debug!(session = %session, play_id, "ignoring completion for retired session");
                }
            });

            match self.sink.play(&handle, track.stream_ref(), on_complete).await {
                Ok(()) => {
                    let title = track.title().to_string();
                    tracing::info!(session = %self.key, title = %title, play_id, "now playing");
                    self.queue.set_current(NowPlaying {
                        track: track.clone(),
                        queue_position_at_start: position_at_start,
                        started_at_ms: now_ms(),
                    });
                    self.active = Some(ActivePlay {
                        play_id,
                        track,
                        skip_requested: false,
                    });
                    self.phase = SessionPhase::Playing;
                    self.events.publish(SessionEvent::TrackStarted {
                        session: self.key.clone(),
                        title,
                    });
                    self.publish_queue_changed();
                    return Flow::Continue;
                }
                Err(err) => {
                    let failure = PlaybackError::StreamOpenFailure {
                        title: track.title().to_string(),
                        reason: err.to_string(),
                    };
                    tracing::warn!(session = %self.key, error = %failure, "dropping track");
                    self.events.publish(SessionEvent::TrackFailed {
                        session: self.key.clone(),
                        title: track.title().to_string(),
                        error: failure.to_string(),
                    });
                    if err == TransportError::NotConnected {
                        return Flow::Idle;
                    }
                    self.consecutive_failures += 1;
                }
            }
        }
    }

    fn active_handle(&self) -> Option<&SinkHandle> {
        self.active.as_ref()?;
        self.connection.as_ref().map(|c| &c.handle)
    }

    fn skip(&mut self) -> Result<TrackRequest, PlaybackError> {
        let handle = self
            .active_handle()
            .cloned()
            .ok_or(PlaybackError::NothingPlaying)?;
        self.sink.stop(&handle)?;
        let active = self.active.as_mut().ok_or(PlaybackError::NothingPlaying)?;
        active.skip_requested = true;
        tracing::info!(session = %self.key, title = %active.track.title(), "skip requested");
        Ok(active.track.clone())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        let handle = self.active_handle().ok_or(PlaybackError::NothingPlaying)?;
        if !self.sink.is_playing(handle) {
            return Err(PlaybackError::NothingPlaying);
        }
        self.sink.pause(handle)?;
        tracing::info!(session = %self.key, "paused");
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        let handle = self.active_handle().ok_or(PlaybackError::NotPaused)?;
        if !self.sink.is_paused(handle) {
            return Err(PlaybackError::NotPaused);
        }
        self.sink.resume(handle)?;
        tracing::info!(session = %self.key, "resumed");
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        let (paused, connected) = match self.connection.as_ref() {
            Some(conn) => (
                self.sink.is_paused(&conn.handle),
                self.sink.is_connected(&conn.handle),
            ),
            None => (false, false),
        };
        SessionStatus {
            session: self.key.clone(),
            phase: self.phase,
            loop_mode: self.queue.loop_mode(),
            queue_len: self.queue.len(),
            now_playing: self.queue.current().cloned(),
            paused,
            connected,
            channel: self.connection.as_ref().map(|c| c.channel.clone()),
        }
    }

    fn publish_queue_changed(&self) {
        self.events.publish(SessionEvent::QueueChanged {
            session: self.key.clone(),
            queue_len: self.queue.len(),
        });
    }

    async fn disconnect(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        match self.sink.disconnect(&conn.handle).await {
            Ok(()) => {}
            Err(TransportError::NotConnected) => {
                tracing::debug!(session = %self.key, "transport already disconnected");
            }
            Err(err) => {
                tracing::warn!(session = %self.key, error = %err, "transport disconnect failed");
            }
        }
    }

    async fn teardown_idle(&mut self) {
        self.disconnect().await;
        self.queue.clear_current();
        self.phase = SessionPhase::Idle;
        tracing::info!(session = %self.key, "queue finished; session idle");
        self.events.publish(SessionEvent::SessionIdle {
            session: self.key.clone(),
        });
    }

    async fn teardown_stopped(&mut self) {
        // Completions already in flight no longer match an active play.
        self.active = None;
        if self.queue.clear() > 0 {
            self.publish_queue_changed();
        }
        if let Some(conn) = self.connection.as_ref() {
            if let Err(err) = self.sink.stop(&conn.handle) {
                tracing::debug!(session = %self.key, error = %err, "stop on teardown failed");
            }
        }
        self.disconnect().await;
        self.queue.clear_current();
        self.phase = SessionPhase::Stopped;
        tracing::info!(session = %self.key, "session stopped");
        self.events.publish(SessionEvent::SessionStopped {
            session: self.key.clone(),
        });
    }
}
