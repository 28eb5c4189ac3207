//! Command surface for session playback.
//!
//! Resolves queries, routes commands to the per-session actor, and maps a
//! missing or retired session onto [`PlaybackError::NotInSession`].

use std::sync::Arc;

use jukebox_types::{
    ChannelRef, EnqueueReport, LoopMode, NowPlaying, QueueSnapshot, SessionKey, SessionStatus,
    TrackRequest,
};
use tokio::sync::oneshot;

use crate::error::PlaybackError;
use crate::events::EventBus;
use crate::orchestrator::{PlaybackSettings, Reply, SessionCommand, SessionHandle, spawn_session};
use crate::resolver::Resolver;
use crate::session_registry::{DeliveryError, SessionRegistry};
use crate::transport::TransportSink;

const ENQUEUE_DELIVERY_ATTEMPTS: usize = 3;

/// Entry point for every session command.
#[derive(Clone)]
pub struct PlaybackManager {
    registry: Arc<SessionRegistry>,
    resolver: Resolver,
    sink: Arc<dyn TransportSink>,
    events: EventBus,
    settings: PlaybackSettings,
}

impl PlaybackManager {
    pub fn new(resolver: Resolver, sink: Arc<dyn TransportSink>, events: EventBus) -> Self {
        Self::with_settings(resolver, sink, events, PlaybackSettings::default())
    }

    pub fn with_settings(
        resolver: Resolver,
        sink: Arc<dyn TransportSink>,
        events: EventBus,
        settings: PlaybackSettings,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            resolver,
            sink,
            events,
            settings,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Resolve `query` and append the result to the session queue, starting
    /// playback when nothing is active.
    ///
    /// A `stop` that lands while the query is still resolving wins: the
    /// result is discarded and [`PlaybackError::SessionStopped`] is returned.
    pub async fn enqueue(
        &self,
        key: &SessionKey,
        channel: Option<ChannelRef>,
        query: &str,
        requested_by: &str,
    ) -> Result<EnqueueReport, PlaybackError> {
        let channel = channel.ok_or(PlaybackError::NotInSession)?;
        let ticket = self.registry.begin_enqueue(key);
        let tracks = self.resolver.resolve(query, requested_by).await.map_err(|err| {
            tracing::error!(session = %key, query, error = %err, "query did not resolve");
            PlaybackError::from(err)
        })?;
        self.deliver_enqueue(key, channel, tracks, ticket.epoch()).await
    }

    async fn deliver_enqueue(
        &self,
        key: &SessionKey,
        channel: ChannelRef,
        tracks: Vec<TrackRequest>,
        epoch: u64,
    ) -> Result<EnqueueReport, PlaybackError> {
        for attempt in 1..=ENQUEUE_DELIVERY_ATTEMPTS {
            let (reply, rx) = oneshot::channel();
            let cmd = SessionCommand::Enqueue {
                tracks: tracks.clone(),
                channel: channel.clone(),
                reply,
            };
            match self
                .registry
                .deliver_if_current(key, epoch, || self.spawn(key), cmd)
            {
                Ok(()) => {}
                Err(DeliveryError::Stale) => {
                    tracing::info!(session = %key, "discarding enqueue for stopped session");
                    return Err(PlaybackError::SessionStopped);
                }
                Err(DeliveryError::Absent) => continue,
            }
            match rx.await {
                Ok(result) => return result,
                // The actor retired with this command still in its mailbox.
                Err(_) => {
                    tracing::debug!(session = %key, attempt, "session retired before enqueue; retrying");
                }
            }
        }
        Err(PlaybackError::NotInSession)
    }

    fn spawn(&self, key: &SessionKey) -> SessionHandle {
        tracing::info!(session = %key, "starting session");
        spawn_session(
            key.clone(),
            self.sink.clone(),
            self.events.clone(),
            self.settings.clone(),
        )
    }

    async fn request<T>(
        &self,
        key: &SessionKey,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, PlaybackError> {
        let handle = self.registry.get(key).ok_or(PlaybackError::NotInSession)?;
        handle
            .request(build)
            .await
            .map_err(|_| PlaybackError::NotInSession)?
    }

    /// Pending tracks, loop mode and now-playing. Empty when no session is live.
    pub async fn list_queue(&self, key: &SessionKey) -> Result<QueueSnapshot, PlaybackError> {
        match self.request(key, |reply| SessionCommand::List { reply }).await {
            Err(PlaybackError::NotInSession) => Ok(QueueSnapshot::default()),
            other => other,
        }
    }

    /// Remove the pending track at 1-based `position`.
    pub async fn remove_at(
        &self,
        key: &SessionKey,
        position: usize,
    ) -> Result<TrackRequest, PlaybackError> {
        self.request(key, |reply| SessionCommand::RemoveAt { position, reply })
            .await
    }

    /// Shuffle pending tracks; returns how many were shuffled.
    pub async fn shuffle(&self, key: &SessionKey) -> Result<usize, PlaybackError> {
        self.request(key, |reply| SessionCommand::Shuffle { reply }).await
    }

    pub async fn set_loop_mode(
        &self,
        key: &SessionKey,
        mode: LoopMode,
    ) -> Result<LoopMode, PlaybackError> {
        self.request(key, |reply| SessionCommand::SetLoopMode { mode, reply })
            .await
    }

    /// Force the current track to end; returns the skipped track.
    pub async fn skip(&self, key: &SessionKey) -> Result<TrackRequest, PlaybackError> {
        self.request(key, |reply| SessionCommand::Skip { reply }).await
    }

    pub async fn pause(&self, key: &SessionKey) -> Result<(), PlaybackError> {
        self.request(key, |reply| SessionCommand::Pause { reply }).await
    }

    pub async fn resume(&self, key: &SessionKey) -> Result<(), PlaybackError> {
        self.request(key, |reply| SessionCommand::Resume { reply }).await
    }

    /// Clear the queue, disconnect and retire the session. The next enqueue
    /// starts a fresh session with loop mode off.
    ///
    /// Also cancels enqueues whose query is still resolving.
    pub async fn stop(&self, key: &SessionKey) -> Result<(), PlaybackError> {
        let (reply, rx) = oneshot::channel();
        match self
            .registry
            .deliver_stop(key, SessionCommand::Stop { reply })
        {
            Ok(()) => {}
            Err(DeliveryError::Absent) | Err(DeliveryError::Stale) => {
                return Err(PlaybackError::NotInSession);
            }
        }
        match rx.await {
            Ok(result) => result,
            // Went idle on its own before the stop was read.
            Err(_) => Ok(()),
        }
    }

    pub async fn now_playing(&self, key: &SessionKey) -> Result<Option<NowPlaying>, PlaybackError> {
        match self
            .request(key, |reply| SessionCommand::NowPlaying { reply })
            .await
        {
            Err(PlaybackError::NotInSession) => Ok(None),
            other => other,
        }
    }

    /// Snapshot of one live session.
    pub async fn status(&self, key: &SessionKey) -> Option<SessionStatus> {
        self.request(key, |reply| SessionCommand::Status { reply })
            .await
            .ok()
    }

    /// Snapshots of every live session, ordered by key.
    pub async fn sessions(&self) -> Vec<SessionStatus> {
        let mut statuses = Vec::new();
        for handle in self.registry.sessions() {
            if let Ok(Ok(status)) = handle
                .request(|reply| SessionCommand::Status { reply })
                .await
            {
                statuses.push(status);
            }
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use jukebox_types::{PlaybackEndReason, SessionPhase};
    use tokio::sync::{Notify, broadcast};

    use crate::events::SessionEvent;
    use crate::resolver::{Lookup, LookupEntry, ResolveBackend, ResolveError};
    use crate::transport::{CompletionCallback, SinkHandle, TransportError};

    #[derive(Default)]
    struct FakeState {
        connects: Vec<ChannelRef>,
        handles: Vec<String>,
        disconnect_calls: Vec<String>,
        moves: Vec<ChannelRef>,
        attempts: Vec<String>,
        plays: Vec<String>,
        disconnects: usize,
        connected: HashSet<String>,
        pending: Option<CompletionCallback>,
        paused: bool,
        failing: HashSet<String>,
    }

    #[derive(Default)]
    struct FakeSink {
        state: Mutex<FakeState>,
    }

    impl FakeSink {
        fn fail_stream(&self, stream_ref: &str) {
            self.state.lock().unwrap().failing.insert(stream_ref.to_string());
        }

        /// End the active track the way a real stream would.
        fn finish(&self, error: Option<TransportError>) {
            let callback = self.state.lock().unwrap().pending.take();
            if let Some(callback) = callback {
                callback(error);
            }
        }

        /// Lose every connection without telling the sessions.
        fn drop_transport(&self) {
            self.state.lock().unwrap().connected.clear();
        }

        fn handles(&self) -> Vec<String> {
            self.state.lock().unwrap().handles.clone()
        }

        fn disconnect_calls(&self) -> Vec<String> {
            self.state.lock().unwrap().disconnect_calls.clone()
        }

        fn plays(&self) -> Vec<String> {
            self.state.lock().unwrap().plays.clone()
        }

        fn attempts(&self) -> usize {
            self.state.lock().unwrap().attempts.len()
        }

        fn disconnects(&self) -> usize {
            self.state.lock().unwrap().disconnects
        }

        fn connects(&self) -> Vec<ChannelRef> {
            self.state.lock().unwrap().connects.clone()
        }

        fn moves(&self) -> Vec<ChannelRef> {
            self.state.lock().unwrap().moves.clone()
        }
    }

    #[async_trait]
    impl TransportSink for FakeSink {
        async fn connect(
            &self,
            session: &SessionKey,
            channel: &ChannelRef,
        ) -> Result<SinkHandle, TransportError> {
            let handle = SinkHandle::new(session);
            let mut state = self.state.lock().unwrap();
            state.connects.push(channel.clone());
            state.handles.push(handle.id().to_string());
            state.connected.insert(handle.id().to_string());
            Ok(handle)
        }

        async fn move_to(
            &self,
            _handle: &SinkHandle,
            channel: &ChannelRef,
        ) -> Result<(), TransportError> {
            self.state.lock().unwrap().moves.push(channel.clone());
            Ok(())
        }

        async fn play(
            &self,
            handle: &SinkHandle,
            stream_ref: &str,
            on_complete: CompletionCallback,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.attempts.push(stream_ref.to_string());
            if !state.connected.contains(handle.id()) {
                return Err(TransportError::NotConnected);
            }
            if state.failing.contains(stream_ref) {
                return Err(TransportError::StreamOpen("403 forbidden".to_string()));
            }
            state.plays.push(stream_ref.to_string());
            state.pending = Some(on_complete);
            state.paused = false;
            Ok(())
        }

        fn pause(&self, _handle: &SinkHandle) -> Result<(), TransportError> {
            self.state.lock().unwrap().paused = true;
            Ok(())
        }

        fn resume(&self, _handle: &SinkHandle) -> Result<(), TransportError> {
            self.state.lock().unwrap().paused = false;
            Ok(())
        }

        fn stop(&self, _handle: &SinkHandle) -> Result<(), TransportError> {
            self.finish(None);
            Ok(())
        }

        async fn disconnect(&self, handle: &SinkHandle) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.disconnect_calls.push(handle.id().to_string());
            if !state.connected.remove(handle.id()) {
                return Err(TransportError::NotConnected);
            }
            state.disconnects += 1;
            Ok(())
        }

        fn is_playing(&self, _handle: &SinkHandle) -> bool {
            let state = self.state.lock().unwrap();
            state.pending.is_some() && !state.paused
        }

        fn is_paused(&self, _handle: &SinkHandle) -> bool {
            let state = self.state.lock().unwrap();
            state.pending.is_some() && state.paused
        }

        fn is_connected(&self, handle: &SinkHandle) -> bool {
            self.state.lock().unwrap().connected.contains(handle.id())
        }
    }

    /// `playlist:a,b,c` yields a flat collection, anything else a single track.
    struct StaticBackend;

    fn entry(name: &str) -> LookupEntry {
        LookupEntry {
            stream_ref: Some(format!("stream:{name}")),
            page_ref: Some(format!("page:{name}")),
            title: Some(name.to_string()),
            duration_secs: Some(180),
            flat: false,
        }
    }

    #[async_trait]
    impl ResolveBackend for StaticBackend {
        async fn lookup(&self, query: &str) -> Result<Lookup, ResolveError> {
            if query == "missing" {
                return Err(ResolveError::NoResults);
            }
            match query.strip_prefix("playlist:") {
                Some(names) => Ok(Lookup::Collection(
                    names
                        .split(',')
                        .map(|name| LookupEntry {
                            stream_ref: None,
                            flat: true,
                            ..entry(name)
                        })
                        .collect(),
                )),
                None => Ok(Lookup::Single(entry(query))),
            }
        }

        async fn lookup_entry(&self, flat: &LookupEntry) -> Result<LookupEntry, ResolveError> {
            let name = flat.title.clone().unwrap_or_default();
            Ok(entry(&name))
        }
    }

    /// Blocks the first-stage lookup until released.
    struct GatedBackend {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ResolveBackend for GatedBackend {
        async fn lookup(&self, query: &str) -> Result<Lookup, ResolveError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(Lookup::Single(entry(query)))
        }

        async fn lookup_entry(&self, flat: &LookupEntry) -> Result<LookupEntry, ResolveError> {
            Ok(flat.clone())
        }
    }

    fn manager_with(settings: PlaybackSettings) -> (PlaybackManager, Arc<FakeSink>) {
        let sink = Arc::new(FakeSink::default());
        let manager = PlaybackManager::with_settings(
            Resolver::new(Arc::new(StaticBackend)),
            sink.clone(),
            EventBus::new(),
            settings,
        );
        (manager, sink)
    }

    fn manager() -> (PlaybackManager, Arc<FakeSink>) {
        manager_with(PlaybackSettings::default())
    }

    fn key() -> SessionKey {
        SessionKey::new("guild-1")
    }

    fn channel(name: &str) -> Option<ChannelRef> {
        Some(ChannelRef::new(name))
    }

    /// Round-trip through the actor so earlier commands and callbacks are processed.
    async fn settle(manager: &PlaybackManager) {
        let _ = manager.status(&key()).await;
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<SessionEvent>,
        wanted: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(err) => panic!("event stream closed: {err}"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn titles(snapshot: &QueueSnapshot) -> Vec<String> {
        snapshot
            .pending
            .iter()
            .map(|t| t.title().to_string())
            .collect()
    }

    #[tokio::test]
    async fn enqueue_without_channel_is_rejected() {
        let (manager, sink) = manager();
        let err = manager.enqueue(&key(), None, "song", "alice").await.unwrap_err();
        assert_eq!(err, PlaybackError::NotInSession);
        assert!(sink.connects().is_empty());
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_query_creates_no_session() {
        let (manager, sink) = manager();
        let err = manager
            .enqueue(&key(), channel("voice"), "missing", "alice")
            .await
            .unwrap_err();
        assert_eq!(err, PlaybackError::NoResults);
        assert!(sink.connects().is_empty());
        assert!(!manager.registry().contains(&key()));
    }

    #[tokio::test]
    async fn single_track_plays_then_session_goes_idle() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();

        let report = manager
            .enqueue(&key(), channel("voice"), "song-a", "alice")
            .await
            .expect("enqueue");
        assert_eq!(report.added, vec!["song-a"]);
        assert!(report.started_playback);

        settle(&manager).await;
        assert_eq!(sink.plays(), vec!["stream:song-a"]);
        let now = manager.now_playing(&key()).await.expect("now playing");
        let now = now.expect("a track is playing");
        assert_eq!(now.track.title(), "song-a");
        assert_eq!(now.queue_position_at_start, 1);

        sink.finish(None);
        let ended = wait_for(&mut events, |e| matches!(e, SessionEvent::TrackEnded { .. })).await;
        assert!(matches!(
            ended,
            SessionEvent::TrackEnded {
                reason: PlaybackEndReason::Eof,
                ..
            }
        ));
        wait_for(&mut events, |e| matches!(e, SessionEvent::SessionIdle { .. })).await;

        // A late duplicate finds nothing to act on.
        sink.finish(None);
        assert_eq!(sink.disconnects(), 1);
        assert!(!manager.registry().contains(&key()));
        assert_eq!(manager.now_playing(&key()).await, Ok(None));
    }

    #[tokio::test]
    async fn enqueue_after_idle_starts_a_fresh_session() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();
        manager
            .enqueue(&key(), channel("voice"), "first", "alice")
            .await
            .expect("enqueue");
        settle(&manager).await;
        sink.finish(None);
        wait_for(&mut events, |e| matches!(e, SessionEvent::SessionIdle { .. })).await;

        let report = manager
            .enqueue(&key(), channel("voice"), "second", "alice")
            .await
            .expect("enqueue");
        assert!(report.started_playback);
        settle(&manager).await;
        assert_eq!(sink.plays(), vec!["stream:first", "stream:second"]);
        assert_eq!(sink.connects().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_batches_are_not_interleaved() {
        let (manager, _sink) = manager();
        let k = key();
        let (playlist, single) = tokio::join!(
            manager.enqueue(&k, channel("voice"), "playlist:p1,p2,p3", "alice"),
            manager.enqueue(&k, channel("voice"), "solo", "bob"),
        );
        assert_eq!(playlist.expect("playlist").added, vec!["p1", "p2", "p3"]);
        single.expect("single");

        let snapshot = manager.list_queue(&k).await.expect("list");
        let mut order: Vec<String> = snapshot
            .now_playing
            .iter()
            .map(|n| n.track.title().to_string())
            .collect();
        order.extend(titles(&snapshot));

        let start = order.iter().position(|t| t == "p1").expect("p1 queued");
        assert_eq!(order[start..start + 3].to_vec(), vec!["p1", "p2", "p3"]);
        assert_eq!(order.len(), 4);
    }

    #[tokio::test]
    async fn song_loop_replays_until_turned_off() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();
        manager
            .enqueue(&key(), channel("voice"), "anthem", "alice")
            .await
            .expect("enqueue");
        manager
            .set_loop_mode(&key(), LoopMode::Song)
            .await
            .expect("loop");

        for _ in 0..2 {
            settle(&manager).await;
            sink.finish(None);
        }
        settle(&manager).await;
        manager
            .set_loop_mode(&key(), LoopMode::Off)
            .await
            .expect("loop off");
        sink.finish(None);

        wait_for(&mut events, |e| matches!(e, SessionEvent::SessionIdle { .. })).await;
        assert_eq!(sink.plays().len(), 3);
        assert!(sink.plays().iter().all(|s| s == "stream:anthem"));
    }

    #[tokio::test]
    async fn queue_loop_rotates_the_whole_queue() {
        let (manager, sink) = manager();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b", "alice")
            .await
            .expect("enqueue");
        manager
            .set_loop_mode(&key(), LoopMode::Queue)
            .await
            .expect("loop");

        for _ in 0..3 {
            settle(&manager).await;
            sink.finish(None);
        }
        settle(&manager).await;

        assert_eq!(
            sink.plays(),
            vec!["stream:a", "stream:b", "stream:a", "stream:b"]
        );
        let snapshot = manager.list_queue(&key()).await.expect("list");
        assert_eq!(titles(&snapshot), vec!["a"]);
        manager.stop(&key()).await.expect("stop");
    }

    #[tokio::test]
    async fn skip_in_song_loop_advances() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b", "alice")
            .await
            .expect("enqueue");
        manager
            .set_loop_mode(&key(), LoopMode::Song)
            .await
            .expect("loop");

        let skipped = manager.skip(&key()).await.expect("skip");
        assert_eq!(skipped.title(), "a");
        let ended = wait_for(&mut events, |e| matches!(e, SessionEvent::TrackEnded { .. })).await;
        assert!(matches!(
            ended,
            SessionEvent::TrackEnded {
                reason: PlaybackEndReason::Stopped,
                ..
            }
        ));

        settle(&manager).await;
        assert_eq!(sink.plays(), vec!["stream:a", "stream:b"]);
        let snapshot = manager.list_queue(&key()).await.expect("list");
        assert!(snapshot.pending.is_empty());
    }

    #[tokio::test]
    async fn skip_with_nothing_playing_is_an_error() {
        let (manager, _sink) = manager();
        assert_eq!(manager.skip(&key()).await, Err(PlaybackError::NotInSession));
    }

    #[tokio::test]
    async fn remove_at_checks_bounds() {
        let (manager, _sink) = manager();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b,c", "alice")
            .await
            .expect("enqueue");

        assert_eq!(
            manager.remove_at(&key(), 0).await,
            Err(PlaybackError::InvalidPosition { position: 0, len: 2 })
        );
        assert_eq!(
            manager.remove_at(&key(), 3).await,
            Err(PlaybackError::InvalidPosition { position: 3, len: 2 })
        );
        let removed = manager.remove_at(&key(), 2).await.expect("remove");
        assert_eq!(removed.title(), "c");

        let snapshot = manager.list_queue(&key()).await.expect("list");
        assert_eq!(titles(&snapshot), vec!["b"]);
        assert_eq!(
            snapshot.now_playing.map(|n| n.track.title().to_string()),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn shuffle_keeps_current_and_all_pending() {
        let (manager, _sink) = manager();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b,c,d", "alice")
            .await
            .expect("enqueue");

        assert_eq!(manager.shuffle(&key()).await, Ok(3));

        let snapshot = manager.list_queue(&key()).await.expect("list");
        let mut pending = titles(&snapshot);
        pending.sort();
        assert_eq!(pending, vec!["b", "c", "d"]);
        assert_eq!(
            snapshot.now_playing.map(|n| n.track.title().to_string()),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn shuffle_with_empty_queue_reports_it() {
        let (manager, _sink) = manager();
        manager
            .enqueue(&key(), channel("voice"), "only", "alice")
            .await
            .expect("enqueue");
        assert_eq!(manager.shuffle(&key()).await, Err(PlaybackError::QueueEmpty));
    }

    #[tokio::test]
    async fn stop_clears_everything_and_ignores_late_completion() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b", "alice")
            .await
            .expect("enqueue");
        manager
            .set_loop_mode(&key(), LoopMode::Queue)
            .await
            .expect("loop");

        manager.stop(&key()).await.expect("stop");
        let cleared = wait_for(&mut events, |e| {
            matches!(
                e,
                SessionEvent::QueueChanged { queue_len: 0, .. } | SessionEvent::SessionStopped { .. }
            )
        })
        .await;
        assert_eq!(
            cleared,
            SessionEvent::QueueChanged {
                session: key(),
                queue_len: 0
            }
        );
        wait_for(&mut events, |e| matches!(e, SessionEvent::SessionStopped { .. })).await;

        sink.finish(None);
        assert_eq!(sink.plays(), vec!["stream:a"]);
        assert_eq!(sink.disconnects(), 1);
        assert!(manager.sessions().await.is_empty());
        assert_eq!(manager.stop(&key()).await, Err(PlaybackError::NotInSession));

        // The next enqueue starts from an empty queue with loop mode off.
        let report = manager
            .enqueue(&key(), channel("voice"), "c", "alice")
            .await
            .expect("enqueue");
        assert!(report.started_playback);
        assert_eq!(report.queue_len, 1);
        let snapshot = manager.list_queue(&key()).await.expect("list");
        assert!(snapshot.pending.is_empty());
        assert_eq!(snapshot.loop_mode, LoopMode::Off);
        assert_eq!(
            snapshot.now_playing.map(|n| n.track.title().to_string()),
            Some("c".to_string())
        );
    }

    #[tokio::test]
    async fn reconnect_releases_dropped_transport() {
        let (manager, sink) = manager();
        manager
            .enqueue(&key(), channel("voice"), "first", "alice")
            .await
            .expect("enqueue");
        sink.drop_transport();

        let report = manager
            .enqueue(&key(), channel("voice"), "second", "alice")
            .await
            .expect("enqueue");
        assert!(!report.started_playback);
        manager.stop(&key()).await.expect("stop");

        let handles = sink.handles();
        assert_eq!(handles.len(), 2);
        assert_ne!(handles[0], handles[1]);
        assert_eq!(sink.disconnect_calls(), handles);
        assert_eq!(sink.disconnects(), 1);
    }

    #[tokio::test]
    async fn stop_cancels_enqueue_still_resolving() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let sink = Arc::new(FakeSink::default());
        let manager = PlaybackManager::new(
            Resolver::new(Arc::new(GatedBackend {
                started: started.clone(),
                release: release.clone(),
            })),
            sink.clone(),
            EventBus::new(),
        );

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .enqueue(&key(), channel("voice"), "slow", "alice")
                    .await
            }
        });
        started.notified().await;
        assert_eq!(manager.stop(&key()).await, Err(PlaybackError::NotInSession));
        release.notify_one();

        let result = pending.await.expect("join");
        assert_eq!(result, Err(PlaybackError::SessionStopped));
        assert!(sink.connects().is_empty());
        assert!(!manager.registry().contains(&key()));
    }

    #[tokio::test]
    async fn failing_streams_are_dropped_then_session_idles() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();
        for name in ["x", "y", "z"] {
            sink.fail_stream(&format!("stream:{name}"));
        }

        let report = manager
            .enqueue(&key(), channel("voice"), "playlist:x,y,z", "alice")
            .await
            .expect("enqueue");
        assert_eq!(report.queue_len, 3);

        wait_for(&mut events, |e| matches!(e, SessionEvent::SessionIdle { .. })).await;
        assert_eq!(sink.attempts(), 3);
        assert!(sink.plays().is_empty());
        assert_eq!(sink.disconnects(), 1);
    }

    #[tokio::test]
    async fn failure_cap_abandons_remaining_queue() {
        let (manager, sink) = manager_with(PlaybackSettings {
            max_consecutive_failures: 2,
        });
        let mut events = manager.events().subscribe();
        for name in ["a", "b", "c", "d"] {
            sink.fail_stream(&format!("stream:{name}"));
        }

        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b,c,d", "alice")
            .await
            .expect("enqueue");

        let capped = wait_for(&mut events, |e| {
            matches!(e, SessionEvent::FailureCapReached { .. })
        })
        .await;
        assert_eq!(
            capped,
            SessionEvent::FailureCapReached {
                session: key(),
                failures: 2
            }
        );
        wait_for(&mut events, |e| matches!(e, SessionEvent::SessionIdle { .. })).await;
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.disconnects(), 1);
    }

    #[tokio::test]
    async fn failure_in_one_session_leaves_others_untouched() {
        let (manager, sink) = manager_with(PlaybackSettings {
            max_consecutive_failures: 2,
        });
        let mut events = manager.events().subscribe();
        let healthy = SessionKey::new("guild-2");
        manager
            .enqueue(&healthy, channel("stage"), "playlist:keep,next", "bob")
            .await
            .expect("enqueue");
        manager
            .set_loop_mode(&healthy, LoopMode::Queue)
            .await
            .expect("loop");

        for name in ["x", "y", "z"] {
            sink.fail_stream(&format!("stream:{name}"));
        }
        manager
            .enqueue(&key(), channel("voice"), "playlist:x,y,z", "alice")
            .await
            .expect("enqueue");
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::FailureCapReached { session, .. } if *session == key())
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, SessionEvent::SessionIdle { session } if *session == key())
        })
        .await;
        assert!(!manager.registry().contains(&key()));
        assert_eq!(sink.disconnects(), 1);

        let snapshot = manager.list_queue(&healthy).await.expect("list");
        assert_eq!(titles(&snapshot), vec!["next"]);
        assert_eq!(snapshot.loop_mode, LoopMode::Queue);
        assert_eq!(
            snapshot.now_playing.map(|n| n.track.title().to_string()),
            Some("keep".to_string())
        );
        let status = manager.status(&healthy).await.expect("status");
        assert_eq!(status.phase, SessionPhase::Playing);
        assert!(status.connected);

        sink.finish(None);
        let _ = manager.status(&healthy).await;
        assert_eq!(sink.plays(), vec!["stream:keep", "stream:next"]);
    }

    #[tokio::test]
    async fn mid_stream_error_moves_on_to_next_track() {
        let (manager, sink) = manager();
        let mut events = manager.events().subscribe();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b", "alice")
            .await
            .expect("enqueue");
        settle(&manager).await;

        sink.finish(Some(TransportError::Stream("connection reset".to_string())));
        wait_for(&mut events, |e| matches!(e, SessionEvent::TrackFailed { .. })).await;
        settle(&manager).await;

        assert_eq!(sink.plays(), vec!["stream:a", "stream:b"]);
        let status = manager.status(&key()).await.expect("status");
        assert_eq!(status.phase, SessionPhase::Playing);
        assert_eq!(status.queue_len, 0);
    }

    #[tokio::test]
    async fn stale_completion_does_not_advance() {
        let (manager, sink) = manager();
        manager
            .enqueue(&key(), channel("voice"), "playlist:a,b,c", "alice")
            .await
            .expect("enqueue");
        settle(&manager).await;
        sink.finish(None);
        settle(&manager).await;

        // Replay the first track's completion while the second is playing.
        let handle = manager.registry().get(&key()).expect("session");
        assert!(
            handle
                .send(SessionCommand::TrackEnded {
                    play_id: 1,
                    error: None
                })
                .is_ok()
        );
        settle(&manager).await;

        assert_eq!(sink.plays(), vec!["stream:a", "stream:b"]);
        let now = manager.now_playing(&key()).await.expect("now playing");
        assert_eq!(now.map(|n| n.track.title().to_string()), Some("b".to_string()));
    }

    #[tokio::test]
    async fn pause_and_resume_follow_sink_state() {
        let (manager, _sink) = manager();
        assert_eq!(manager.pause(&key()).await, Err(PlaybackError::NotInSession));

        manager
            .enqueue(&key(), channel("voice"), "song", "alice")
            .await
            .expect("enqueue");
        assert_eq!(manager.resume(&key()).await, Err(PlaybackError::NotPaused));
        manager.pause(&key()).await.expect("pause");
        assert_eq!(manager.pause(&key()).await, Err(PlaybackError::NothingPlaying));
        assert!(manager.status(&key()).await.expect("status").paused);
        manager.resume(&key()).await.expect("resume");
    }

    #[tokio::test]
    async fn enqueue_from_another_channel_moves_transport() {
        let (manager, sink) = manager();
        manager
            .enqueue(&key(), channel("lobby"), "first", "alice")
            .await
            .expect("enqueue");
        let report = manager
            .enqueue(&key(), channel("stage"), "second", "bob")
            .await
            .expect("enqueue");
        assert!(!report.started_playback);
        assert_eq!(report.queue_len, 1);

        assert_eq!(sink.connects(), vec![ChannelRef::new("lobby")]);
        assert_eq!(sink.moves(), vec![ChannelRef::new("stage")]);
        let status = manager.status(&key()).await.expect("status");
        assert_eq!(status.channel, Some(ChannelRef::new("stage")));
    }

    #[tokio::test]
    async fn sessions_lists_live_sessions_in_key_order() {
        let (manager, _sink) = manager();
        for name in ["guild-b", "guild-a"] {
            manager
                .enqueue(&SessionKey::new(name), channel("voice"), "song", "alice")
                .await
                .expect("enqueue");
        }
        let keys: Vec<String> = manager
            .sessions()
            .await
            .into_iter()
            .map(|s| s.session.to_string())
            .collect();
        assert_eq!(keys, vec!["guild-a", "guild-b"]);
    }
}
