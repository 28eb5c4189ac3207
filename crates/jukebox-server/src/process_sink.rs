//! Process-backed transport sink.
//!
//! Each connection owns a long-lived output process that publishes PCM from
//! its stdin into the channel. Each track spawns a decoder process whose
//! stdout is pumped into that stdin until EOF, stop, or failure.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jukebox_core::{CompletionCallback, SinkHandle, TransportError, TransportSink};
use jukebox_types::{ChannelRef, SessionKey};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::SinkConfig;

const PUMP_CHUNK: usize = 16 * 1024;

type OutputSlot = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

struct Playback {
    id: u64,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

struct Connection {
    session: SessionKey,
    output: Child,
    stdin: OutputSlot,
    playback: Option<Playback>,
}

/// [`TransportSink`] that drives external decoder and output processes.
#[derive(Clone)]
pub struct ProcessSink {
    config: SinkConfig,
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    next_play: Arc<std::sync::atomic::AtomicU64>,
}

impl ProcessSink {
    pub fn new(config: SinkConfig) -> Self {
        Self {
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_play: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.connections.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn with_playback<T>(&self, handle: &SinkHandle, f: impl FnOnce(&Playback) -> T) -> Option<T> {
        let guard = self.lock();
        guard
            .get(handle.id())
            .and_then(|conn| conn.playback.as_ref())
            .map(f)
    }

    fn spawn_output(
        &self,
        session: &SessionKey,
        channel: &ChannelRef,
    ) -> Result<(Child, ChildStdin), TransportError> {
        let argv = render(&self.config.output, "", channel.as_str(), session.as_str());
        let mut child = command(&argv)
            .map_err(TransportError::Connect)?
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Connect(format!("spawn {}: {e}", argv[0])))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Connect("output process has no stdin".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr, "output", session.clone());
        }
        Ok((child, stdin))
    }
}

/// Substitute `{stream}`, `{channel}` and `{session}` in each argument.
fn render(template: &[String], stream: &str, channel: &str, session: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{stream}", stream)
                .replace("{channel}", channel)
                .replace("{session}", session)
        })
        .collect()
}

fn command(argv: &[String]) -> Result<Command, String> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command template".to_string())?;
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);
    Ok(cmd)
}

fn forward_stderr(stderr: ChildStderr, role: &'static str, session: SessionKey) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(session = %session, process = role, "{line}");
        }
    });
}

#[async_trait]
impl TransportSink for ProcessSink {
    async fn connect(
        &self,
        session: &SessionKey,
        channel: &ChannelRef,
    ) -> Result<SinkHandle, TransportError> {
        let (output, stdin) = self.spawn_output(session, channel)?;
        let handle = SinkHandle::new(session);
        tracing::info!(session = %session, channel = %channel, handle = %handle, "output process started");
        self.lock().insert(
            handle.id().to_string(),
            Connection {
                session: session.clone(),
                output,
                stdin: Arc::new(tokio::sync::Mutex::new(Some(stdin))),
                playback: None,
            },
        );
        Ok(handle)
    }

    async fn move_to(&self, handle: &SinkHandle, channel: &ChannelRef) -> Result<(), TransportError> {
        let (session, slot) = {
            let guard = self.lock();
            let conn = guard.get(handle.id()).ok_or(TransportError::NotConnected)?;
            (conn.session.clone(), conn.stdin.clone())
        };
        let (output, stdin) = self.spawn_output(&session, channel)?;
        let old = {
            let mut guard = self.lock();
            let conn = guard.get_mut(handle.id()).ok_or(TransportError::NotConnected)?;
            std::mem::replace(&mut conn.output, output)
        };
        *slot.lock().await = Some(stdin);
        retire_output(old);
        tracing::info!(session = %session, channel = %channel, "output process moved");
        Ok(())
    }

    async fn play(
        &self,
        handle: &SinkHandle,
        stream_ref: &str,
        on_complete: CompletionCallback,
    ) -> Result<(), TransportError> {
        let (session, slot) = {
            let guard = self.lock();
            let conn = guard.get(handle.id()).ok_or(TransportError::NotConnected)?;
            (conn.session.clone(), conn.stdin.clone())
        };
        let argv = render(&self.config.decoder, stream_ref, "", session.as_str());
        let mut decoder = command(&argv)
            .map_err(TransportError::StreamOpen)?
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::StreamOpen(format!("spawn {}: {e}", argv[0])))?;
        let stdout = decoder
            .stdout
            .take()
            .ok_or_else(|| TransportError::StreamOpen("decoder has no stdout".to_string()))?;
        if let Some(stderr) = decoder.stderr.take() {
            forward_stderr(stderr, "decoder", session.clone());
        }

        let id = self.next_play.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
        let (paused, paused_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        {
            let mut guard = self.lock();
            let conn = guard.get_mut(handle.id()).ok_or(TransportError::NotConnected)?;
            if let Some(previous) = conn.playback.replace(Playback {
                id,
                paused,
                cancel: cancel.clone(),
            }) {
                previous.cancel.cancel();
            }
        }

        let connections = self.connections.clone();
        let handle_id = handle.id().to_string();
        tokio::spawn(async move {
            let result = pump(decoder, stdout, slot, paused_rx, cancel).await;
            {
                let mut guard = connections.lock().unwrap_or_else(|err| err.into_inner());
                if let Some(conn) = guard.get_mut(&handle_id) {
                    if conn.playback.as_ref().map(|p| p.id) == Some(id) {
                        conn.playback = None;
                    }
                }
            }
            on_complete(result.err());
        });
        Ok(())
    }

    fn pause(&self, handle: &SinkHandle) -> Result<(), TransportError> {
        self.with_playback(handle, |p| p.paused.send_replace(true))
            .map(|_| ())
            .ok_or_else(|| TransportError::Command("nothing is playing".to_string()))
    }

    fn resume(&self, handle: &SinkHandle) -> Result<(), TransportError> {
        self.with_playback(handle, |p| p.paused.send_replace(false))
            .map(|_| ())
            .ok_or_else(|| TransportError::Command("nothing is playing".to_string()))
    }

    fn stop(&self, handle: &SinkHandle) -> Result<(), TransportError> {
        if !self.lock().contains_key(handle.id()) {
            return Err(TransportError::NotConnected);
        }
        self.with_playback(handle, |p| p.cancel.cancel());
        Ok(())
    }

    async fn disconnect(&self, handle: &SinkHandle) -> Result<(), TransportError> {
        let conn = self
            .lock()
            .remove(handle.id())
            .ok_or(TransportError::NotConnected)?;
        if let Some(playback) = conn.playback.as_ref() {
            playback.cancel.cancel();
        }
        conn.stdin.lock().await.take();
        retire_output(conn.output);
        tracing::info!(session = %conn.session, handle = %handle, "output process stopped");
        Ok(())
    }

    fn is_playing(&self, handle: &SinkHandle) -> bool {
        self.with_playback(handle, |p| !*p.paused.borrow())
            .unwrap_or(false)
    }

    fn is_paused(&self, handle: &SinkHandle) -> bool {
        self.with_playback(handle, |p| *p.paused.borrow())
            .unwrap_or(false)
    }

    fn is_connected(&self, handle: &SinkHandle) -> bool {
        let mut guard = self.lock();
        match guard.get_mut(handle.id()) {
            Some(conn) => matches!(conn.output.try_wait(), Ok(None)),
            None => false,
        }
    }
}

fn retire_output(mut child: Child) {
    if let Err(err) = child.start_kill() {
        tracing::debug!(error = %err, "output process already exited");
    }
    tokio::spawn(async move {
        let _ = child.wait().await;
    });
}

/// Copy decoder stdout into the output stdin. `Ok` on EOF or cancellation.
async fn pump(
    mut decoder: Child,
    mut stdout: ChildStdout,
    output: OutputSlot,
    mut paused: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; PUMP_CHUNK];
    let outcome = loop {
        if *paused.borrow_and_update() {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(false),
                changed = paused.changed() => {
                    if changed.is_err() {
                        break Ok(false);
                    }
                    continue;
                }
            }
        }
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(false),
            changed = paused.changed() => {
                if changed.is_err() {
                    break Ok(false);
                }
                continue;
            }
            read = stdout.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break Ok(true),
            Ok(n) => {
                let mut slot = output.lock().await;
                let Some(stdin) = slot.as_mut() else {
                    break Err(TransportError::NotConnected);
                };
                if let Err(err) = stdin.write_all(&buf[..n]).await {
                    break Err(TransportError::Stream(format!("output write failed: {err}")));
                }
            }
            Err(err) => break Err(TransportError::Stream(format!("decoder read failed: {err}"))),
        }
    };

    match outcome {
        Ok(true) => match decoder.wait().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(TransportError::Stream(format!("decoder exited with {status}"))),
            Err(err) => Err(TransportError::Stream(format!("decoder wait failed: {err}"))),
        },
        Ok(false) => {
            let _ = decoder.start_kill();
            let _ = decoder.wait().await;
            Ok(())
        }
        Err(err) => {
            let _ = decoder.start_kill();
            let _ = decoder.wait().await;
            Err(err)
        }
    }
}
