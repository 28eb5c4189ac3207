//! Session registry.
//!
//! Maps session keys to running session actors. Entries are created on demand
//! and dropped once their actor retires. While an enqueue is resolving, the
//! registry also keeps a stop epoch for its key so work that started before a
//! `stop` cannot land afterwards.

use std::collections::HashMap;
use std::sync::Mutex;

use jukebox_types::SessionKey;

use crate::orchestrator::{SessionCommand, SessionHandle};

/// Enqueues in flight for one key and the stop epoch they are checked against.
#[derive(Default)]
struct PendingEnqueues {
    in_flight: usize,
    stop_epoch: u64,
}

#[derive(Default)]
struct SessionStore {
    by_key: HashMap<SessionKey, SessionHandle>,
    pending: HashMap<SessionKey, PendingEnqueues>,
}

impl SessionStore {
    /// Live handle for `key`, dropping the entry if its actor has retired.
    fn live(&mut self, key: &SessionKey) -> Option<SessionHandle> {
        match self.by_key.get(key) {
            Some(handle) if !handle.is_retired() => Some(handle.clone()),
            Some(_) => {
                self.by_key.remove(key);
                None
            }
            None => None,
        }
    }

    fn epoch(&self, key: &SessionKey) -> u64 {
        self.pending.get(key).map(|p| p.stop_epoch).unwrap_or(0)
    }
}

/// Marks an enqueue as in flight for its key until dropped.
pub(crate) struct EnqueueTicket<'a> {
    registry: &'a SessionRegistry,
    key: SessionKey,
    epoch: u64,
}

impl EnqueueTicket<'_> {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EnqueueTicket<'_> {
    fn drop(&mut self) {
        let mut store = self.registry.lock();
        if let Some(pending) = store.pending.get_mut(&self.key) {
            pending.in_flight = pending.in_flight.saturating_sub(1);
            if pending.in_flight == 0 {
                store.pending.remove(&self.key);
            }
        }
    }
}

/// Why a command could not be handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    /// The session was stopped after the caller captured its epoch.
    Stale,
    /// No live session exists for the key.
    Absent,
}

#[derive(Default)]
pub struct SessionRegistry {
    store: Mutex<SessionStore>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionStore> {
        self.store.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Fetch the live session for `key`.
    pub fn get(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.lock().live(key)
    }

    /// `true` when a live session exists for `key`.
    pub fn contains(&self, key: &SessionKey) -> bool {
        self.get(key).is_some()
    }

    /// Register an enqueue for `key` and capture its current stop epoch.
    pub(crate) fn begin_enqueue(&self, key: &SessionKey) -> EnqueueTicket<'_> {
        let mut store = self.lock();
        let pending = store.pending.entry(key.clone()).or_default();
        pending.in_flight += 1;
        EnqueueTicket {
            registry: self,
            key: key.clone(),
            epoch: pending.stop_epoch,
        }
    }

    /// Live session handles, sorted by key.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        let mut store = self.lock();
        store.by_key.retain(|_, handle| !handle.is_retired());
        let mut handles: Vec<SessionHandle> = store.by_key.values().cloned().collect();
        handles.sort_by(|a, b| a.key().cmp(b.key()));
        handles
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `cmd` to the session for `key`, creating it if needed, unless the
    /// session was stopped since `epoch` was captured.
    ///
    /// Check and send happen under the registry lock, so a concurrent stop is
    /// ordered either entirely before or entirely after this delivery.
    pub(crate) fn deliver_if_current(
        &self,
        key: &SessionKey,
        epoch: u64,
        mut spawn: impl FnMut() -> SessionHandle,
        cmd: SessionCommand,
    ) -> Result<(), DeliveryError> {
        let mut store = self.lock();
        if store.epoch(key) != epoch {
            return Err(DeliveryError::Stale);
        }
        let handle = match store.live(key) {
            Some(handle) => handle,
            None => {
                let handle = spawn();
                store.by_key.insert(key.clone(), handle.clone());
                handle
            }
        };
        if let Err(cmd) = handle.send(cmd) {
            // Retired between the liveness check and the send.
            let fresh = spawn();
            store.by_key.insert(key.clone(), fresh.clone());
            return fresh.send(cmd).map_err(|_| DeliveryError::Absent);
        }
        Ok(())
    }

    /// Invalidate enqueues in flight for `key` and, if a session is live, send
    /// it `cmd`.
    pub(crate) fn deliver_stop(
        &self,
        key: &SessionKey,
        cmd: SessionCommand,
    ) -> Result<(), DeliveryError> {
        let mut store = self.lock();
        if let Some(pending) = store.pending.get_mut(key) {
            pending.stop_epoch += 1;
        }
        let handle = store.live(key).ok_or(DeliveryError::Absent)?;
        handle.send(cmd).map_err(|_| DeliveryError::Absent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn stop_command() -> SessionCommand {
        let (reply, _rx) = oneshot::channel();
        SessionCommand::Stop { reply }
    }

    #[test]
    fn stop_on_absent_session_invalidates_enqueue_in_flight() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("guild-1");
        let ticket = registry.begin_enqueue(&key);
        assert_eq!(ticket.epoch(), 0);

        assert_eq!(
            registry.deliver_stop(&key, stop_command()),
            Err(DeliveryError::Absent)
        );
        let result = registry.deliver_if_current(
            &key,
            ticket.epoch(),
            || panic!("stale delivery must not create a session"),
            stop_command(),
        );
        assert_eq!(result, Err(DeliveryError::Stale));
        assert!(registry.is_empty());

        // A concurrent enqueue for the same key sees the bumped epoch.
        let second = registry.begin_enqueue(&key);
        assert_eq!(second.epoch(), 1);
        assert_eq!(registry.begin_enqueue(&SessionKey::new("guild-2")).epoch(), 0);
    }

    #[test]
    fn epochs_are_dropped_once_no_enqueue_is_in_flight() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("guild-1");
        {
            let _first = registry.begin_enqueue(&key);
            let _second = registry.begin_enqueue(&key);
            let _ = registry.deliver_stop(&key, stop_command());
            assert_eq!(registry.lock().pending.len(), 1);
        }
        assert!(registry.lock().pending.is_empty());

        // Stops with nothing in flight leave no trace.
        for _ in 0..3 {
            let _ = registry.deliver_stop(&key, stop_command());
        }
        assert!(registry.lock().pending.is_empty());
        assert_eq!(registry.begin_enqueue(&key).epoch(), 0);
    }
}
