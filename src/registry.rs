//! Authoritative registry of active stream sessions.
//!
//! Membership in the registry is the definition of "stream is active". Only
//! the registry inserts or removes sessions; the concurrency cap is enforced
//! with owned semaphore permits so that concurrent registrations can never
//! push the count past the maximum.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::reaper;
use crate::supervisor::{ExitEvent, ProcessHandle, StopMode};

/// Capacity reservation for one session. Dropping it frees the slot.
pub type StreamSlot = OwnedSemaphorePermit;

#[derive(Debug)]
pub enum RegistryError {
    CapacityExceeded,
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::CapacityExceeded => write!(f, "maximum concurrent streams reached"),
            RegistryError::NotFound(id) => write!(f, "stream not found: {}", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// One active loop-streaming instance.
#[derive(Debug)]
pub struct Session {
    stream_id: String,
    handle: ProcessHandle,
    output_path: PathBuf,
    input_path: PathBuf,
    started_at: SystemTime,
    // Held for the session's lifetime; released on unregister.
    _slot: StreamSlot,
}

impl Session {
    pub fn new(
        stream_id: String,
        handle: ProcessHandle,
        output_path: PathBuf,
        input_path: PathBuf,
        slot: StreamSlot,
    ) -> Self {
        Self {
            stream_id,
            handle,
            output_path,
            input_path,
            started_at: SystemTime::now(),
            _slot: slot,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.output_path
    }
}

/// Point-in-time snapshot of a session, safe to hand to HTTP handlers.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub stream_id: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub output_path: PathBuf,
    pub input_path: PathBuf,
    pub started_at: SystemTime,
}

pub struct StreamRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl StreamRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().expect("session map lock poisoned")
    }

    /// Reserve a capacity slot before doing any expensive setup. Fails
    /// immediately when all slots are taken.
    pub fn try_reserve(&self) -> Result<StreamSlot, RegistryError> {
        self.slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| RegistryError::CapacityExceeded)
    }

    /// Insert a session. The session already carries its slot, so the insert
    /// itself cannot exceed capacity.
    pub fn register(&self, session: Session) {
        let mut sessions = self.lock();
        let replaced = sessions.insert(session.stream_id.clone(), session);
        debug_assert!(replaced.is_none(), "stream id collision");
    }

    /// Remove a session if present. Idempotent: a second call for the same id
    /// returns None and changes nothing.
    pub fn unregister(&self, stream_id: &str) -> Option<Session> {
        self.lock().remove(stream_id)
    }

    pub fn get(&self, stream_id: &str) -> Option<SessionInfo> {
        let sessions = self.lock();
        sessions.get(stream_id).map(|s| SessionInfo {
            stream_id: s.stream_id.clone(),
            pid: s.handle.pid(),
            alive: s.handle.is_alive(),
            output_path: s.output_path.clone(),
            input_path: s.input_path.clone(),
            started_at: s.started_at,
        })
    }

    /// Map of stream id to playlist URL, restricted to sessions whose
    /// process is still running. An entry whose process exited but has not
    /// been reconciled yet is excluded.
    pub fn list_active(&self) -> BTreeMap<String, String> {
        let sessions = self.lock();
        sessions
            .values()
            .filter(|s| s.handle.is_alive())
            .map(|s| {
                (
                    s.stream_id.clone(),
                    format!("/output/{}/index.m3u8", s.stream_id),
                )
            })
            .collect()
    }

    /// Stop one session: remove it, request graceful termination, and delete
    /// its filesystem artifacts. Returns once termination has been requested;
    /// it does not wait out the kill grace period.
    pub async fn stop_one(&self, stream_id: &str) -> Result<(), RegistryError> {
        let session = self
            .unregister(stream_id)
            .ok_or_else(|| RegistryError::NotFound(stream_id.to_owned()))?;
        session.handle.stop(StopMode::Graceful);
        reaper::reap_session(&session.output_path, &session.input_path).await;
        tracing::info!(stream = %stream_id, "stream stopped");
        Ok(())
    }

    /// Stop every current session. The map is drained in one critical
    /// section, so a registration racing with the sweep either lands before
    /// the drain (and is stopped) or after (and stays tracked) - it is never
    /// left untracked.
    pub async fn stop_all(&self, mode: StopMode) -> Vec<String> {
        let drained: Vec<Session> = {
            let mut sessions = self.lock();
            sessions.drain().map(|(_, s)| s).collect()
        };

        let mut stopped = Vec::with_capacity(drained.len());
        for session in drained {
            session.handle.stop(mode);
            reaper::reap_session(&session.output_path, &session.input_path).await;
            stopped.push(session.stream_id);
        }
        if !stopped.is_empty() {
            tracing::info!("stopped {} stream(s)", stopped.len());
        }
        stopped
    }

    /// Consume transcoder exit events and drop the matching sessions. Runs
    /// until the sending side is gone.
    pub async fn run_reconciler(
        self: Arc<Self>,
        mut exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    ) {
        while let Some(event) = exit_rx.recv().await {
            if let Some(session) = self.unregister(&event.stream_id) {
                tracing::info!(
                    stream = %event.stream_id,
                    "reaping session after transcoder exit ({:?})",
                    event.status
                );
                reaper::reap_session(&session.output_path, &session.input_path).await;
            }
        }
    }
}
