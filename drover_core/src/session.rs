use crate::process::ProcessHandle;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(SessionId)
    }
}

/// Lifecycle of a session.
///
/// `Initializing -> Running -> {Completed | Failed | TimedOut | Stopped}`.
/// `Paused` is declared for engines able to suspend; `Unknown` is only ever
/// returned by reads for ids the registry does not hold.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Initializing,
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
    Stopped,
    Unknown,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::TimedOut
                | SessionStatus::Stopped
        )
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (_, Unknown) | (_, Initializing) => false,
            (Initializing, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Initializing | Running | Paused, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::TimedOut => "timed-out",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only copy of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub engine: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct SessionEntry {
    record: SessionRecord,
    handle: Option<ProcessHandle>,
    stop_requested: bool,
    terminal_since: Option<Instant>,
}

/// Every in-flight and recently finished session, keyed by id.
///
/// The lock is held only for map updates; process handles are cloned out
/// before they are cancelled.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    retention: Duration,
}

impl SessionRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Registers a new session in `Initializing` and returns its id.
    pub fn create(&self, engine: &str) -> SessionId {
        self.purge_expired();
        let id = SessionId::new();
        let entry = SessionEntry {
            record: SessionRecord {
                id,
                engine: engine.to_string(),
                status: SessionStatus::Initializing,
                created_at: Utc::now(),
                finished_at: None,
            },
            handle: None,
            stop_requested: false,
            terminal_since: None,
        };
        self.sessions.lock().insert(id, entry);
        id
    }

    /// Makes `handle` the session's live process, moving it to `Running`. A
    /// running session swaps its previous, already exited, process for the new
    /// one.
    ///
    /// Returns false when the session was stopped or removed before the process
    /// came up; the caller must then kill the process itself.
    pub fn attach_process(&self, id: SessionId, handle: ProcessHandle) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&id) else {
            return false;
        };
        if entry.stop_requested {
            return false;
        }
        match entry.record.status {
            SessionStatus::Initializing => entry.record.status = SessionStatus::Running,
            SessionStatus::Running => {}
            _ => return false,
        }
        entry.handle = Some(handle);
        true
    }

    /// Records the terminal status and releases the process handle.
    ///
    /// A session already terminal, or one that is gone, is left untouched.
    pub fn finish(&self, id: SessionId, status: SessionStatus) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&id) else {
            return false;
        };
        if !status.is_terminal() || !entry.record.status.can_transition_to(status) {
            return false;
        }
        entry.record.status = status;
        entry.record.finished_at = Some(Utc::now());
        entry.terminal_since = Some(Instant::now());
        entry.handle = None;
        true
    }

    pub fn status(&self, id: SessionId) -> SessionStatus {
        self.purge_expired();
        self.sessions
            .lock()
            .get(&id)
            .map_or(SessionStatus::Unknown, |entry| entry.record.status)
    }

    pub fn record(&self, id: SessionId) -> Option<SessionRecord> {
        self.purge_expired();
        self.sessions.lock().get(&id).map(|entry| entry.record.clone())
    }

    /// Marks the session for stopping and hands back its process, if any, so the
    /// caller can kill it without holding the lock.
    pub fn request_stop(&self, id: SessionId) -> Option<ProcessHandle> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(&id)?;
        if entry.record.status.is_terminal() {
            return None;
        }
        entry.stop_requested = true;
        entry.handle.clone()
    }

    /// True once a stop was requested, or once cleanup removed the session.
    pub fn is_stopping(&self, id: SessionId) -> bool {
        self.sessions
            .lock()
            .get(&id)
            .is_none_or(|entry| entry.stop_requested)
    }

    pub fn stop_requested(&self, id: SessionId) -> bool {
        self.sessions
            .lock()
            .get(&id)
            .is_some_and(|entry| entry.stop_requested)
    }

    /// Live sessions owned by `engine`.
    pub fn live_sessions(&self, engine: &str) -> Vec<SessionId> {
        self.sessions
            .lock()
            .values()
            .filter(|entry| entry.record.engine == engine && !entry.record.status.is_terminal())
            .map(|entry| entry.record.id)
            .collect()
    }

    /// Drops every entry owned by `engine`, returning the handles of those still
    /// running.
    pub fn drain_engine(&self, engine: &str) -> Vec<ProcessHandle> {
        let mut sessions = self.sessions.lock();
        let ids: Vec<SessionId> = sessions
            .values()
            .filter(|entry| entry.record.engine == engine)
            .map(|entry| entry.record.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| sessions.remove(&id))
            .filter_map(|entry| entry.handle)
            .collect()
    }

    pub fn forget(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    /// Removes terminal sessions older than the retention window.
    pub fn purge_expired(&self) {
        let retention = self.retention;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| {
            entry
                .terminal_since
                .is_none_or(|since| since.elapsed() < retention)
        });
        let purged = before - sessions.len();
        if purged > 0 {
            debug!(purged, "Purged expired sessions");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
