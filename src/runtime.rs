//! Runtime for executing chat sessions
//!
//! Each session runs its own event loop. The loop applies the pure transition
//! function and executes the resulting effects; asynchronous results re-enter
//! the loop as events tagged with the attempt they belong to.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;
pub use traits::*;

use crate::camera::RelayCamera;
use crate::state_machine::{ChatMode, ChatStatus, Event, SessionContext, SessionState};
use crate::state_machine::state::SessionTimings;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Sessions untouched this long with no subscribers are evicted (30 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often the reaper looks for idle sessions
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Production runtime: browser-relayed camera and a shared assistant
pub type ProductionRuntime = SessionRuntime<RelayCamera, dyn Assistant>;

/// Updates pushed to subscribed clients
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    StateChange {
        /// Full state as JSON, see [`snapshot_json`]
        state: Value,
    },
    Message {
        message: Value,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session has shut down")]
    Closed,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    status: ChatStatus,
    composing: bool,
    #[serde(flatten)]
    state: &'a SessionState,
}

/// Client-facing JSON of a session state: the flat status next to the full state
pub fn snapshot_json(state: &SessionState) -> Value {
    serde_json::to_value(Snapshot {
        status: state.status(),
        composing: state.is_composing(),
        state,
    })
    .unwrap_or(Value::Null)
}

/// Handle to interact with a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    event_tx: mpsc::Sender<Event>,
    broadcast_tx: broadcast::Sender<SessionUpdate>,
    snapshot_rx: watch::Receiver<SessionState>,
    camera: Arc<RelayCamera>,
    shutdown: CancellationToken,
    last_active: Arc<Mutex<Instant>>,
}

impl SessionHandle {
    /// Queue an event for the session loop
    pub async fn send(&self, event: Event) -> Result<(), SessionError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.broadcast_tx.subscribe()
    }

    /// Last published state
    pub fn snapshot(&self) -> SessionState {
        self.snapshot_rx.borrow().clone()
    }

    /// Camera the client relays frames into
    pub fn camera(&self) -> &RelayCamera {
        &self.camera
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// No open stream and no request within `idle_timeout`
    fn is_abandoned(&self, idle_timeout: Duration) -> bool {
        let last_active = *self.last_active.lock().unwrap_or_else(PoisonError::into_inner);
        self.broadcast_tx.receiver_count() == 0 && last_active.elapsed() >= idle_timeout
    }
}

/// Manager for all session runtimes
pub struct SessionManager {
    assistant: Arc<dyn Assistant>,
    timings: SessionTimings,
    idle_timeout: Duration,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(assistant: Arc<dyn Assistant>, timings: SessionTimings) -> Self {
        Self {
            assistant,
            timings,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Evict idle sessions every `every` until the manager is dropped
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        // Weak reference so the reaper does not keep the manager alive
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                let Some(manager) = manager.upgrade() else {
                    tracing::debug!("SessionManager dropped, reaper exiting");
                    break;
                };
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    let remaining = manager.count().await;
                    tracing::info!(evicted, remaining, "Evicted idle sessions");
                }
            }
        })
    }

    /// Create a session in `Idle` with the given mode and start its runtime
    pub async fn create(&self, mode: ChatMode) -> SessionHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let context = SessionContext::new(&id, self.timings);
        let state = SessionState::new(mode);

        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
        let camera = Arc::new(RelayCamera::new());
        let shutdown = CancellationToken::new();

        let runtime: ProductionRuntime = SessionRuntime::new(
            context,
            state,
            Arc::clone(&camera),
            Arc::clone(&self.assistant),
            event_rx,
            event_tx.clone(),
            broadcast_tx.clone(),
            snapshot_tx,
        )
        .with_shutdown(shutdown.clone());

        let session_id = id.clone();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(session_id = %session_id, "Session runtime finished");
        });

        let handle = SessionHandle {
            id: id.clone(),
            event_tx,
            broadcast_tx,
            snapshot_rx,
            camera,
            shutdown,
            last_active: Arc::new(Mutex::new(Instant::now())),
        };
        self.sessions.write().await.insert(id, handle.clone());
        tracing::info!(session_id = %handle.id, %mode, "Session created");
        handle
    }

    /// Look a session up; every lookup counts as activity
    pub async fn get(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        let handle = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.touch();
        Ok(handle)
    }

    /// Send an event to a session
    pub async fn send_event(&self, session_id: &str, event: Event) -> Result<(), SessionError> {
        self.get(session_id).await?.send(event).await
    }

    /// Shut a session down, releasing everything it holds
    pub async fn remove(&self, session_id: &str) -> Result<(), SessionError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        handle.shutdown.cancel();
        tracing::info!(session_id = %session_id, "Session removed");
        Ok(())
    }

    /// Shut down every abandoned session; returns how many went
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, handle| {
            if handle.is_abandoned(self.idle_timeout) {
                handle.shutdown.cancel();
                tracing::info!(session_id = %id, "Evicting idle session");
                false
            } else {
                true
            }
        });
        before - sessions.len()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
