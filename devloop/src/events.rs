//! Session event bus.
//!
//! Every observable transition (watch state, push progress, command
//! execution, tunnel and program status) is published here as a typed
//! [`SessionEvent`]. The stdout status markers are rendered from these
//! events by [`crate::status::StatusPrinter`]; tests subscribe directly.

use crate::session::SessionState;
use crate::supervisor::ProgramState;
use crate::watch::WatchState;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionState {
        state: SessionState,
    },
    WatchState {
        state: WatchState,
    },
    /// The project is being watched for changes.
    Watching {
        path: PathBuf,
    },
    PushStarted,
    NoChanges,
    PushCompleted {
        files_transferred: usize,
        bytes_transferred: u64,
        files_deleted: usize,
    },
    Executing {
        command: String,
    },
    CommandFailed {
        command: String,
        message: String,
        stderr: String,
    },
    /// A full cycle (sync and commands) succeeded.
    CycleSucceeded,
    CycleFailed {
        message: String,
    },
    TunnelOpened {
        endpoint: String,
        local_port: u16,
        container_port: u16,
        debug: bool,
    },
    ProgramStatusChanged {
        program: String,
        state: ProgramState,
    },
}

impl SessionEvent {
    /// Stable snake_case name, as used in the JSON envelope.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionState { .. } => "session_state",
            Self::WatchState { .. } => "watch_state",
            Self::Watching { .. } => "watching",
            Self::PushStarted => "push_started",
            Self::NoChanges => "no_changes",
            Self::PushCompleted { .. } => "push_completed",
            Self::Executing { .. } => "executing",
            Self::CommandFailed { .. } => "command_failed",
            Self::CycleSucceeded => "cycle_succeeded",
            Self::CycleFailed { .. } => "cycle_failed",
            Self::TunnelOpened { .. } => "tunnel_opened",
            Self::ProgramStatusChanged { .. } => "program_status_changed",
        }
    }
}

/// Broadcast channel for session events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Create a new event bus; the buffer is clamped to at least
    /// `DEFAULT_BUFFER` so bursty cycles do not lag subscribers.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

/// JSON line `{event, data, timestamp}` for machine-readable output.
pub fn to_json_line(event: &SessionEvent) -> Option<String> {
    let mut value = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(err) => {
            warn!("Failed to serialize event {}: {}", event.name(), err);
            return None;
        }
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    }
    serde_json::to_string(&value).ok()
}
