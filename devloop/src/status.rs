//! Stdout status markers.
//!
//! Downstream tooling keys off a handful of stable substrings ("Pushing
//! files...", "Waiting for something to change", ...). They are rendered
//! here from [`SessionEvent`]s so the engine never writes to stdout itself.

use crate::events::{EventBus, SessionEvent, to_json_line};
use crate::session::SessionState;
use crate::tunnel::LOCAL_ADDRESS;
use crate::watch::WatchState;
use colored::Colorize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    /// One JSON object per event.
    Json,
}

/// Plain-text marker for `event`, or `None` for events without one.
pub fn render(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::WatchState {
            state: WatchState::Idle,
        } => "Waiting for something to change".to_string(),
        SessionEvent::WatchState { .. } => return None,
        SessionEvent::Watching { path } => format!(
            "Watching for changes in the current directory {}",
            path.display()
        ),
        SessionEvent::PushStarted => "Pushing files...".to_string(),
        SessionEvent::NoChanges => "No file changes detected".to_string(),
        SessionEvent::PushCompleted {
            files_transferred,
            files_deleted,
            ..
        } => format!("Synced {files_transferred} file(s), removed {files_deleted}"),
        SessionEvent::Executing { command } => format!("Executing {command} command"),
        SessionEvent::CommandFailed {
            message, stderr, ..
        } => {
            if stderr.trim().is_empty() {
                message.clone()
            } else {
                format!("{message}\n{}", stderr.trim_end())
            }
        }
        SessionEvent::CycleSucceeded => "Changes successfully pushed to component".to_string(),
        SessionEvent::CycleFailed { message } => format!("Error occurred on Push - {message}"),
        SessionEvent::TunnelOpened {
            local_port,
            container_port,
            ..
        } => format!("Forwarding from {LOCAL_ADDRESS}:{local_port} -> {container_port}"),
        SessionEvent::ProgramStatusChanged { program, state } => {
            format!("Program {program} is {state}")
        }
        SessionEvent::SessionState {
            state: SessionState::Stopping,
        } => "Cleaning up resources".to_string(),
        SessionEvent::SessionState { .. } => return None,
    };
    Some(line)
}

fn decorate(event: &SessionEvent, line: String) -> String {
    match event {
        SessionEvent::CycleFailed { .. } | SessionEvent::CommandFailed { .. } => {
            line.red().to_string()
        }
        SessionEvent::CycleSucceeded => line.green().to_string(),
        SessionEvent::TunnelOpened { .. } => line.cyan().to_string(),
        SessionEvent::Executing { .. } | SessionEvent::PushStarted => line.bold().to_string(),
        _ => line,
    }
}

fn print_event(event: &SessionEvent, format: OutputFormat) {
    match format {
        OutputFormat::Human => {
            if let Some(line) = render(event) {
                println!("{}", decorate(event, line));
            }
        }
        OutputFormat::Json => {
            if let Some(line) = to_json_line(event) {
                println!("{line}");
            }
        }
    }
}

/// Background task printing markers for every event on the bus.
pub struct StatusPrinter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusPrinter {
    pub fn spawn(events: &EventBus, format: OutputFormat) -> Self {
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    event = rx.recv() => match event {
                        Ok(event) => print_event(&event, format),
                        Err(RecvError::Lagged(n)) => warn!("Status output skipped {} events", n),
                        Err(RecvError::Closed) => return,
                    },
                    _ = token.cancelled() => break,
                }
            }
            loop {
                match rx.try_recv() {
                    Ok(event) => print_event(&event, format),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        });
        Self { cancel, handle }
    }

    /// Flush pending events and stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Status printer ended abnormally: {}", e);
        }
    }
}
