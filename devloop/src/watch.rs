//! Filesystem watch loop.
//!
//! The [`Watcher`] is an explicit state machine fed by a bounded channel of
//! [`FsEvent`]s. Events are filtered against the ignore rules, debounced
//! until quiescent, and then handed as one batch to a [`CycleHandler`].
//! Events that arrive while a cycle runs wait in the channel and are
//! coalesced into the next cycle, so at most one cycle is ever active.

use crate::backoff::ExponentialBackoff;
use crate::events::{EventBus, SessionEvent};
use async_trait::async_trait;
use devloop_common::ErrorCode;
use devloop_common::file_index::to_relative;
use devloop_common::ignore_rules::{GITIGNORE_FILE, IGNORE_FILE, IgnoreRules};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Capacity of the event channel between the OS watcher and the loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Idle,
    Debouncing,
    Syncing,
    Executing,
    Stopping,
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Debouncing => "debouncing",
            Self::Syncing => "syncing",
            Self::Executing => "executing",
            Self::Stopping => "stopping",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

impl FsEvent {
    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: FsEventKind::Modified,
        }
    }

    /// Map a notify event; access events are dropped.
    pub fn from_notify(event: notify::Event) -> Vec<Self> {
        let kind = match event.kind {
            EventKind::Access(_) => return Vec::new(),
            EventKind::Create(_) => FsEventKind::Created,
            EventKind::Remove(_) => FsEventKind::Removed,
            EventKind::Modify(_) | EventKind::Any | EventKind::Other => FsEventKind::Modified,
        };
        event
            .paths
            .into_iter()
            .map(|path| Self { path, kind })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

impl WatchError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InternalIoError
    }
}

/// Recursive OS watcher feeding a bounded channel.
pub struct NotifySource {
    _watcher: RecommendedWatcher,
}

impl NotifySource {
    pub fn start(root: &Path) -> Result<(Self, mpsc::Receiver<FsEvent>), WatchError> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let notify_err = |source| WatchError::Notify {
            path: root.to_path_buf(),
            source,
        };
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for fs_event in FsEvent::from_notify(event) {
                        // Blocks the notify thread when the loop falls behind.
                        if tx.blocking_send(fs_event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            }
        })
        .map_err(notify_err)?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(notify_err)?;
        debug!(root = %root.display(), "Filesystem watcher started");
        Ok((Self { _watcher: watcher }, rx))
    }
}

// ── Cycle handling ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CycleError {
    /// Reported; the watcher keeps going and retries later.
    #[error("{message}")]
    Failed { code: ErrorCode, message: String },

    /// Ends the watch loop.
    #[error("{message}")]
    Fatal { code: ErrorCode, message: String },
}

impl CycleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failed { code, .. } | Self::Fatal { code, .. } => *code,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Publishes watch state transitions.
pub struct StateReporter {
    tx: watch::Sender<WatchState>,
    events: EventBus,
}

impl StateReporter {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(WatchState::Idle);
        Self { tx, events }
    }

    pub fn set(&self, state: WatchState) {
        self.tx.send_replace(state);
        trace!(%state, "Watch state");
        self.events.emit(SessionEvent::WatchState { state });
    }

    pub fn current(&self) -> WatchState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.tx.subscribe()
    }
}

#[async_trait]
pub trait CycleHandler: Send + Sync {
    /// Sync and re-run commands for one batch of changed paths. Call
    /// `reporter.set(WatchState::Executing)` once syncing is done.
    async fn run_cycle(
        &self,
        changed: &[String],
        reporter: &StateReporter,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub cycles: usize,
    pub failures: usize,
}

// ── Watcher ─────────────────────────────────────────────────────────────

pub struct Watcher {
    root: PathBuf,
    rules: IgnoreRules,
    debounce: Duration,
    reporter: StateReporter,
    events: EventBus,
}

impl Watcher {
    pub fn new(root: impl Into<PathBuf>, rules: IgnoreRules, debounce: Duration, events: EventBus) -> Self {
        Self {
            root: root.into(),
            rules,
            debounce,
            reporter: StateReporter::new(events.clone()),
            events,
        }
    }

    pub fn state(&self) -> watch::Receiver<WatchState> {
        self.reporter.subscribe()
    }

    /// Relative path of an event worth syncing, or `None` when ignored.
    fn accept(&mut self, event: &FsEvent) -> Option<String> {
        let rel = to_relative(&self.root, &event.path)?;
        if rel == IGNORE_FILE || rel == GITIGNORE_FILE {
            match IgnoreRules::load(&self.root) {
                Ok(rules) => self.rules = rules,
                Err(e) => warn!("Keeping previous ignore rules: {}", e),
            }
        }
        let is_dir = event.kind != FsEventKind::Removed && event.path.is_dir();
        if self.rules.is_ignored(&rel, is_dir) {
            trace!(path = %rel, "Ignoring event");
            return None;
        }
        Some(rel)
    }

    /// Run until cancelled, the event source closes, or a cycle fails fatally.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<FsEvent>,
        handler: &dyn CycleHandler,
        cancel: CancellationToken,
    ) -> Result<WatchSummary, CycleError> {
        let mut summary = WatchSummary::default();
        let mut pending: BTreeSet<String> = BTreeSet::new();
        let mut backoff = ExponentialBackoff::for_cycle_retry();
        let mut retry_at: Option<Instant> = None;
        let mut source_open = true;

        info!(
            "Watching for changes in the current directory {}",
            self.root.display()
        );
        self.events.emit(SessionEvent::Watching {
            path: self.root.clone(),
        });
        self.reporter.set(WatchState::Idle);

        'outer: loop {
            // Idle: wait for a relevant event or a scheduled retry.
            let retry = retry_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'outer,
                event = rx.recv(), if source_open => match event {
                    Some(event) => {
                        let Some(rel) = self.accept(&event) else { continue };
                        pending.insert(rel);
                        retry_at = None;
                    }
                    None => {
                        source_open = false;
                        if retry_at.is_none() {
                            break 'outer;
                        }
                        continue;
                    }
                },
                _ = tokio::time::sleep_until(retry), if retry_at.is_some() => {
                    debug!("Retrying failed cycle");
                    retry_at = None;
                }
            }

            // Debouncing: every relevant event restarts the window.
            self.reporter.set(WatchState::Debouncing);
            let mut deadline = Instant::now() + self.debounce;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'outer,
                    event = rx.recv(), if source_open => match event {
                        Some(event) => {
                            if let Some(rel) = self.accept(&event) {
                                pending.insert(rel);
                                deadline = Instant::now() + self.debounce;
                            }
                        }
                        None => source_open = false,
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            let batch: Vec<String> = pending.iter().cloned().collect();
            debug!(paths = batch.len(), "Starting cycle");
            self.reporter.set(WatchState::Syncing);
            summary.cycles += 1;

            match handler.run_cycle(&batch, &self.reporter, &cancel).await {
                Ok(()) => {
                    pending.clear();
                    backoff.reset();
                }
                Err(e) if e.is_fatal() => {
                    error!("Error occurred on Push - {}", e);
                    self.events.emit(SessionEvent::CycleFailed {
                        message: e.to_string(),
                    });
                    self.reporter.set(WatchState::Stopping);
                    return Err(e);
                }
                Err(e) => {
                    summary.failures += 1;
                    let delay = backoff.next_delay();
                    error!("Error occurred on Push - {}", e);
                    debug!(?delay, "Scheduling retry");
                    self.events.emit(SessionEvent::CycleFailed {
                        message: e.to_string(),
                    });
                    retry_at = Some(Instant::now() + delay);
                }
            }

            if cancel.is_cancelled() {
                break;
            }
            self.reporter.set(WatchState::Idle);
            if !source_open && retry_at.is_none() {
                break;
            }
        }

        self.reporter.set(WatchState::Stopping);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROOT: &str = "/work/project";

    #[derive(Default)]
    struct RecordingHandler {
        batches: Mutex<Vec<Vec<String>>>,
        fail_first: AtomicUsize,
        fatal: bool,
    }

    impl RecordingHandler {
        fn batches(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CycleHandler for RecordingHandler {
        async fn run_cycle(
            &self,
            changed: &[String],
            reporter: &StateReporter,
            _cancel: &CancellationToken,
        ) -> Result<(), CycleError> {
            self.batches.lock().unwrap().push(changed.to_vec());
            reporter.set(WatchState::Executing);
            if self.fatal {
                return Err(CycleError::Fatal {
                    code: ErrorCode::PlatformWorkloadNotFound,
                    message: "workload gone".to_string(),
                });
            }
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CycleError::Failed {
                    code: ErrorCode::SyncPartialPush,
                    message: "upload failed".to_string(),
                });
            }
            Ok(())
        }
    }

    fn watcher(patterns: &[&str], events: EventBus) -> Watcher {
        let rules = IgnoreRules::from_patterns(Path::new(ROOT), patterns).unwrap();
        Watcher::new(ROOT, rules, Duration::from_millis(100), events)
    }

    fn event(rel: &str) -> FsEvent {
        FsEvent::modified(Path::new(ROOT).join(rel))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_events_triggers_one_cycle() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handler = RecordingHandler::default();
        let cancel = CancellationToken::new();

        for i in 0..50 {
            tx.send(event(&format!("src/file{i}.js"))).await.unwrap();
        }
        drop(tx);

        let summary = watcher(&[], EventBus::default())
            .run(rx, &handler, cancel)
            .await
            .unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(handler.batches()[0].len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_spread_beyond_window_trigger_separate_cycles() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handler = RecordingHandler::default();
        let cancel = CancellationToken::new();

        let producer = tokio::spawn(async move {
            tx.send(event("a.txt")).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(event("b.txt")).await.unwrap();
        });

        let summary = watcher(&[], EventBus::default())
            .run(rx, &handler, cancel)
            .await
            .unwrap();
        producer.await.unwrap();
        assert_eq!(summary.cycles, 2);
        assert_eq!(
            handler.batches(),
            vec![vec!["a.txt".to_string()], vec!["b.txt".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_events_never_start_a_cycle() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handler = RecordingHandler::default();

        tx.send(event("node_modules/x/index.js")).await.unwrap();
        tx.send(event(".devloop/file-index.json")).await.unwrap();
        tx.send(event(".git/HEAD")).await.unwrap();
        tx.send(FsEvent::modified("/elsewhere/file.txt")).await.unwrap();
        drop(tx);

        let summary = watcher(&["node_modules/"], EventBus::default())
            .run(rx, &handler, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_is_retried_with_backoff() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handler = RecordingHandler {
            fail_first: AtomicUsize::new(2),
            ..Default::default()
        };
        let bus = EventBus::default();
        let mut events = bus.subscribe();

        tx.send(event("a.txt")).await.unwrap();
        drop(tx);

        let summary = watcher(&[], bus)
            .run(rx, &handler, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.failures, 2);
        assert!(handler.batches().iter().all(|b| b == &vec!["a.txt".to_string()]));

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::CycleFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_cycle_ends_watcher() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handler = RecordingHandler {
            fatal: true,
            ..Default::default()
        };
        tx.send(event("a.txt")).await.unwrap();

        let err = watcher(&[], EventBus::default())
            .run(rx, &handler, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), ErrorCode::PlatformWorkloadNotFound);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_sequence_and_cancellation() {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handler = RecordingHandler::default();
        let bus = EventBus::default();
        let mut events = bus.subscribe();
        let cancel = CancellationToken::new();

        tx.send(event("a.txt")).await.unwrap();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            })
        };

        watcher(&[], bus).run(rx, &handler, cancel).await.unwrap();
        stopper.await.unwrap();
        drop(tx);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::WatchState { state } => states.push(state),
                SessionEvent::Watching { path } => assert_eq!(path, Path::new(ROOT)),
                _ => {}
            }
        }
        assert_eq!(
            states,
            vec![
                WatchState::Idle,
                WatchState::Debouncing,
                WatchState::Syncing,
                WatchState::Executing,
                WatchState::Idle,
                WatchState::Stopping,
            ]
        );
    }

    #[test]
    fn test_access_events_are_dropped() {
        let access = notify::Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/x"));
        assert!(FsEvent::from_notify(access).is_empty());

        let create = notify::Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/x"))
            .add_path(PathBuf::from("/y"));
        let mapped = FsEvent::from_notify(create);
        assert_eq!(mapped.len(), 2);
        assert!(mapped.iter().all(|e| e.kind == FsEventKind::Created));
    }
}
