//! Dev session lifecycle.
//!
//! [`DevSession`] owns one project's lock, tunnels, supervisor, syncer and
//! command runner. `run` performs the initial sync and pipeline, then hands
//! control to the [`Watcher`] with itself as the [`CycleHandler`]; on
//! cancellation it tears everything down in a fixed order.

use crate::debug_info::DebugInfo;
use crate::error::DevloopError;
use crate::events::{EventBus, SessionEvent};
use crate::lock::SessionLock;
use crate::runner::{CommandRunner, CommandSet, ExecutionReport, PipelineRequest, StartCheck};
use crate::supervisor::{ProcessSupervisor, StatusPoller};
use crate::sync::{SyncMode, SyncOutcome, Syncer, reset_index};
use crate::tunnel::{PortAllocation, TunnelManager, TunnelRequest};
use crate::watch::{CycleError, CycleHandler, FsEvent, StateReporter, WatchState, Watcher};
use async_trait::async_trait;
use devloop_common::manifest::MANIFEST_FILE;
use devloop_common::{DevloopConfig, IgnoreRules, Manifest, Platform, RemoteError, TargetRef};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Syncing,
    Watching,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Syncing => "syncing",
            Self::Watching => "watching",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub pipeline: PipelineRequest,
    pub random_ports: bool,
    /// Open tunnels for the manifest endpoints.
    pub forward_ports: bool,
    /// Keep watching after the initial cycle.
    pub watch: bool,
    /// Delete the workload and the index on stop.
    pub owns_workload: bool,
    pub descriptor_dir: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            pipeline: PipelineRequest::default(),
            random_ports: false,
            forward_ports: true,
            watch: true,
            owns_workload: false,
            descriptor_dir: DebugInfo::default_dir(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub pipeline: PipelineRequest,
    /// Push the whole tree and run the pipeline even without changes.
    pub force: bool,
}

/// Container receiving the sources and the folder they are synced into.
pub fn sync_location(
    manifest: &Manifest,
    config: &DevloopConfig,
) -> Result<(String, String), DevloopError> {
    let container = manifest
        .source_container()
        .ok_or_else(|| DevloopError::NoContainer {
            manifest: MANIFEST_FILE.to_string(),
        })?;
    let folder = container
        .source_mapping
        .clone()
        .unwrap_or_else(|| config.sync_folder.value.clone());
    Ok((container.name.clone(), folder))
}

/// Whether the pipeline runs when the sync found nothing to push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execute {
    Always,
    OnChanges,
}

pub struct DevSession {
    root: PathBuf,
    manifest: Manifest,
    config: DevloopConfig,
    platform: Platform,
    events: EventBus,
    options: SessionOptions,
    syncer: Syncer,
    supervisor: Arc<ProcessSupervisor>,
    runner: CommandRunner,
    tunnels: TunnelManager,
    state: Mutex<SessionState>,
    target: Mutex<Option<TargetRef>>,
}

impl DevSession {
    pub fn new(
        root: impl Into<PathBuf>,
        manifest: Manifest,
        config: DevloopConfig,
        platform: Platform,
        events: EventBus,
        options: SessionOptions,
    ) -> Result<Self, DevloopError> {
        let root = root.into();
        let (container, remote_folder) = sync_location(&manifest, &config)?;
        let syncer = Syncer::new(&root, container, &remote_folder, platform.files.clone());
        let supervisor = Arc::new(ProcessSupervisor::new(platform.processes.clone()));
        let runner = CommandRunner::new(
            CommandSet::from_manifest(&manifest),
            platform.clone(),
            supervisor.clone(),
            events.clone(),
            &root,
            &remote_folder,
        )
        .with_start_check(StartCheck {
            attempts: config.start_check_attempts.value,
            interval: config.start_check_interval.value,
        });
        let allocation = if options.random_ports {
            PortAllocation::Random
        } else {
            PortAllocation::Sequential
        };
        let tunnels = TunnelManager::new(
            platform.forwarder.clone(),
            events.clone(),
            allocation,
            config.port_range,
        )
        .with_debug_descriptor(&options.descriptor_dir, &manifest.name, &manifest.app);

        Ok(Self {
            root,
            manifest,
            config,
            platform,
            events,
            options,
            syncer,
            supervisor,
            runner,
            tunnels,
            state: Mutex::new(SessionState::Starting),
            target: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
        debug!(%state, "Session state");
        self.events.emit(SessionEvent::SessionState { state });
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    /// Resolve the pod backing the component. The flag is true when it
    /// differs from the one seen before.
    async fn resolve_target(&self) -> Result<(TargetRef, bool), DevloopError> {
        let current = self
            .platform
            .workload
            .current_target()
            .await?
            .ok_or_else(|| DevloopError::WorkloadNotFound {
                component: self.manifest.name.clone(),
            })?;
        let mut slot = self.target.lock().unwrap_or_else(|p| p.into_inner());
        let changed = slot.as_ref().is_some_and(|previous| previous != &current);
        *slot = Some(current.clone());
        Ok((current, changed))
    }

    /// Start, sync, run, then watch until `cancel` fires.
    pub async fn run(
        &self,
        fs_events: mpsc::Receiver<FsEvent>,
        cancel: CancellationToken,
    ) -> Result<(), DevloopError> {
        let lock = SessionLock::acquire(&self.root)?;
        self.set_state(SessionState::Starting);

        let result = self.run_until_cancelled(fs_events, &cancel).await;
        if let Err(e) = &result {
            warn!(code = %e.code(), "Session ending: {}", e);
        }

        self.stop().await;
        drop(lock);
        self.set_state(SessionState::Stopped);
        result
    }

    async fn run_until_cancelled(
        &self,
        fs_events: mpsc::Receiver<FsEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), DevloopError> {
        let (target, _) = self.resolve_target().await?;
        info!(target = %target, component = %self.manifest.name, "Starting dev session");

        if self.options.forward_ports {
            let requests = TunnelRequest::from_manifest(&self.manifest, self.options.pipeline.debug);
            self.tunnels.open(&target, requests).await?;
        }

        self.set_state(SessionState::Syncing);
        match self
            .sync_and_execute(
                &target,
                SyncMode::Incremental,
                Execute::Always,
                &self.options.pipeline,
                None,
                cancel,
            )
            .await
        {
            Ok(_) => {}
            Err(e) if e.ends_session() => return Err(e),
            Err(e) => self.report_failure(&e),
        }

        let poller = StatusPoller::new(
            self.supervisor.clone(),
            self.events.clone(),
            self.config.status_interval.value,
        )
        .spawn(cancel.child_token());

        let result = if self.options.watch {
            self.set_state(SessionState::Watching);
            self.watch(fs_events, cancel).await
        } else {
            self.set_state(SessionState::Running);
            cancel.cancelled().await;
            Ok(())
        };

        cancel.cancel();
        if let Err(e) = poller.await {
            debug!("Status poller ended abnormally: {}", e);
        }
        result
    }

    async fn watch(
        &self,
        fs_events: mpsc::Receiver<FsEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), DevloopError> {
        let rules = IgnoreRules::load(&self.root)?;
        let watcher = Watcher::new(
            &self.root,
            rules,
            self.config.debounce.value,
            self.events.clone(),
        );
        let summary = watcher.run(fs_events, self, cancel.child_token()).await?;
        debug!(
            cycles = summary.cycles,
            failures = summary.failures,
            "Watcher finished"
        );
        Ok(())
    }

    fn report_failure(&self, err: &DevloopError) {
        tracing::error!("Error occurred on Push - {}", err);
        self.events.emit(SessionEvent::CycleFailed {
            message: err.to_string(),
        });
    }

    /// Tear down in order: tunnels, programs, owned workload, descriptor.
    async fn stop(&self) {
        self.set_state(SessionState::Stopping);
        self.tunnels.close().await;

        for e in self.supervisor.stop_all().await {
            warn!("Failed to stop program: {}", e);
        }

        if self.options.owns_workload {
            match self.platform.workload.delete().await {
                Ok(()) => info!(component = %self.manifest.name, "Deleted workload"),
                Err(e) => warn!("Failed to delete workload: {}", e),
            }
            if let Err(e) = reset_index(&self.root) {
                warn!("Failed to delete file index: {}", e);
            }
        }

        if let Err(e) = DebugInfo::remove(&self.options.descriptor_dir, &self.manifest.name) {
            warn!("Failed to remove debug descriptor: {}", e);
        }
    }

    /// One sync followed by the pipeline.
    async fn sync_and_execute(
        &self,
        target: &TargetRef,
        mode: SyncMode,
        execute: Execute,
        pipeline: &PipelineRequest,
        reporter: Option<&StateReporter>,
        cancel: &CancellationToken,
    ) -> Result<Option<ExecutionReport>, DevloopError> {
        self.events.emit(SessionEvent::PushStarted);
        match self.syncer.sync_cycle(target, mode, cancel).await? {
            SyncOutcome::NoChanges => {
                self.events.emit(SessionEvent::NoChanges);
                if execute == Execute::OnChanges {
                    debug!("No file changes detected, skipping commands");
                    return Ok(None);
                }
            }
            SyncOutcome::Pushed(result) => {
                info!(
                    files = result.files_transferred,
                    bytes = result.bytes_transferred,
                    deleted = result.files_deleted,
                    "Pushed changes"
                );
                self.events.emit(SessionEvent::PushCompleted {
                    files_transferred: result.files_transferred,
                    bytes_transferred: result.bytes_transferred,
                    files_deleted: result.files_deleted,
                });
            }
        }

        if let Some(reporter) = reporter {
            reporter.set(WatchState::Executing);
        }
        let report = self
            .runner
            .run_pipeline(target, pipeline, cancel)
            .await?;
        if report.target_gone {
            return Err(RemoteError::TargetGone(target.pod.clone()).into());
        }
        if let Some(err) = report.error() {
            return Err(err.into());
        }
        if !cancel.is_cancelled() {
            self.events.emit(SessionEvent::CycleSucceeded);
        }
        Ok(Some(report))
    }

    /// One-shot sync and pipeline. Without `force`, an unchanged tree
    /// skips the pipeline.
    pub async fn push_once(
        &self,
        push: &PushOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<ExecutionReport>, DevloopError> {
        let _lock = SessionLock::acquire(&self.root)?;
        let (target, _) = self.resolve_target().await?;
        let (mode, execute) = if push.force {
            (SyncMode::Full, Execute::Always)
        } else {
            (SyncMode::Incremental, Execute::OnChanges)
        };
        self.sync_and_execute(&target, mode, execute, &push.pipeline, None, cancel)
            .await
    }
}

#[async_trait]
impl CycleHandler for DevSession {
    async fn run_cycle(
        &self,
        changed: &[String],
        reporter: &StateReporter,
        cancel: &CancellationToken,
    ) -> Result<(), CycleError> {
        debug!(paths = changed.len(), "Running cycle");
        let (target, recreated) = self
            .resolve_target()
            .await
            .map_err(DevloopError::into_cycle_error)?;

        let mode = if recreated {
            info!(target = %target, "Workload was recreated, forcing full sync");
            self.supervisor.forget_target();
            SyncMode::Full
        } else {
            SyncMode::Incremental
        };
        if self.options.forward_ports
            && let Err(e) = self.tunnels.ensure_current(&target).await
        {
            warn!("{}", e);
        }

        self.set_state(SessionState::Syncing);
        let result = self
            .sync_and_execute(
                &target,
                mode,
                Execute::OnChanges,
                &self.options.pipeline,
                Some(reporter),
                cancel,
            )
            .await;
        if !cancel.is_cancelled() {
            self.set_state(SessionState::Watching);
        }
        result.map(|_| ()).map_err(DevloopError::into_cycle_error)
    }
}
