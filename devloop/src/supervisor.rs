//! Long-running program supervision.
//!
//! `run` and `debug` commands start programs that outlive the cycle that
//! launched them. The [`ProcessSupervisor`] keeps a registry of what it
//! started (spec, pid, target), answers status queries by probing the
//! backend, and stops programs on restart or session teardown.

use crate::events::{EventBus, SessionEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devloop_common::ErrorCode;
use devloop_common::remote::{
    ProbeResult, ProcessBackend, ProcessHandle, ProcessSpec, RemoteError, RemoteExec, TargetRef,
};
use devloop_common::util::{mask_sensitive_command, remote_join, shell_quote};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgramState {
    Running,
    Exited,
    Fatal,
    Stopped,
}

impl ProgramState {
    pub fn from_probe(probe: &ProbeResult) -> Self {
        match probe {
            ProbeResult { pid: None, .. } => Self::Stopped,
            ProbeResult { alive: true, .. } => Self::Running,
            ProbeResult {
                exit_code: Some(0), ..
            } => Self::Exited,
            _ => Self::Fatal,
        }
    }
}

impl fmt::Display for ProgramState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Exited => "EXITED",
            Self::Fatal => "FATAL",
            Self::Stopped => "STOPPED",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgramStatus {
    pub program: String,
    pub container: String,
    pub pid: Option<u32>,
    pub state: ProgramState,
    pub exit_code: Option<i32>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to {action} program \"{program}\": {source}")]
    Remote {
        action: &'static str,
        program: String,
        #[source]
        source: RemoteError,
    },

    #[error("program \"{0}\" is not supervised")]
    NotRegistered(String),
}

impl SupervisorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote {
                source: RemoteError::TargetGone(_),
                ..
            } => ErrorCode::PlatformTargetGone,
            _ => ErrorCode::CommandSupervisorError,
        }
    }

    pub fn is_target_gone(&self) -> bool {
        matches!(
            self,
            Self::Remote {
                source: RemoteError::TargetGone(_),
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
struct Supervised {
    target: TargetRef,
    container: String,
    spec: ProcessSpec,
    pid: u32,
    last_state: ProgramState,
}

/// Registry of programs started by this session.
pub struct ProcessSupervisor {
    backend: Arc<dyn ProcessBackend>,
    programs: Mutex<BTreeMap<String, Supervised>>,
}

impl ProcessSupervisor {
    pub fn new(backend: Arc<dyn ProcessBackend>) -> Self {
        Self {
            backend,
            programs: Mutex::new(BTreeMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<String, Supervised>> {
        self.programs.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub async fn start(
        &self,
        target: &TargetRef,
        container: &str,
        spec: ProcessSpec,
    ) -> Result<ProcessHandle, SupervisorError> {
        info!(
            program = %spec.program,
            container,
            command = %mask_sensitive_command(&spec.command_line),
            "Starting supervised program"
        );
        let handle = self
            .backend
            .start(target, container, &spec)
            .await
            .map_err(|source| SupervisorError::Remote {
                action: "start",
                program: spec.program.clone(),
                source,
            })?;

        self.registry().insert(
            spec.program.clone(),
            Supervised {
                target: target.clone(),
                container: container.to_string(),
                spec,
                pid: handle.pid,
                last_state: ProgramState::Running,
            },
        );
        Ok(handle)
    }

    /// Stop a registered program. Unknown programs are a no-op.
    pub async fn stop(&self, program: &str) -> Result<(), SupervisorError> {
        let Some(entry) = self.registry().get(program).cloned() else {
            return Ok(());
        };
        debug!(program, pid = entry.pid, "Stopping supervised program");
        let result = self
            .backend
            .stop(&entry.target, &entry.container, program)
            .await;
        self.registry().remove(program);
        match result {
            Ok(()) | Err(RemoteError::TargetGone(_)) => Ok(()),
            Err(source) => Err(SupervisorError::Remote {
                action: "stop",
                program: program.to_string(),
                source,
            }),
        }
    }

    /// Stop `program` on `target` whether or not this supervisor started it.
    /// A copy launched by an earlier invocation is only known to the
    /// container.
    pub async fn stop_stale(
        &self,
        target: &TargetRef,
        container: &str,
        program: &str,
    ) -> Result<(), SupervisorError> {
        self.registry().remove(program);
        debug!(program, target = %target, "Stopping any leftover copy of program");
        match self.backend.stop(target, container, program).await {
            Ok(()) | Err(RemoteError::TargetGone(_)) => Ok(()),
            Err(source) => Err(SupervisorError::Remote {
                action: "stop",
                program: program.to_string(),
                source,
            }),
        }
    }

    /// Stop every registered program, continuing past failures.
    pub async fn stop_all(&self) -> Vec<SupervisorError> {
        let programs: Vec<String> = self.registry().keys().cloned().collect();
        let mut errors = Vec::new();
        for program in programs {
            if let Err(e) = self.stop(&program).await {
                warn!("{}", e);
                errors.push(e);
            }
        }
        errors
    }

    /// Spec the program was last started with.
    pub fn registered(&self, program: &str) -> Option<ProcessSpec> {
        self.registry().get(program).map(|s| s.spec.clone())
    }

    pub fn is_registered_on(&self, program: &str, target: &TargetRef) -> bool {
        self.registry()
            .get(program)
            .is_some_and(|s| &s.target == target)
    }

    pub fn programs(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    /// Drop every record; used when the workload was replaced.
    pub fn forget_target(&self) {
        let mut registry = self.registry();
        if !registry.is_empty() {
            debug!(programs = registry.len(), "Forgetting supervised programs");
        }
        registry.clear();
    }

    pub async fn status_of(&self, program: &str) -> Result<ProgramStatus, SupervisorError> {
        let entry = self
            .registry()
            .get(program)
            .cloned()
            .ok_or_else(|| SupervisorError::NotRegistered(program.to_string()))?;
        let probe = self
            .backend
            .probe(&entry.target, &entry.container, program)
            .await
            .map_err(|source| SupervisorError::Remote {
                action: "probe",
                program: program.to_string(),
                source,
            })?;
        Ok(ProgramStatus {
            program: program.to_string(),
            container: entry.container,
            pid: probe.pid,
            state: ProgramState::from_probe(&probe),
            exit_code: probe.exit_code,
            observed_at: Utc::now(),
        })
    }

    /// Probe every registered program.
    pub async fn status(&self) -> Vec<ProgramStatus> {
        let mut statuses = Vec::new();
        for program in self.programs() {
            match self.status_of(&program).await {
                Ok(status) => statuses.push(status),
                Err(e) => debug!("Status probe failed: {}", e),
            }
        }
        statuses
    }

    /// Probe every program and return those whose state changed since the
    /// last poll.
    pub async fn poll_changes(&self) -> Vec<(ProgramStatus, ProgramState)> {
        let mut changes = Vec::new();
        for status in self.status().await {
            let mut registry = self.registry();
            if let Some(entry) = registry.get_mut(&status.program)
                && entry.last_state != status.state
            {
                let previous = entry.last_state;
                entry.last_state = status.state;
                changes.push((status, previous));
            }
        }
        changes
    }

    /// Probe `program` every `interval`, `attempts` times, failing fast on
    /// the first probe that is not RUNNING.
    pub async fn wait_running(
        &self,
        program: &str,
        attempts: u32,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProgramStatus, SupervisorError> {
        let mut last = self.status_of(program).await?;
        for attempt in 1..=attempts {
            if last.state != ProgramState::Running {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            last = self.status_of(program).await?;
            debug!(program, attempt, state = %last.state, "Start check");
        }
        Ok(last)
    }
}

// ── Status poller ───────────────────────────────────────────────────────

/// Periodically probes supervised programs and publishes state changes.
pub struct StatusPoller {
    supervisor: Arc<ProcessSupervisor>,
    events: EventBus,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(supervisor: Arc<ProcessSupervisor>, events: EventBus, interval: Duration) -> Self {
        Self {
            supervisor,
            events,
            interval,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for (status, previous) in self.supervisor.poll_changes().await {
                if previous == ProgramState::Running
                    && matches!(status.state, ProgramState::Exited | ProgramState::Fatal)
                {
                    warn!(
                        program = %status.program,
                        exit_code = ?status.exit_code,
                        "Program {} exited unexpectedly ({})",
                        status.program,
                        status.state
                    );
                }
                self.events.emit(SessionEvent::ProgramStatusChanged {
                    program: status.program,
                    state: status.state,
                });
            }
        }
        debug!("Status poller stopped");
    }
}

// ── Shell-based backend ─────────────────────────────────────────────────

/// [`ProcessBackend`] over [`RemoteExec`], tracking pids in files under a
/// shared directory of the container.
pub struct ShellProcessBackend {
    exec: Arc<dyn RemoteExec>,
    shared_dir: String,
    pid_wait: Duration,
    /// Exit status of the last start of each program, keyed by generation.
    exits: Arc<Mutex<HashMap<String, (u64, Option<i32>)>>>,
    generation: Mutex<u64>,
}

const PID_POLL: Duration = Duration::from_millis(100);

impl ShellProcessBackend {
    pub fn new(exec: Arc<dyn RemoteExec>, shared_dir: impl Into<String>) -> Self {
        Self {
            exec,
            shared_dir: shared_dir.into(),
            pid_wait: Duration::from_secs(5),
            exits: Arc::new(Mutex::new(HashMap::new())),
            generation: Mutex::new(0),
        }
    }

    pub fn with_pid_wait(mut self, wait: Duration) -> Self {
        self.pid_wait = wait;
        self
    }

    pub fn pid_file(&self, program: &str) -> String {
        remote_join(&self.shared_dir, &format!(".devloop_cmd_{program}.pid"))
    }

    /// Shell line that records its pid, then replaces itself with the
    /// program, sending output to the container's main streams.
    pub fn start_line(&self, spec: &ProcessSpec) -> String {
        let mut cmd = String::new();
        if let Some(dir) = &spec.working_dir {
            cmd.push_str(&format!("cd {} && ", shell_quote(dir)));
        }
        for var in &spec.env {
            cmd.push_str(&format!("{}={} ", var.name, shell_quote(&var.value)));
        }
        cmd.push_str(&spec.command_line);
        format!(
            "echo $$ > {} && exec sh -c {} 1>>/proc/1/fd/1 2>>/proc/1/fd/2",
            shell_quote(&self.pid_file(&spec.program)),
            shell_quote(&cmd)
        )
    }

    /// Kills the pid recorded in the pid file, children first, then
    /// removes the file.
    fn kill_recorded(pid_file: &str) -> String {
        format!(
            "if [ -f {pid_file} ]; then pid=$(cat {pid_file}); \
             for c in $(cat /proc/$pid/task/$pid/children 2>/dev/null); do kill $c 2>/dev/null; done; \
             kill $pid 2>/dev/null; rm -f {pid_file}; fi"
        )
    }

    fn sh(script: String) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script]
    }

    fn exits(&self) -> MutexGuard<'_, HashMap<String, (u64, Option<i32>)>> {
        self.exits.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn read_pid(
        &self,
        target: &TargetRef,
        container: &str,
        program: &str,
    ) -> Result<Option<u32>, RemoteError> {
        let script = format!("cat {} 2>/dev/null", shell_quote(&self.pid_file(program)));
        let output = self
            .exec
            .exec(target, container, &Self::sh(script), None)
            .await?;
        Ok(output.stdout.trim().parse().ok())
    }
}

#[async_trait]
impl ProcessBackend for ShellProcessBackend {
    async fn start(
        &self,
        target: &TargetRef,
        container: &str,
        spec: &ProcessSpec,
    ) -> Result<ProcessHandle, RemoteError> {
        let pid_file = self.pid_file(&spec.program);
        let quoted = shell_quote(&pid_file).into_owned();
        // A still-running copy from an earlier invocation goes first.
        let prepare = format!(
            "mkdir -p {} && {{ {}; rm -f {quoted}; }}",
            shell_quote(&self.shared_dir),
            Self::kill_recorded(&quoted)
        );
        let output = self
            .exec
            .exec(target, container, &Self::sh(prepare), None)
            .await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let generation = {
            let mut g = self.generation.lock().unwrap_or_else(|p| p.into_inner());
            *g += 1;
            *g
        };
        self.exits()
            .insert(spec.program.clone(), (generation, None));

        let exec = self.exec.clone();
        let exits = self.exits.clone();
        let argv = Self::sh(self.start_line(spec));
        let task_target = target.clone();
        let task_container = container.to_string();
        let program = spec.program.clone();
        tokio::spawn(async move {
            let result = exec.exec(&task_target, &task_container, &argv, None).await;
            let code = match result {
                Ok(output) => output.exit_code,
                Err(e) => {
                    debug!(program = %program, "Supervised exec ended: {}", e);
                    return;
                }
            };
            let mut exits = exits.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = exits.get_mut(&program)
                && entry.0 == generation
            {
                entry.1 = Some(code);
            }
        });

        let deadline = tokio::time::Instant::now() + self.pid_wait;
        loop {
            if let Some(pid) = self.read_pid(target, container, &spec.program).await? {
                return Ok(ProcessHandle { pid });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RemoteError::CommandFailed {
                    exit_code: -1,
                    stderr: format!("no pid recorded in {pid_file}"),
                });
            }
            tokio::time::sleep(PID_POLL).await;
        }
    }

    async fn probe(
        &self,
        target: &TargetRef,
        container: &str,
        program: &str,
    ) -> Result<ProbeResult, RemoteError> {
        let pid_file = shell_quote(&self.pid_file(program)).into_owned();
        let script = format!("cat {pid_file} 2>/dev/null && kill -0 \"$(cat {pid_file})\" 2>/dev/null");
        let output = self
            .exec
            .exec(target, container, &Self::sh(script), None)
            .await?;
        let Some(pid) = output.stdout.trim().parse::<u32>().ok() else {
            return Ok(ProbeResult::default());
        };
        let alive = output.success();
        let exit_code = if alive {
            None
        } else {
            self.exits().get(program).and_then(|(_, code)| *code)
        };
        Ok(ProbeResult {
            pid: Some(pid),
            alive,
            exit_code,
        })
    }

    async fn stop(
        &self,
        target: &TargetRef,
        container: &str,
        program: &str,
    ) -> Result<(), RemoteError> {
        let pid_file = shell_quote(&self.pid_file(program)).into_owned();
        let script = format!("{}; true", Self::kill_recorded(&pid_file));
        let output = self
            .exec
            .exec(target, container, &Self::sh(script), None)
            .await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        self.exits().remove(program);
        Ok(())
    }
}
