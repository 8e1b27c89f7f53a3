//! In-memory platform for tests.
//!
//! [`MockPlatform`] implements every collaborator trait in [`crate::remote`]
//! against shared in-memory state: a remote filesystem, a process table with
//! monotonically increasing pids, active port-forward streams and a
//! replaceable target identity. Failures are injected through the builder or
//! the `fail_*` helpers.

use crate::remote::{
    ExecOutput, FileTransport, ForwardSpec, Platform, PortForwarder, ProbeResult, ProcessBackend,
    ProcessHandle, ProcessSpec, RemoteError, RemoteExec, TargetRef, Workload,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockProcess {
    pub pid: u32,
    pub command_line: String,
    pub alive: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub container: String,
    pub argv: Vec<String>,
}

impl ExecCall {
    pub fn line(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Default)]
struct MockState {
    target: Option<TargetRef>,
    generation: u32,
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    upload_attempts: HashMap<String, usize>,
    failing_uploads: HashSet<String>,
    remove_calls: Vec<Vec<String>>,
    exec_calls: Vec<ExecCall>,
    exec_responses: Vec<(String, ExecOutput)>,
    exec_delay: Option<Duration>,
    next_pid: u32,
    processes: BTreeMap<String, MockProcess>,
    crashing_programs: HashSet<String>,
    start_history: Vec<(String, u32)>,
    overlapping_starts: Vec<String>,
    active_forwards: Vec<ForwardSpec>,
    forward_attempts: usize,
    busy_local_ports: HashSet<u16>,
    stream_failures: HashMap<u16, u32>,
    applied: Vec<(String, Option<String>)>,
    deleted: bool,
    logs: String,
}

/// Shared, cloneable in-memory platform.
#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn builder() -> MockPlatformBuilder {
        MockPlatformBuilder::default()
    }

    /// Handles for every collaborator, all backed by this mock.
    pub fn platform(&self) -> Platform {
        let shared = Arc::new(self.clone());
        Platform {
            exec: shared.clone(),
            files: shared.clone(),
            processes: shared.clone(),
            forwarder: shared.clone(),
            workload: shared,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_target(state: &MockState, target: &TargetRef) -> Result<(), RemoteError> {
        match &state.target {
            Some(current) if current == target => Ok(()),
            _ => Err(RemoteError::TargetGone(target.pod.clone())),
        }
    }

    // ── Target control ──────────────────────────────────────────────────

    pub fn target(&self) -> Option<TargetRef> {
        self.lock().target.clone()
    }

    /// Replace the pod with a fresh one: remote files and processes are lost.
    pub fn recreate_target(&self) -> TargetRef {
        let mut state = self.lock();
        state.generation += 1;
        let base = state
            .target
            .as_ref()
            .map(|t| t.pod.split('-').next().unwrap_or("pod").to_string())
            .unwrap_or_else(|| "pod".to_string());
        let target = TargetRef::new(
            format!("{base}-{}", state.generation),
            format!("uid-{}", state.generation),
        );
        state.target = Some(target.clone());
        state.files.clear();
        state.dirs.clear();
        state.processes.clear();
        target
    }

    /// Simulate the workload disappearing entirely.
    pub fn remove_target(&self) {
        let mut state = self.lock();
        state.target = None;
        state.processes.clear();
    }

    // ── Files ───────────────────────────────────────────────────────────

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn remote_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    pub fn remote_dirs(&self) -> Vec<String> {
        self.lock().dirs.iter().cloned().collect()
    }

    pub fn upload_attempts(&self, path: &str) -> usize {
        self.lock().upload_attempts.get(path).copied().unwrap_or(0)
    }

    pub fn total_uploads(&self) -> usize {
        self.lock().upload_attempts.values().sum()
    }

    pub fn remove_calls(&self) -> Vec<Vec<String>> {
        self.lock().remove_calls.clone()
    }

    /// Make uploads of `remote_path` fail until [`Self::heal_upload`].
    pub fn fail_upload(&self, remote_path: &str) {
        self.lock().failing_uploads.insert(remote_path.to_string());
    }

    pub fn heal_upload(&self, remote_path: &str) {
        self.lock().failing_uploads.remove(remote_path);
    }

    // ── Exec ────────────────────────────────────────────────────────────

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        self.lock().exec_calls.clone()
    }

    /// Respond with `output` to exec calls whose joined argv contains `pattern`.
    pub fn respond_to(&self, pattern: &str, output: ExecOutput) {
        self.lock()
            .exec_responses
            .insert(0, (pattern.to_string(), output));
    }

    // ── Processes ───────────────────────────────────────────────────────

    pub fn process(&self, program: &str) -> Option<MockProcess> {
        self.lock().processes.get(program).cloned()
    }

    /// Every `(program, pid)` started so far, in order.
    pub fn start_history(&self) -> Vec<(String, u32)> {
        self.lock().start_history.clone()
    }

    /// Programs started while an earlier copy was still alive.
    pub fn overlapping_starts(&self) -> Vec<String> {
        self.lock().overlapping_starts.clone()
    }

    pub fn start_count(&self, program: &str) -> usize {
        self.lock()
            .start_history
            .iter()
            .filter(|(p, _)| p == program)
            .count()
    }

    /// Terminate a running program as if killed externally.
    pub fn kill_program(&self, program: &str, exit_code: i32) {
        if let Some(process) = self.lock().processes.get_mut(program) {
            process.alive = false;
            process.exit_code = Some(exit_code);
        }
    }

    /// Programs started after this call exit immediately with status 1.
    pub fn crash_on_start(&self, program: &str) {
        self.lock().crashing_programs.insert(program.to_string());
    }

    // ── Forwarding ──────────────────────────────────────────────────────

    pub fn active_forwards(&self) -> Vec<ForwardSpec> {
        self.lock().active_forwards.clone()
    }

    pub fn forward_attempts(&self) -> usize {
        self.lock().forward_attempts
    }

    /// Forward attempts on `local_port` fail with `LocalPortInUse`.
    pub fn occupy_local_port(&self, local_port: u16) {
        self.lock().busy_local_ports.insert(local_port);
    }

    /// The next `times` streams to `container_port` drop right away.
    pub fn drop_streams(&self, container_port: u16, times: u32) {
        self.lock().stream_failures.insert(container_port, times);
    }

    // ── Workload ────────────────────────────────────────────────────────

    pub fn was_deleted(&self) -> bool {
        self.lock().deleted
    }

    pub fn applied(&self) -> Vec<(String, Option<String>)> {
        self.lock().applied.clone()
    }
}

#[derive(Debug, Default)]
pub struct MockPlatformBuilder {
    pod: Option<String>,
    exec_responses: Vec<(String, ExecOutput)>,
    exec_delay: Option<Duration>,
    logs: String,
}

impl MockPlatformBuilder {
    /// Start with a running pod named `pod`.
    pub fn target(mut self, pod: impl Into<String>) -> Self {
        self.pod = Some(pod.into());
        self
    }

    pub fn respond_to(mut self, pattern: impl Into<String>, output: ExecOutput) -> Self {
        self.exec_responses.push((pattern.into(), output));
        self
    }

    /// Every exec call sleeps this long before answering.
    pub fn exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = Some(delay);
        self
    }

    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    pub fn build(self) -> MockPlatform {
        let state = MockState {
            target: self.pod.map(|pod| TargetRef::new(pod, "uid-0")),
            exec_responses: self.exec_responses,
            exec_delay: self.exec_delay,
            next_pid: 100,
            logs: self.logs,
            ..MockState::default()
        };
        MockPlatform {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl RemoteExec for MockPlatform {
    async fn exec(
        &self,
        target: &TargetRef,
        container: &str,
        argv: &[String],
        _stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RemoteError> {
        let delay = self.lock().exec_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        Self::check_target(&state, target)?;
        let call = ExecCall {
            container: container.to_string(),
            argv: argv.to_vec(),
        };
        let line = call.line();
        state.exec_calls.push(call);
        let output = state
            .exec_responses
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default();
        Ok(output)
    }
}

#[async_trait]
impl FileTransport for MockPlatform {
    async fn ensure_dir(
        &self,
        target: &TargetRef,
        _container: &str,
        dir: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check_target(&state, target)?;
        state.dirs.insert(dir.trim_end_matches('/').to_string());
        Ok(())
    }

    async fn upload(
        &self,
        target: &TargetRef,
        _container: &str,
        remote_path: &str,
        content: Vec<u8>,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check_target(&state, target)?;
        *state
            .upload_attempts
            .entry(remote_path.to_string())
            .or_default() += 1;
        if state.failing_uploads.contains(remote_path) {
            return Err(RemoteError::CommandFailed {
                exit_code: 1,
                stderr: format!("cannot create {remote_path}: Permission denied"),
            });
        }
        if let Some(parent) = Path::new(remote_path).parent() {
            state.dirs.insert(parent.to_string_lossy().into_owned());
        }
        state.files.insert(remote_path.to_string(), content);
        Ok(())
    }

    async fn remove(
        &self,
        target: &TargetRef,
        _container: &str,
        remote_paths: &[String],
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check_target(&state, target)?;
        state.remove_calls.push(remote_paths.to_vec());
        for path in remote_paths {
            let prefix = format!("{path}/");
            state
                .files
                .retain(|p, _| p != path && !p.starts_with(&prefix));
            state
                .dirs
                .retain(|d| d != path && !d.starts_with(&prefix));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessBackend for MockPlatform {
    async fn start(
        &self,
        target: &TargetRef,
        _container: &str,
        spec: &ProcessSpec,
    ) -> Result<ProcessHandle, RemoteError> {
        let mut state = self.lock();
        Self::check_target(&state, target)?;
        let pid = state.next_pid;
        state.next_pid += 1;
        let crashes = state.crashing_programs.contains(&spec.program);
        if state.processes.get(&spec.program).is_some_and(|p| p.alive) {
            state.overlapping_starts.push(spec.program.clone());
        }
        state.processes.insert(
            spec.program.clone(),
            MockProcess {
                pid,
                command_line: spec.command_line.clone(),
                alive: !crashes,
                exit_code: crashes.then_some(1),
            },
        );
        state.start_history.push((spec.program.clone(), pid));
        Ok(ProcessHandle { pid })
    }

    async fn probe(
        &self,
        target: &TargetRef,
        _container: &str,
        program: &str,
    ) -> Result<ProbeResult, RemoteError> {
        let state = self.lock();
        Self::check_target(&state, target)?;
        Ok(match state.processes.get(program) {
            Some(p) => ProbeResult {
                pid: Some(p.pid),
                alive: p.alive,
                exit_code: p.exit_code,
            },
            None => ProbeResult::default(),
        })
    }

    async fn stop(
        &self,
        target: &TargetRef,
        _container: &str,
        program: &str,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        Self::check_target(&state, target)?;
        state.processes.remove(program);
        Ok(())
    }
}

#[async_trait]
impl PortForwarder for MockPlatform {
    async fn forward(
        &self,
        target: &TargetRef,
        spec: &ForwardSpec,
        cancel: CancellationToken,
    ) -> Result<(), RemoteError> {
        {
            let mut state = self.lock();
            state.forward_attempts += 1;
            Self::check_target(&state, target)?;
            if state.busy_local_ports.contains(&spec.local_port) {
                return Err(RemoteError::LocalPortInUse(spec.local_port));
            }
            if let Some(remaining) = state.stream_failures.get_mut(&spec.container_port)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(RemoteError::StreamClosed("connection reset".to_string()));
            }
            state.active_forwards.push(spec.clone());
        }

        cancel.cancelled().await;

        let mut state = self.lock();
        if let Some(pos) = state
            .active_forwards
            .iter()
            .position(|s| s.local_port == spec.local_port)
        {
            state.active_forwards.remove(pos);
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for MockPlatform {
    async fn current_target(&self) -> Result<Option<TargetRef>, RemoteError> {
        Ok(self.lock().target.clone())
    }

    async fn delete(&self) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.deleted = true;
        state.target = None;
        state.processes.clear();
        Ok(())
    }

    async fn apply(&self, component: &str, uri: Option<&Path>) -> Result<ExecOutput, RemoteError> {
        self.lock().applied.push((
            component.to_string(),
            uri.map(|u| u.to_string_lossy().into_owned()),
        ));
        Ok(ExecOutput::ok(format!("{component} configured")))
    }

    async fn logs(&self, _container: &str, _follow: bool) -> Result<String, RemoteError> {
        Ok(self.lock().logs.clone())
    }
}
