//! Cluster collaborators backed by the `kubectl` binary.
//!
//! Every call spawns a `kubectl` child with `kill_on_drop`, so dropping the
//! future (cancellation) also kills the child. Pods are found by the
//! `component=<name>` label.

use crate::supervisor::ShellProcessBackend;
use crate::sync::ShellTransport;
use async_trait::async_trait;
use devloop_common::remote::{
    ExecOutput, ForwardSpec, Platform, PortForwarder, RemoteError, RemoteExec, TargetRef, Workload,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Label selecting the pods of a component.
pub const COMPONENT_LABEL: &str = "component";

const RUNNING_PODS_JSONPATH: &str =
    r#"{range .items[?(@.status.phase=="Running")]}{.metadata.name} {.metadata.uid}{"\n"}{end}"#;

pub struct KubectlPlatform {
    kubectl: PathBuf,
    namespace: Option<String>,
    component: String,
}

impl KubectlPlatform {
    /// Locate `kubectl` and build a platform for `component`.
    pub fn new(
        kubectl: &Path,
        namespace: Option<String>,
        component: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        let kubectl = which::which(kubectl)
            .map_err(|_| RemoteError::ClientMissing(kubectl.display().to_string()))?;
        debug!(kubectl = %kubectl.display(), "Using kubectl");
        Ok(Self {
            kubectl,
            namespace,
            component: component.into(),
        })
    }

    /// All collaborator handles, with files and processes going over exec.
    pub fn into_platform(self, shared_dir: &str) -> Platform {
        let shared = Arc::new(self);
        let files = Arc::new(ShellTransport::new(shared.clone()));
        let processes = Arc::new(ShellProcessBackend::new(shared.clone(), shared_dir));
        Platform {
            exec: shared.clone(),
            files,
            processes,
            forwarder: shared.clone(),
            workload: shared,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.kubectl);
        if let Some(ns) = &self.namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn selector(&self) -> String {
        format!("{COMPONENT_LABEL}={}", self.component)
    }

    async fn output(&self, mut cmd: Command, stdin: Option<Vec<u8>>) -> Result<ExecOutput, RemoteError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(&input)
                .await
                .map_err(|e| RemoteError::Transport(format!("writing stdin: {e}")))?;
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_error(&self, err: std::io::Error) -> RemoteError {
        if err.kind() == std::io::ErrorKind::NotFound {
            RemoteError::ClientMissing(self.kubectl.display().to_string())
        } else {
            RemoteError::Transport(format!("failed to spawn kubectl: {err}"))
        }
    }
}

/// Line prefixes kubectl itself uses when it cannot reach the container.
const TRANSPORT_PREFIXES: [&str; 4] = [
    "error: unable to upgrade connection",
    "Error from server: error dialing backend",
    "The connection to the server",
    "Unable to connect to the server",
];

/// Classify kubectl's own failures (as opposed to the remote command's).
/// Only lines in kubectl's message format are considered.
fn classify_stderr(target: &TargetRef, stderr: &str) -> Option<RemoteError> {
    let missing_pod = format!("pods \"{}\" not found", target.pod);
    for line in stderr.lines().map(str::trim_start) {
        if line.starts_with("Error from server (NotFound)") || line.contains(&missing_pod) {
            return Some(RemoteError::TargetGone(target.pod.clone()));
        }
        if TRANSPORT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            return Some(RemoteError::Transport(stderr.trim().to_string()));
        }
    }
    None
}

/// First running pod from the jsonpath listing.
fn parse_running_pods(stdout: &str) -> Option<TargetRef> {
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(pod), Some(uid)) => Some(TargetRef::new(pod, uid)),
            _ => None,
        }
    })
}

fn bind_conflict(stderr: &str, local_port: u16) -> bool {
    stderr.contains("address already in use") || stderr.contains(&format!("bind: {local_port}"))
}

#[async_trait]
impl RemoteExec for KubectlPlatform {
    async fn exec(
        &self,
        target: &TargetRef,
        container: &str,
        argv: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, RemoteError> {
        let mut cmd = self.command();
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.arg(&target.pod).arg("-c").arg(container).arg("--").args(argv);

        let output = self.output(cmd, stdin).await?;
        if !output.success()
            && let Some(err) = classify_stderr(target, &output.stderr)
        {
            return Err(err);
        }
        Ok(output)
    }
}

#[async_trait]
impl PortForwarder for KubectlPlatform {
    async fn forward(
        &self,
        target: &TargetRef,
        spec: &ForwardSpec,
        cancel: CancellationToken,
    ) -> Result<(), RemoteError> {
        let mut cmd = self.command();
        cmd.arg("port-forward")
            .arg(format!("pod/{}", target.pod))
            .arg(format!("{}:{}", spec.local_port, spec.container_port))
            .arg("--address")
            .arg(crate::tunnel::LOCAL_ADDRESS)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let mut stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Ok(());
            }
            status = child.wait() => status.map_err(|e| RemoteError::Transport(e.to_string()))?,
        };

        let stderr = stderr_task.await.unwrap_or_default();
        debug!(status = %status, stderr = %stderr.trim(), "port-forward exited");
        if bind_conflict(&stderr, spec.local_port) {
            return Err(RemoteError::LocalPortInUse(spec.local_port));
        }
        if let Some(err) = classify_stderr(target, &stderr) {
            return Err(err);
        }
        Err(RemoteError::StreamClosed(if stderr.trim().is_empty() {
            format!("kubectl port-forward exited with {status}")
        } else {
            stderr.trim().to_string()
        }))
    }
}

#[async_trait]
impl Workload for KubectlPlatform {
    async fn current_target(&self) -> Result<Option<TargetRef>, RemoteError> {
        let mut cmd = self.command();
        cmd.args(["get", "pods", "-l"])
            .arg(self.selector())
            .arg("-o")
            .arg(format!("jsonpath={RUNNING_PODS_JSONPATH}"));
        let output = self.output(cmd, None).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_running_pods(&output.stdout))
    }

    async fn delete(&self) -> Result<(), RemoteError> {
        let mut cmd = self.command();
        cmd.args(["delete", "deployment,service", "-l"])
            .arg(self.selector())
            .arg("--ignore-not-found")
            .arg("--wait=false");
        let output = self.output(cmd, None).await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        info!(component = %self.component, "Workload deleted");
        Ok(())
    }

    async fn apply(&self, component: &str, uri: Option<&Path>) -> Result<ExecOutput, RemoteError> {
        let Some(uri) = uri else {
            return Ok(ExecOutput::failed(
                1,
                format!("apply command for {component} has no manifest uri"),
            ));
        };
        let mut cmd = self.command();
        cmd.arg("apply").arg("-f").arg(uri);
        self.output(cmd, None).await
    }

    async fn logs(&self, container: &str, follow: bool) -> Result<String, RemoteError> {
        let target = self
            .current_target()
            .await?
            .ok_or_else(|| RemoteError::TargetGone(self.component.clone()))?;
        let mut cmd = self.command();
        cmd.arg("logs").arg(&target.pod).arg("-c").arg(container);
        if follow {
            cmd.arg("--follow")
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            let status = cmd
                .spawn()
                .map_err(|e| self.spawn_error(e))?
                .wait()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;
            debug!(%status, "kubectl logs exited");
            return Ok(String::new());
        }
        let output = self.output(cmd, None).await?;
        if !output.success() {
            return Err(classify_stderr(&target, &output.stderr).unwrap_or(
                RemoteError::CommandFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                },
            ));
        }
        Ok(output.stdout)
    }
}
