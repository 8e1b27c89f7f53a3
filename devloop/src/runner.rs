//! Command group resolution, composite planning and execution.
//!
//! Resolution enforces exactly one default command per invoked group.
//! Composite commands flatten depth-first into an [`ExecutionPlan`] of
//! leaves; execution stops at the first failing leaf and marks the rest
//! skipped. Leaves in `run`/`debug` context start supervised programs
//! subject to the restart policy.

use crate::events::{EventBus, SessionEvent};
use crate::supervisor::{ProcessSupervisor, ProgramState, SupervisorError};
use devloop_common::ErrorCode;
use devloop_common::manifest::{Command, CommandGroup, CommandKind, ExecSpec, Manifest};
pub use devloop_common::manifest::program_name;
use devloop_common::remote::{Platform, ProcessSpec, RemoteError, TargetRef};
use devloop_common::util::{mask_sensitive_command, shell_quote};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of container log attached to a failed supervised start.
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("composite command \"{composite}\" references unknown command \"{child}\"")]
    UnknownChild { composite: String, child: String },

    #[error("composite commands form a cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no command of kind \"{0}\" found")]
    GroupNotFound(CommandGroup),

    #[error(
        "there should be exactly one default command for command group {0}, currently there is no default command"
    )]
    NoDefaultCommand(CommandGroup),

    #[error(
        "there should be exactly one default command for command group {0}, currently there is more than one default command"
    )]
    AmbiguousDefault(CommandGroup),

    #[error("the command \"{0}\" is not found in the manifest")]
    CommandNotFound(String),

    #[error("command \"{name}\" belongs to group {}, not {expected}", actual.map(|g| g.to_string()).unwrap_or_else(|| "none".to_string()))]
    GroupMismatch {
        name: String,
        expected: CommandGroup,
        actual: Option<CommandGroup>,
    },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("{}", with_stderr(message, stderr))]
    ExecutionFailed {
        command: String,
        message: String,
        stderr: String,
    },

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

fn with_stderr(message: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message.to_string()
    } else {
        format!("{message}\n{stderr}")
    }
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::GroupNotFound(_) => ErrorCode::CommandGroupNotFound,
            Self::NoDefaultCommand(_) => ErrorCode::CommandNoDefault,
            Self::AmbiguousDefault(_) => ErrorCode::CommandAmbiguousDefault,
            Self::CommandNotFound(_) => ErrorCode::CommandNotFound,
            Self::GroupMismatch { .. } => ErrorCode::CommandGroupMismatch,
            Self::Plan(_) => ErrorCode::CommandPlanError,
            Self::ExecutionFailed { .. } => ErrorCode::CommandExecutionFailed,
            Self::Supervisor(e) => e.code(),
        }
    }
}

// ── Resolution and planning ─────────────────────────────────────────────

/// The manifest's commands, indexed by case-insensitive id.
#[derive(Debug, Clone)]
pub struct CommandSet {
    commands: Vec<Command>,
    by_key: HashMap<String, usize>,
}

impl CommandSet {
    pub fn new(commands: Vec<Command>) -> Self {
        let by_key = commands
            .iter()
            .enumerate()
            .map(|(i, c)| (c.key(), i))
            .collect();
        Self { commands, by_key }
    }

    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self::new(manifest.commands.clone())
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.by_key
            .get(&name.to_lowercase())
            .map(|&i| &self.commands[i])
    }

    pub fn has_group(&self, group: CommandGroup) -> bool {
        self.commands.iter().any(|c| c.group == Some(group))
    }

    /// The single default command of `group`.
    pub fn resolve(&self, group: CommandGroup) -> Result<&Command, CommandError> {
        let in_group: Vec<&Command> = self
            .commands
            .iter()
            .filter(|c| c.group == Some(group))
            .collect();
        if in_group.is_empty() {
            return Err(CommandError::GroupNotFound(group));
        }
        let mut defaults = in_group.into_iter().filter(|c| c.is_default);
        match (defaults.next(), defaults.next()) {
            (Some(command), None) => Ok(command),
            (None, _) => Err(CommandError::NoDefaultCommand(group)),
            (Some(_), Some(_)) => Err(CommandError::AmbiguousDefault(group)),
        }
    }

    /// An explicitly named command of `group`, default or not.
    pub fn resolve_named(&self, group: CommandGroup, name: &str) -> Result<&Command, CommandError> {
        let command = self
            .get(name)
            .ok_or_else(|| CommandError::CommandNotFound(name.to_string()))?;
        match command.group {
            Some(g) if g == group => Ok(command),
            None if matches!(command.kind, CommandKind::Composite { .. }) => Ok(command),
            actual => Err(CommandError::GroupMismatch {
                name: command.id.clone(),
                expected: group,
                actual,
            }),
        }
    }

    /// Either the named command or the group default.
    pub fn resolve_with(
        &self,
        group: CommandGroup,
        name: Option<&str>,
    ) -> Result<&Command, CommandError> {
        match name {
            Some(name) => self.resolve_named(group, name),
            None => self.resolve(group),
        }
    }

    /// Flatten `command` into its leaves, depth-first in declaration order.
    pub fn plan(&self, command: &Command) -> Result<ExecutionPlan, PlanError> {
        let mut steps = Vec::new();
        let mut path = Vec::new();
        self.flatten(command, &mut path, &mut steps)?;
        Ok(ExecutionPlan {
            root: command.id.clone(),
            steps,
        })
    }

    fn flatten(
        &self,
        command: &Command,
        path: &mut Vec<String>,
        steps: &mut Vec<PlanStep>,
    ) -> Result<(), PlanError> {
        let key = command.key();
        if path.iter().any(|p| p.to_lowercase() == key) {
            let mut cycle = path.clone();
            cycle.push(command.id.clone());
            return Err(PlanError::Cycle { path: cycle });
        }

        match &command.kind {
            CommandKind::Exec(spec) => steps.push(PlanStep {
                id: command.id.clone(),
                group: command.group,
                action: StepAction::Exec(spec.clone()),
            }),
            CommandKind::Apply { component, uri } => steps.push(PlanStep {
                id: command.id.clone(),
                group: command.group,
                action: StepAction::Apply {
                    component: component.clone(),
                    uri: uri.clone(),
                },
            }),
            CommandKind::Composite { commands } => {
                path.push(command.id.clone());
                for child in commands {
                    let resolved = self.get(child).ok_or_else(|| PlanError::UnknownChild {
                        composite: command.id.clone(),
                        child: child.clone(),
                    })?;
                    self.flatten(resolved, path, steps)?;
                }
                path.pop();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Exec(ExecSpec),
    Apply {
        component: String,
        uri: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub id: String,
    /// The leaf's own group, when declared.
    pub group: Option<CommandGroup>,
    pub action: StepAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub root: String,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}

// ── Reports ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// A hot-reload-capable program was left running.
    Unchanged,
    Failed { message: String, stderr: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub id: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
    pub stdout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub steps: Vec<StepReport>,
    /// The target disappeared during execution.
    #[serde(skip)]
    pub target_gone: bool,
}

impl ExecutionReport {
    pub fn succeeded(&self) -> bool {
        self.first_failure().is_none()
    }

    pub fn first_failure(&self) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|s| matches!(s.outcome, StepOutcome::Failed { .. }))
    }

    pub fn outcome_of(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.id == id).map(|s| &s.outcome)
    }

    /// The first failure as an error, if any.
    pub fn error(&self) -> Option<CommandError> {
        self.first_failure().and_then(|step| match &step.outcome {
            StepOutcome::Failed { message, stderr } => Some(CommandError::ExecutionFailed {
                command: step.id.clone(),
                message: message.clone(),
                stderr: stderr.clone(),
            }),
            _ => None,
        })
    }

    fn extend(&mut self, other: ExecutionReport) {
        self.target_gone |= other.target_gone;
        self.steps.extend(other.steps);
    }

    fn skip_all(&mut self, plan: &ExecutionPlan) {
        self.steps.extend(plan.steps.iter().map(|s| StepReport {
            id: s.id.clone(),
            outcome: StepOutcome::Skipped,
            stdout: String::new(),
        }));
    }
}

// ── Execution ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecContext {
    pub group: CommandGroup,
}

/// Options for the build-then-run pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineRequest {
    pub debug: bool,
    pub build_command: Option<String>,
    pub run_command: Option<String>,
}

/// Start verification for supervised leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCheck {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for StartCheck {
    fn default() -> Self {
        Self {
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct CommandRunner {
    commands: CommandSet,
    platform: Platform,
    supervisor: Arc<ProcessSupervisor>,
    events: EventBus,
    root: PathBuf,
    default_workdir: String,
    start_check: StartCheck,
}

impl CommandRunner {
    pub fn new(
        commands: CommandSet,
        platform: Platform,
        supervisor: Arc<ProcessSupervisor>,
        events: EventBus,
        root: impl Into<PathBuf>,
        default_workdir: impl Into<String>,
    ) -> Self {
        Self {
            commands,
            platform,
            supervisor,
            events,
            root: root.into(),
            default_workdir: default_workdir.into(),
            start_check: StartCheck::default(),
        }
    }

    pub fn with_start_check(mut self, start_check: StartCheck) -> Self {
        self.start_check = start_check;
        self
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Build group (if declared), then run or debug.
    pub async fn run_pipeline(
        &self,
        target: &TargetRef,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, CommandError> {
        let build = match self
            .commands
            .resolve_with(CommandGroup::Build, request.build_command.as_deref())
        {
            Ok(command) => Some(self.commands.plan(command)?),
            Err(CommandError::GroupNotFound(_)) if request.build_command.is_none() => {
                debug!("No build command declared, skipping build");
                None
            }
            Err(e) => return Err(e),
        };

        let run_group = if request.debug {
            CommandGroup::Debug
        } else {
            CommandGroup::Run
        };
        let run_command = self
            .commands
            .resolve_with(run_group, request.run_command.as_deref())?;
        let run = self.commands.plan(run_command)?;

        let mut report = ExecutionReport::default();
        if let Some(build) = build {
            let build_report = self
                .execute(target, &build, ExecContext { group: CommandGroup::Build }, cancel)
                .await;
            let failed = !build_report.succeeded();
            report.extend(build_report);
            if failed {
                report.skip_all(&run);
                return Ok(report);
            }
        }

        let run_report = self
            .execute(target, &run, ExecContext { group: run_group }, cancel)
            .await;
        report.extend(run_report);
        Ok(report)
    }

    /// Resolve and execute the test group.
    pub async fn run_tests(
        &self,
        target: &TargetRef,
        name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, CommandError> {
        let command = self.commands.resolve_with(CommandGroup::Test, name)?;
        let plan = self.commands.plan(command)?;
        Ok(self
            .execute(target, &plan, ExecContext { group: CommandGroup::Test }, cancel)
            .await)
    }

    /// Execute every leaf of `plan` in order, skipping the rest after the
    /// first failure or a cancellation.
    pub async fn execute(
        &self,
        target: &TargetRef,
        plan: &ExecutionPlan,
        ctx: ExecContext,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let mut halted = false;

        for step in &plan.steps {
            if halted || cancel.is_cancelled() {
                report.steps.push(StepReport {
                    id: step.id.clone(),
                    outcome: StepOutcome::Skipped,
                    stdout: String::new(),
                });
                continue;
            }

            info!("Executing {} command", step.id);
            self.events.emit(SessionEvent::Executing {
                command: step.id.clone(),
            });

            let (outcome, stdout) = match self.run_step(target, step, ctx, cancel).await {
                Ok(result) => result,
                Err(e) => {
                    if matches!(e, RemoteError::TargetGone(_)) {
                        report.target_gone = true;
                    }
                    let message = format!("command \"{}\" failed: {e}", step.id);
                    (
                        StepOutcome::Failed {
                            message,
                            stderr: String::new(),
                        },
                        String::new(),
                    )
                }
            };

            if let StepOutcome::Failed { message, stderr } = &outcome {
                warn!(command = %step.id, "{}", message);
                self.events.emit(SessionEvent::CommandFailed {
                    command: step.id.clone(),
                    message: message.clone(),
                    stderr: stderr.clone(),
                });
                halted = true;
            }
            report.steps.push(StepReport {
                id: step.id.clone(),
                outcome,
                stdout,
            });
        }
        report
    }

    async fn run_step(
        &self,
        target: &TargetRef,
        step: &PlanStep,
        ctx: ExecContext,
        cancel: &CancellationToken,
    ) -> Result<(StepOutcome, String), RemoteError> {
        match &step.action {
            StepAction::Apply { component, uri } => {
                let uri = uri.as_ref().map(|u| self.root.join(u));
                let output = self.platform.workload.apply(component, uri.as_deref()).await?;
                Ok(exit_outcome(&step.id, output.exit_code, output.stderr, output.stdout))
            }
            StepAction::Exec(spec) => {
                let supervised = step.group.unwrap_or(ctx.group).is_supervised();
                if supervised {
                    self.run_supervised(target, &step.id, spec, cancel).await
                } else {
                    self.run_sync(target, &step.id, spec, cancel).await
                }
            }
        }
    }

    /// `cd <workdir> && KEY=VAL ... <command_line>`
    pub fn shell_line(&self, spec: &ExecSpec) -> String {
        let workdir = spec
            .working_dir
            .as_deref()
            .unwrap_or(&self.default_workdir);
        let mut line = format!("cd {} && ", shell_quote(workdir));
        for var in &spec.env {
            line.push_str(&format!("{}={} ", var.name, shell_quote(&var.value)));
        }
        line.push_str(&spec.command_line);
        line
    }

    async fn run_sync(
        &self,
        target: &TargetRef,
        id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<(StepOutcome, String), RemoteError> {
        let line = self.shell_line(spec);
        debug!(command = id, line = %mask_sensitive_command(&line), "Running command");
        let argv = vec!["sh".to_string(), "-c".to_string(), line];
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
            r = self.platform.exec.exec(target, &spec.component, &argv, None) => r?,
        };
        Ok(exit_outcome(id, output.exit_code, output.stderr, output.stdout))
    }

    async fn run_supervised(
        &self,
        target: &TargetRef,
        id: &str,
        spec: &ExecSpec,
        cancel: &CancellationToken,
    ) -> Result<(StepOutcome, String), RemoteError> {
        let program = program_name(id);
        let process = ProcessSpec {
            program: program.clone(),
            command_line: spec.command_line.clone(),
            working_dir: Some(
                spec.working_dir
                    .clone()
                    .unwrap_or_else(|| self.default_workdir.clone()),
            ),
            env: spec.env.clone(),
        };

        if self.supervisor.is_registered_on(&program, target) {
            let unchanged = self.supervisor.registered(&program).as_ref() == Some(&process);
            if spec.hot_reload_capable && unchanged {
                let running = matches!(
                    self.supervisor.status_of(&program).await,
                    Ok(status) if status.state == ProgramState::Running
                );
                if running {
                    debug!(program = %program, "Hot-reload capable program left running");
                    return Ok((StepOutcome::Unchanged, String::new()));
                }
            }
            self.supervisor.stop(&program).await.map_err(into_remote)?;
        } else {
            // Not started by this process: an earlier invocation may have
            // left a copy running on the target.
            self.supervisor
                .stop_stale(target, &spec.component, &program)
                .await
                .map_err(into_remote)?;
        }

        self.supervisor
            .start(target, &spec.component, process)
            .await
            .map_err(into_remote)?;

        let status = self
            .supervisor
            .wait_running(
                &program,
                self.start_check.attempts,
                self.start_check.interval,
                cancel,
            )
            .await
            .map_err(into_remote)?;
        if status.state == ProgramState::Running {
            return Ok((StepOutcome::Succeeded, String::new()));
        }

        let stderr = match self.platform.workload.logs(&spec.component, false).await {
            Ok(logs) => tail(&logs, LOG_TAIL_LINES),
            Err(e) => {
                debug!("Cannot fetch logs for failed start: {}", e);
                String::new()
            }
        };
        Ok((
            StepOutcome::Failed {
                message: format!("command \"{id}\" exited with an error status"),
                stderr,
            },
            String::new(),
        ))
    }
}

fn exit_outcome(id: &str, exit_code: i32, stderr: String, stdout: String) -> (StepOutcome, String) {
    if exit_code == 0 {
        (StepOutcome::Succeeded, stdout)
    } else {
        (
            StepOutcome::Failed {
                message: format!("command \"{id}\" exited with an error status"),
                stderr,
            },
            stdout,
        )
    }
}

fn into_remote(err: SupervisorError) -> RemoteError {
    match err {
        SupervisorError::Remote { source, .. } => source,
        other => RemoteError::Transport(other.to_string()),
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use devloop_common::manifest::EnvVar;
    use devloop_common::mock::MockPlatform;
    use devloop_common::remote::ExecOutput;

    fn exec(id: &str, group: Option<CommandGroup>, default: bool, line: &str) -> Command {
        Command {
            id: id.to_string(),
            group,
            is_default: default,
            kind: CommandKind::Exec(ExecSpec {
                component: "runtime".to_string(),
                command_line: line.to_string(),
                working_dir: None,
                hot_reload_capable: false,
                env: Vec::new(),
            }),
        }
    }

    fn composite(id: &str, group: Option<CommandGroup>, children: &[&str]) -> Command {
        Command {
            id: id.to_string(),
            group,
            is_default: true,
            kind: CommandKind::Composite {
                commands: children.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    fn runner(mock: &MockPlatform, commands: Vec<Command>) -> CommandRunner {
        let platform = mock.platform();
        let supervisor = Arc::new(ProcessSupervisor::new(platform.processes.clone()));
        CommandRunner::new(
            CommandSet::new(commands),
            platform,
            supervisor,
            EventBus::default(),
            "/tmp/project",
            "/projects",
        )
        .with_start_check(StartCheck {
            attempts: 3,
            interval: Duration::from_millis(10),
        })
    }

    #[test]
    fn test_resolve_requires_exactly_one_default() {
        let set = CommandSet::new(vec![
            exec("test1", Some(CommandGroup::Test), true, "npm test"),
            exec("test2", Some(CommandGroup::Test), false, "npm run e2e"),
        ]);
        assert_eq!(set.resolve(CommandGroup::Test).unwrap().id, "test1");
        assert_eq!(
            set.resolve_named(CommandGroup::Test, "test2").unwrap().id,
            "test2"
        );

        let none = CommandSet::new(vec![exec("b", Some(CommandGroup::Build), false, "make")]);
        let err = none.resolve(CommandGroup::Build).unwrap_err();
        assert_eq!(
            err.to_string(),
            "there should be exactly one default command for command group build, currently there is no default command"
        );
        assert_eq!(err.code(), ErrorCode::CommandNoDefault);

        let two = CommandSet::new(vec![
            exec("b1", Some(CommandGroup::Build), true, "make"),
            exec("b2", Some(CommandGroup::Build), true, "make all"),
        ]);
        let err = two.resolve(CommandGroup::Build).unwrap_err();
        assert!(err.to_string().ends_with("more than one default command"));
        assert_eq!(err.code(), ErrorCode::CommandAmbiguousDefault);
    }

    #[test]
    fn test_missing_group_and_unknown_name() {
        let set = CommandSet::new(vec![exec("run", Some(CommandGroup::Run), true, "npm start")]);
        assert_eq!(
            set.resolve(CommandGroup::Debug).unwrap_err().to_string(),
            "no command of kind \"debug\" found"
        );
        assert_eq!(
            set.resolve_named(CommandGroup::Run, "nope")
                .unwrap_err()
                .to_string(),
            "the command \"nope\" is not found in the manifest"
        );
        let err = set.resolve_named(CommandGroup::Build, "RUN").unwrap_err();
        assert!(matches!(err, CommandError::GroupMismatch { .. }));
    }

    #[test]
    fn test_ungrouped_composite_can_be_named() {
        let set = CommandSet::new(vec![
            exec("a", Some(CommandGroup::Build), false, "make a"),
            composite("all", None, &["a"]),
        ]);
        assert_eq!(set.resolve_named(CommandGroup::Build, "all").unwrap().id, "all");
    }

    #[test]
    fn test_plan_flattens_depth_first() {
        let set = CommandSet::new(vec![
            exec("a", None, false, "a"),
            exec("b", None, false, "b"),
            exec("c", None, false, "c"),
            composite("inner", None, &["b", "c"]),
            composite("outer", Some(CommandGroup::Build), &["a", "inner", "a"]),
        ]);
        let plan = set.plan(set.get("outer").unwrap()).unwrap();
        assert_eq!(plan.ids(), vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_plan_errors() {
        let set = CommandSet::new(vec![
            composite("x", None, &["y"]),
            composite("y", None, &["x"]),
            composite("broken", None, &["ghost"]),
        ]);
        assert_eq!(
            set.plan(set.get("x").unwrap()).unwrap_err(),
            PlanError::Cycle {
                path: vec!["x".to_string(), "y".to_string(), "x".to_string()]
            }
        );
        assert_eq!(
            set.plan(set.get("broken").unwrap()).unwrap_err(),
            PlanError::UnknownChild {
                composite: "broken".to_string(),
                child: "ghost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_composite_short_circuits_after_failure() {
        let mock = MockPlatform::builder()
            .target("web")
            .respond_to("step-b", ExecOutput::failed(2, "boom"))
            .build();
        let target = mock.target().unwrap();
        let runner = runner(
            &mock,
            vec![
                exec("A", None, false, "step-a"),
                exec("B", None, false, "step-b"),
                exec("C", None, false, "step-c"),
                composite("all", Some(CommandGroup::Build), &["A", "B", "C"]),
            ],
        );

        let plan = runner.commands().plan(runner.commands().get("all").unwrap()).unwrap();
        let report = runner
            .execute(
                &target,
                &plan,
                ExecContext {
                    group: CommandGroup::Build,
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.outcome_of("A"), Some(&StepOutcome::Succeeded));
        assert!(matches!(
            report.outcome_of("B"),
            Some(StepOutcome::Failed { message, stderr })
                if message == "command \"B\" exited with an error status" && stderr == "boom"
        ));
        assert_eq!(report.outcome_of("C"), Some(&StepOutcome::Skipped));
        assert!(!mock.exec_calls().iter().any(|c| c.line().contains("step-c")));

        let err = report.error().unwrap();
        assert_eq!(err.code(), ErrorCode::CommandExecutionFailed);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_sync_leaf_shell_line() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let mut build = exec("build", Some(CommandGroup::Build), true, "npm install");
        if let CommandKind::Exec(spec) = &mut build.kind {
            spec.working_dir = Some("/projects/app".to_string());
            spec.env = vec![EnvVar {
                name: "NODE_ENV".to_string(),
                value: "dev mode".to_string(),
            }];
        }
        let runner = runner(&mock, vec![build]);
        let report = runner
            .run_tests(&target, None, &CancellationToken::new())
            .await;
        assert!(matches!(report, Err(CommandError::GroupNotFound(CommandGroup::Test))));

        let plan = runner.commands().plan(runner.commands().get("build").unwrap()).unwrap();
        runner
            .execute(
                &target,
                &plan,
                ExecContext {
                    group: CommandGroup::Build,
                },
                &CancellationToken::new(),
            )
            .await;
        let calls = mock.exec_calls();
        assert_eq!(calls[0].container, "runtime");
        assert_eq!(
            calls[0].argv,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "cd /projects/app && NODE_ENV='dev mode' npm install".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_named_test_command_runs_regardless_of_default() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let runner = runner(
            &mock,
            vec![
                exec("test1", Some(CommandGroup::Test), true, "npm test"),
                exec("test2", Some(CommandGroup::Test), false, "npm run e2e"),
            ],
        );
        let report = runner
            .run_tests(&target, Some("test2"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.succeeded());
        assert_eq!(report.steps.len(), 1);
        assert!(mock.exec_calls()[0].line().contains("npm run e2e"));
    }

    #[tokio::test]
    async fn test_restart_policy_across_cycles() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let mut hot = exec("watch", Some(CommandGroup::Run), true, "nodemon app.js");
        if let CommandKind::Exec(spec) = &mut hot.kind {
            spec.hot_reload_capable = true;
        }
        let request = PipelineRequest::default();
        let cancel = CancellationToken::new();

        let cold_runner = runner(&mock, vec![exec("run", Some(CommandGroup::Run), true, "node app.js")]);
        cold_runner.run_pipeline(&target, &request, &cancel).await.unwrap();
        let first = mock.process("run").unwrap().pid;
        cold_runner.run_pipeline(&target, &request, &cancel).await.unwrap();
        let second = mock.process("run").unwrap();
        assert_ne!(first, second.pid);
        assert!(second.alive);

        let hot_runner = runner(&mock, vec![hot]);
        hot_runner.run_pipeline(&target, &request, &cancel).await.unwrap();
        let first = mock.process("watch").unwrap().pid;
        let report = hot_runner.run_pipeline(&target, &request, &cancel).await.unwrap();
        assert_eq!(report.outcome_of("watch"), Some(&StepOutcome::Unchanged));
        assert_eq!(mock.process("watch").unwrap().pid, first);
        assert_eq!(mock.start_count("watch"), 1);
    }

    #[tokio::test]
    async fn test_fresh_runner_replaces_program_left_by_earlier_run() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let commands = vec![exec("run", Some(CommandGroup::Run), true, "node app.js")];
        let cancel = CancellationToken::new();

        runner(&mock, commands.clone())
            .run_pipeline(&target, &PipelineRequest::default(), &cancel)
            .await
            .unwrap();
        // A separate invocation knows nothing of the first supervisor.
        runner(&mock, commands)
            .run_pipeline(&target, &PipelineRequest::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(mock.start_count("run"), 2);
        assert!(mock.overlapping_starts().is_empty());
        assert!(mock.process("run").unwrap().alive);
    }

    #[tokio::test]
    async fn test_shell_backed_runners_stop_leftover_before_start() {
        let mock = MockPlatform::builder()
            .target("web")
            .respond_to("cat /opt/devloop/.devloop_cmd_run.pid", ExecOutput::ok("77\n"))
            .build();
        let target = mock.target().unwrap();
        let commands = vec![exec("run", Some(CommandGroup::Run), true, "node app.js")];
        let shell_runner = || {
            let mut platform = mock.platform();
            let backend: Arc<dyn devloop_common::remote::ProcessBackend> = Arc::new(
                crate::supervisor::ShellProcessBackend::new(platform.exec.clone(), "/opt/devloop"),
            );
            platform.processes = backend.clone();
            CommandRunner::new(
                CommandSet::new(commands.clone()),
                platform,
                Arc::new(ProcessSupervisor::new(backend)),
                EventBus::default(),
                "/tmp/project",
                "/projects",
            )
            .with_start_check(StartCheck {
                attempts: 3,
                interval: Duration::from_millis(10),
            })
        };
        let cancel = CancellationToken::new();

        let report = shell_runner()
            .run_pipeline(&target, &PipelineRequest::default(), &cancel)
            .await
            .unwrap();
        assert!(report.succeeded());

        let before = mock.exec_calls().len();
        let report = shell_runner()
            .run_pipeline(&target, &PipelineRequest::default(), &cancel)
            .await
            .unwrap();
        assert!(report.succeeded());

        let lines: Vec<String> = mock.exec_calls()[before..]
            .iter()
            .map(|c| c.line())
            .collect();
        let stop = lines
            .iter()
            .position(|l| l.contains("kill $pid") && l.ends_with("; true"))
            .expect("leftover program stopped");
        let prepare = lines
            .iter()
            .position(|l| l.starts_with("sh -c mkdir -p /opt/devloop"))
            .expect("start prepared");
        assert!(stop < prepare, "{lines:#?}");
    }

    #[tokio::test]
    async fn test_hot_reload_program_restarts_when_dead() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let mut hot = exec("watch", Some(CommandGroup::Run), true, "nodemon app.js");
        if let CommandKind::Exec(spec) = &mut hot.kind {
            spec.hot_reload_capable = true;
        }
        let runner = runner(&mock, vec![hot]);
        let cancel = CancellationToken::new();
        runner
            .run_pipeline(&target, &PipelineRequest::default(), &cancel)
            .await
            .unwrap();

        mock.kill_program("watch", 1);
        runner
            .run_pipeline(&target, &PipelineRequest::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(mock.start_count("watch"), 2);
        assert!(mock.process("watch").unwrap().alive);
    }

    #[tokio::test]
    async fn test_crashing_run_command_reports_logs() {
        let mock = MockPlatform::builder()
            .target("web")
            .logs("listening\nError: Cannot find module 'express'")
            .build();
        mock.crash_on_start("run");
        let target = mock.target().unwrap();
        let runner = runner(&mock, vec![exec("run", Some(CommandGroup::Run), true, "node app.js")]);

        let report = runner
            .run_pipeline(&target, &PipelineRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        match report.outcome_of("run") {
            Some(StepOutcome::Failed { message, stderr }) => {
                assert_eq!(message, "command \"run\" exited with an error status");
                assert!(stderr.contains("Cannot find module"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pipeline_runs_build_then_run_and_skips_run_on_build_failure() {
        let mock = MockPlatform::builder()
            .target("web")
            .respond_to("npm install", ExecOutput::failed(1, "ERESOLVE"))
            .build();
        let target = mock.target().unwrap();
        let runner = runner(
            &mock,
            vec![
                exec("install", Some(CommandGroup::Build), true, "npm install"),
                exec("run", Some(CommandGroup::Run), true, "npm start"),
            ],
        );
        let report = runner
            .run_pipeline(&target, &PipelineRequest::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.outcome_of("run"), Some(&StepOutcome::Skipped));
        assert_eq!(mock.start_count("run"), 0);
    }

    #[tokio::test]
    async fn test_debug_pipeline_requires_debug_group() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let runner = runner(&mock, vec![exec("run", Some(CommandGroup::Run), true, "npm start")]);
        let request = PipelineRequest {
            debug: true,
            ..PipelineRequest::default()
        };
        let err = runner
            .run_pipeline(&target, &request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no command of kind \"debug\" found");
        assert!(mock.exec_calls().is_empty());
    }

    #[tokio::test]
    async fn test_build_configuration_error_is_surfaced() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let runner = runner(
            &mock,
            vec![
                exec("b1", Some(CommandGroup::Build), false, "make"),
                exec("run", Some(CommandGroup::Run), true, "npm start"),
            ],
        );
        let err = runner
            .run_pipeline(&target, &PipelineRequest::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::NoDefaultCommand(CommandGroup::Build)));
    }

    #[tokio::test]
    async fn test_apply_leaf_delegates_to_workload() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let apply = Command {
            id: "deploy-k8s".to_string(),
            group: Some(CommandGroup::Deploy),
            is_default: true,
            kind: CommandKind::Apply {
                component: "outerloop".to_string(),
                uri: Some("k8s/deploy.yaml".to_string()),
            },
        };
        let runner = runner(&mock, vec![apply]);
        let plan = runner
            .commands()
            .plan(runner.commands().resolve(CommandGroup::Deploy).unwrap())
            .unwrap();
        let report = runner
            .execute(
                &target,
                &plan,
                ExecContext {
                    group: CommandGroup::Deploy,
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(report.succeeded());
        assert_eq!(
            mock.applied(),
            vec![(
                "outerloop".to_string(),
                Some("/tmp/project/k8s/deploy.yaml".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_cancelled_plan_skips_everything() {
        let mock = MockPlatform::builder().target("web").build();
        let target = mock.target().unwrap();
        let runner = runner(
            &mock,
            vec![
                exec("a", None, false, "a"),
                composite("all", Some(CommandGroup::Build), &["a"]),
            ],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let plan = runner.commands().plan(runner.commands().get("all").unwrap()).unwrap();
        let report = runner
            .execute(&target, &plan, ExecContext { group: CommandGroup::Build }, &cancel)
            .await;
        assert_eq!(report.outcome_of("a"), Some(&StepOutcome::Skipped));
        assert!(mock.exec_calls().is_empty());
    }

    mod proptest_program_names {
        use super::super::program_name;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_program_name_charset_and_idempotence(id in "\\PC{0,24}") {
                let name = program_name(&id);
                prop_assert!(name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'));
                prop_assert_eq!(program_name(&name), name);
            }
        }
    }
}
