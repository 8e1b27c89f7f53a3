//! `logs`, `test` and `status`.

use super::{Project, cancel_on_interrupt};
use crate::error::DevloopError;
use crate::events::EventBus;
use crate::runner::{CommandRunner, CommandSet, program_name};
use crate::session::sync_location;
use crate::status::{OutputFormat, StatusPrinter};
use crate::supervisor::{ProcessSupervisor, ProgramState, ProgramStatus};
use devloop_common::manifest::{CommandGroup, CommandKind};
use devloop_common::{Manifest, Platform, TargetRef};
use std::sync::Arc;

/// Container running the default command of `group`, falling back to the
/// source container.
fn container_for(manifest: &Manifest, group: CommandGroup) -> Option<String> {
    let commands = CommandSet::from_manifest(manifest);
    commands
        .resolve(group)
        .ok()
        .and_then(|c| c.exec().map(|e| e.component.clone()))
        .or_else(|| manifest.source_container().map(|c| c.name.clone()))
}

pub async fn logs(project: &Project, follow: bool, debug: bool) -> Result<(), DevloopError> {
    let group = if debug {
        CommandGroup::Debug
    } else {
        CommandGroup::Run
    };
    let container = container_for(&project.manifest, group).ok_or_else(|| {
        DevloopError::NoContainer {
            manifest: devloop_common::manifest::MANIFEST_FILE.to_string(),
        }
    })?;
    let platform = project.platform()?;
    let output = platform.workload.logs(&container, follow).await?;
    if !output.is_empty() {
        print!("{output}");
    }
    Ok(())
}

/// Run the test group once against the current pod.
pub async fn test(
    project: &Project,
    name: Option<&str>,
    format: OutputFormat,
) -> Result<(), DevloopError> {
    let (_, workdir) = sync_location(&project.manifest, &project.config)?;
    let platform = project.platform()?;
    let target = project.require_target(&platform).await?;

    let events = EventBus::default();
    let printer = StatusPrinter::spawn(&events, format);
    let supervisor = Arc::new(ProcessSupervisor::new(platform.processes.clone()));
    let runner = CommandRunner::new(
        CommandSet::from_manifest(&project.manifest),
        platform,
        supervisor,
        events,
        &project.root,
        workdir,
    );

    let result = runner.run_tests(&target, name, &cancel_on_interrupt()).await;
    printer.shutdown().await;
    let report = result?;
    for step in &report.steps {
        if !step.stdout.is_empty() {
            print!("{}", step.stdout);
        }
    }
    match report.error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Probe every run and debug program declared by the manifest.
pub async fn program_statuses(
    manifest: &Manifest,
    platform: &Platform,
    target: &TargetRef,
) -> Result<Vec<ProgramStatus>, DevloopError> {
    let mut statuses = Vec::new();
    for command in &manifest.commands {
        let supervised = command.group.is_some_and(|g| g.is_supervised());
        let CommandKind::Exec(spec) = &command.kind else {
            continue;
        };
        if !supervised {
            continue;
        }
        let program = program_name(&command.id);
        let probe = platform
            .processes
            .probe(target, &spec.component, &program)
            .await?;
        statuses.push(ProgramStatus {
            program,
            container: spec.component.clone(),
            pid: probe.pid,
            state: ProgramState::from_probe(&probe),
            exit_code: probe.exit_code,
            observed_at: chrono::Utc::now(),
        });
    }
    Ok(statuses)
}

pub async fn status(project: &Project, format: OutputFormat) -> Result<(), DevloopError> {
    let platform = project.platform()?;
    let target = project.require_target(&platform).await?;
    let statuses = program_statuses(&project.manifest, &platform, &target).await?;

    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(&statuses) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!("Failed to render status: {}", e),
        },
        OutputFormat::Human => {
            println!("{:<24} {:<10} {:<8} CONTAINER", "PROGRAM", "STATE", "PID");
            for s in &statuses {
                let pid = s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{:<24} {:<10} {:<8} {}", s.program, s.state, pid, s.container);
            }
        }
    }
    Ok(())
}
