//! `dev`, `watch` and `push`.

use super::{Project, cancel_on_interrupt};
use crate::error::DevloopError;
use crate::events::EventBus;
use crate::session::{DevSession, PushOptions, SessionOptions};
use crate::status::{OutputFormat, StatusPrinter};
use crate::watch::NotifySource;
use tokio::sync::mpsc;
use tracing::info;

/// Run a dev session until interrupted.
pub async fn dev(
    project: &Project,
    options: SessionOptions,
    format: OutputFormat,
) -> Result<(), DevloopError> {
    let platform = project.platform()?;
    let events = EventBus::default();
    let printer = StatusPrinter::spawn(&events, format);

    let watch = options.watch;
    let result: Result<(), DevloopError> = async {
        let session = DevSession::new(
            &project.root,
            project.manifest.clone(),
            project.config.clone(),
            platform,
            events.clone(),
            options,
        )?;

        let (source, fs_events) = if watch {
            let (source, rx) = NotifySource::start(&project.root)?;
            (Some(source), rx)
        } else {
            let (_tx, rx) = mpsc::channel(1);
            (None, rx)
        };

        let result = session.run(fs_events, cancel_on_interrupt()).await;
        drop(source);
        result
    }
    .await;

    printer.shutdown().await;
    result
}

/// Watch and push without forwarding ports.
pub async fn watch(project: &Project, format: OutputFormat) -> Result<(), DevloopError> {
    dev(
        project,
        SessionOptions {
            forward_ports: false,
            ..SessionOptions::default()
        },
        format,
    )
    .await
}

/// One sync followed by the pipeline.
pub async fn push(
    project: &Project,
    push: PushOptions,
    format: OutputFormat,
) -> Result<(), DevloopError> {
    let platform = project.platform()?;
    let events = EventBus::default();
    let printer = StatusPrinter::spawn(&events, format);

    let result: Result<(), DevloopError> = async {
        let session = DevSession::new(
            &project.root,
            project.manifest.clone(),
            project.config.clone(),
            platform,
            events.clone(),
            SessionOptions {
                pipeline: push.pipeline.clone(),
                ..SessionOptions::default()
            },
        )?;
        let report = session.push_once(&push, &cancel_on_interrupt()).await?;
        if report.is_none() {
            info!("No file changes detected, skipping build. Use the '-f' flag to force the build.");
        }
        Ok(())
    }
    .await;

    printer.shutdown().await;
    result
}
