//! `debug port-forward` and `debug info`.

use super::{Project, cancel_on_interrupt};
use crate::debug_info::DebugInfo;
use crate::error::DevloopError;
use crate::events::EventBus;
use crate::status::{OutputFormat, StatusPrinter};
use crate::tunnel::{PortAllocation, TunnelManager, TunnelRequest};

/// Forward the debug endpoint until interrupted.
pub async fn port_forward(
    project: &Project,
    local_port: Option<u16>,
    format: OutputFormat,
) -> Result<(), DevloopError> {
    let request = TunnelRequest::debug_only(&project.manifest, local_port)?;
    let platform = project.platform()?;
    let target = project.require_target(&platform).await?;

    let events = EventBus::default();
    let printer = StatusPrinter::spawn(&events, format);
    let tunnels = TunnelManager::new(
        platform.forwarder.clone(),
        events,
        PortAllocation::Sequential,
        project.config.port_range,
    )
    .with_debug_descriptor(
        DebugInfo::default_dir(),
        &project.manifest.name,
        &project.manifest.app,
    );

    let result = tunnels.open(&target, vec![request]).await;
    if result.is_ok() {
        cancel_on_interrupt().cancelled().await;
    }
    tunnels.close().await;
    printer.shutdown().await;
    result.map(|_| ()).map_err(DevloopError::from)
}

/// Report the debug session of this component, if one is running.
pub async fn info(project: &Project, format: OutputFormat) -> Result<(), DevloopError> {
    let component = &project.manifest.name;
    let Some(info) = DebugInfo::load_running(&DebugInfo::default_dir(), component).await else {
        return Err(DevloopError::NoDebugSession {
            component: component.clone(),
        });
    };
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(&info) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::warn!("Failed to render debug info: {}", e),
        },
        OutputFormat::Human => println!(
            "Debug is running for the component {} @ local port: {}",
            info.spec.component_name, info.spec.local_port
        ),
    }
    Ok(())
}
