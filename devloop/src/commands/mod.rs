//! CLI command implementations.
//!
//! `main` parses arguments and maps them onto the option structs used
//! here; everything below works against a loaded [`Project`].

pub mod debug;
pub mod dev;
pub mod inspect;

use crate::error::DevloopError;
use crate::kubectl::KubectlPlatform;
use devloop_common::{DevloopConfig, Manifest, Platform, TargetRef};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A project root with its manifest and resolved configuration.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub manifest: Manifest,
    pub config: DevloopConfig,
}

impl Project {
    pub fn load(root: &Path) -> Result<Self, DevloopError> {
        let manifest = Manifest::load(root)?;
        let config = DevloopConfig::load(root)?;
        debug!(
            root = %root.display(),
            component = %manifest.name,
            debounce = ?config.debounce.value,
            "Project loaded"
        );
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            config,
        })
    }

    /// Cluster collaborators for this project's component.
    pub fn platform(&self) -> Result<Platform, DevloopError> {
        let kubectl = KubectlPlatform::new(
            &self.config.kubectl.value,
            self.config.namespace.value.clone(),
            &self.manifest.name,
        )?;
        Ok(kubectl.into_platform(&self.config.shared_dir.value))
    }

    /// The running pod, or `WorkloadNotFound`.
    pub async fn require_target(&self, platform: &Platform) -> Result<TargetRef, DevloopError> {
        platform
            .workload
            .current_target()
            .await?
            .ok_or_else(|| DevloopError::WorkloadNotFound {
                component: self.manifest.name.clone(),
            })
    }
}

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            token.cancel();
        }
    });
    cancel
}
