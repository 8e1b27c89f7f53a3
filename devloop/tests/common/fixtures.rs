use devloop::events::{EventBus, SessionEvent};
use devloop::session::{DevSession, SessionOptions};
use devloop_common::mock::MockPlatform;
use devloop_common::{DevloopConfig, Manifest};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Files kept out of the sync in every fixture project.
const IGNORE_META: &str = "devloop.toml\n.devloopignore\n.gitignore\n";

pub struct TestProject {
    pub dir: TempDir,
    pub descriptors: TempDir,
    pub mock: MockPlatform,
    pub events: EventBus,
}

impl TestProject {
    pub fn new(manifest: &str) -> Self {
        tracing::debug!("Creating fixture project");

        let dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(dir.path().join("devloop.toml"), manifest).expect("Failed to write manifest");
        fs::write(dir.path().join(".devloopignore"), IGNORE_META)
            .expect("Failed to write .devloopignore");

        Self {
            dir,
            descriptors: TempDir::new().expect("Failed to create temp dir"),
            mock: MockPlatform::builder().target("nodejs").build(),
            events: EventBus::default(),
        }
    }

    pub fn with_mock(mut self, mock: MockPlatform) -> Self {
        self.mock = mock;
        self
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, contents).expect("Failed to write project file");
        path
    }

    pub fn config(&self) -> DevloopConfig {
        let mut config = DevloopConfig::default();
        config.start_check_interval.value = Duration::from_millis(5);
        config.debounce.value = Duration::from_millis(20);
        config
    }

    pub fn session(&self, options: SessionOptions) -> DevSession {
        let manifest = Manifest::load(self.dir.path()).expect("Failed to load manifest");
        DevSession::new(
            self.dir.path(),
            manifest,
            self.config(),
            self.mock.platform(),
            self.events.clone(),
            SessionOptions {
                random_ports: true,
                descriptor_dir: self.descriptors.path().to_path_buf(),
                ..options
            },
        )
        .expect("Failed to create session")
    }
}

/// Next event matching `pred`, failing after ten seconds.
pub async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
