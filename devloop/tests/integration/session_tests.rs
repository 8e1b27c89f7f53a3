use std::fs;
use std::sync::Arc;

use devloop::debug_info::DebugInfo;
use devloop::events::SessionEvent;
use devloop::runner::PipelineRequest;
use devloop::session::{SessionOptions, SessionState};
use devloop::watch::{FsEvent, FsEventKind, WatchState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::{TestProject, init_test_logging, wait_for};

const MANIFEST: &str = r#"
name = "nodejs"

[[containers]]
name = "runtime"
source_mapping = "/projects"
endpoints = [
  { name = "http", target_port = 3000 },
  { name = "debug", target_port = 5858 },
]

[[commands]]
id = "install"
group = "build"
default = true
exec = { component = "runtime", command_line = "npm install" }

[[commands]]
id = "run"
group = "run"
default = true
exec = { component = "runtime", command_line = "npm start" }

[[commands]]
id = "debug"
group = "debug"
default = true
exec = { component = "runtime", command_line = "npm run debug" }
"#;

fn project() -> TestProject {
    let project = TestProject::new(MANIFEST);
    project.write("server.js", "require('http').createServer().listen(3000);");
    project.write("lib/routes.js", "module.exports = [];");
    project
}

fn is_idle(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::WatchState {
            state: WatchState::Idle
        }
    )
}

#[tokio::test]
async fn test_removed_file_is_deleted_remotely() {
    init_test_logging();
    let _guard = devloop_common::test_guard!();
    let project = project();
    let session = Arc::new(project.session(SessionOptions::default()));
    let mut rx = project.events.subscribe();
    let (tx, fs_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(fs_rx, cancel).await })
    };
    wait_for(&mut rx, is_idle).await;
    assert!(project.mock.remote_file("/projects/lib/routes.js").is_some());

    let removed = project.dir.path().join("lib/routes.js");
    fs::remove_file(&removed).unwrap();
    tx.send(FsEvent {
        path: removed,
        kind: FsEventKind::Removed,
    })
    .await
    .unwrap();

    wait_for(&mut rx, |e| matches!(e, SessionEvent::CycleSucceeded)).await;
    assert!(project.mock.remote_file("/projects/lib/routes.js").is_none());
    assert!(project.mock.remote_file("/projects/server.js").is_some());

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_debug_session_forwards_debug_endpoint() {
    init_test_logging();
    let project = project();
    let session = Arc::new(project.session(SessionOptions {
        pipeline: PipelineRequest {
            debug: true,
            ..PipelineRequest::default()
        },
        ..SessionOptions::default()
    }));
    let mut rx = project.events.subscribe();
    let (_tx, fs_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(fs_rx, cancel).await })
    };
    wait_for(&mut rx, is_idle).await;

    assert_eq!(project.mock.process("debug").map(|p| p.alive), Some(true));
    assert!(project.mock.process("run").is_none());
    let debug = session.tunnels().debug_tunnel().expect("debug tunnel");
    assert_eq!(debug.container_port, 5858);

    let descriptor = DebugInfo::path_in(project.descriptors.path(), "nodejs");
    assert!(descriptor.exists(), "missing {}", descriptor.display());
    let info = DebugInfo::load(project.descriptors.path(), "nodejs")
        .unwrap()
        .unwrap();
    assert_eq!(info.spec.local_port, debug.local_port);

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(!descriptor.exists());
    assert!(project.mock.active_forwards().is_empty());
}

#[tokio::test]
async fn test_session_without_watch_runs_until_cancelled() {
    init_test_logging();
    let project = project();
    let session = Arc::new(project.session(SessionOptions {
        watch: false,
        forward_ports: false,
        ..SessionOptions::default()
    }));
    let mut rx = project.events.subscribe();
    let (_tx, fs_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(fs_rx, cancel).await })
    };
    wait_for(&mut rx, |e| {
        matches!(
            e,
            SessionEvent::SessionState {
                state: SessionState::Running
            }
        )
    })
    .await;

    assert_eq!(project.mock.process("run").map(|p| p.alive), Some(true));
    assert!(project.mock.active_forwards().is_empty());
    assert!(session.tunnels().tunnels().is_empty());

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(project.mock.process("run").is_none());
}

#[tokio::test]
async fn test_crashed_program_is_restarted_by_next_cycle() {
    init_test_logging();
    let project = project();
    let session = Arc::new(project.session(SessionOptions::default()));
    let mut rx = project.events.subscribe();
    let (tx, fs_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();

    let task = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(fs_rx, cancel).await })
    };
    wait_for(&mut rx, is_idle).await;

    project.mock.kill_program("run", 137);
    let changed = project.write("server.js", "require('http').createServer().listen(3001);");
    tx.send(FsEvent::modified(changed)).await.unwrap();

    wait_for(&mut rx, |e| matches!(e, SessionEvent::CycleSucceeded)).await;
    assert_eq!(project.mock.start_count("run"), 2);
    assert_eq!(project.mock.process("run").map(|p| p.alive), Some(true));

    cancel.cancel();
    task.await.unwrap().unwrap();
}
