use devloop::DevloopError;
use devloop::runner::{PipelineRequest, StepOutcome};
use devloop::session::{PushOptions, SessionOptions};
use devloop_common::ErrorCode;
use devloop_common::mock::MockPlatform;
use devloop_common::remote::ExecOutput;
use tokio_util::sync::CancellationToken;

use crate::common::{TestProject, assert_mentions, init_test_logging};

const MANIFEST: &str = r#"
name = "nodejs"

[[containers]]
name = "runtime"
source_mapping = "/projects"

[[commands]]
id = "compile"
exec = { component = "runtime", command_line = "npx tsc" }

[[commands]]
id = "bundle"
exec = { component = "runtime", command_line = "npx webpack" }

[[commands]]
id = "build"
group = "build"
default = true
composite = { commands = ["compile", "bundle"] }

[[commands]]
id = "run"
group = "run"
default = true
exec = { component = "runtime", command_line = "node dist/server.js" }

[[commands]]
id = "run-inspect"
group = "run"
exec = { component = "runtime", command_line = "node --inspect dist/server.js" }
"#;

fn project() -> TestProject {
    let project = TestProject::new(MANIFEST);
    project.write("src/server.ts", "export const port = 3000;");
    project.write("package.json", "{\"name\": \"nodejs\"}");
    project.write("node_modules/left-pad/index.js", "module.exports = 1;");
    project.write(".gitignore", "node_modules/\n");
    project
}

#[tokio::test]
async fn test_push_syncs_builds_and_starts() {
    init_test_logging();
    let _guard = devloop_common::test_guard!();
    let project = project();
    let session = project.session(SessionOptions::default());

    let report = session
        .push_once(&PushOptions::default(), &CancellationToken::new())
        .await
        .unwrap()
        .expect("first push runs the pipeline");

    let ids: Vec<&str> = report.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["compile", "bundle", "run"]);
    assert!(report.succeeded());

    assert!(project.mock.remote_file("/projects/src/server.ts").is_some());
    assert!(project.mock.remote_file("/projects/package.json").is_some());
    assert!(
        project
            .mock
            .remote_paths()
            .iter()
            .all(|p| !p.contains("node_modules")),
        "ignored files were uploaded"
    );
    assert_eq!(project.mock.start_count("run"), 1);
}

#[tokio::test]
async fn test_unchanged_push_is_skipped_unless_forced() {
    init_test_logging();
    let project = project();
    let session = project.session(SessionOptions::default());
    let cancel = CancellationToken::new();

    session
        .push_once(&PushOptions::default(), &cancel)
        .await
        .unwrap();
    let uploads = project.mock.total_uploads();

    let skipped = session
        .push_once(&PushOptions::default(), &cancel)
        .await
        .unwrap();
    assert!(skipped.is_none());
    assert_eq!(project.mock.total_uploads(), uploads);
    assert_eq!(project.mock.start_count("run"), 1);

    let forced = session
        .push_once(
            &PushOptions {
                force: true,
                ..PushOptions::default()
            },
            &cancel,
        )
        .await
        .unwrap();
    assert!(forced.is_some());
    assert!(project.mock.total_uploads() >= uploads * 2);
    assert_eq!(project.mock.start_count("run"), 2);
}

#[tokio::test]
async fn test_push_after_pod_recreation_repopulates_new_pod() {
    init_test_logging();
    let project = project();
    let cancel = CancellationToken::new();
    project
        .session(SessionOptions::default())
        .push_once(&PushOptions::default(), &cancel)
        .await
        .unwrap();

    project.mock.recreate_target();
    let report = project
        .session(SessionOptions::default())
        .push_once(&PushOptions::default(), &cancel)
        .await
        .unwrap()
        .expect("new pod gets the pipeline");

    assert!(report.succeeded());
    assert!(project.mock.remote_file("/projects/src/server.ts").is_some());
    assert!(project.mock.remote_file("/projects/package.json").is_some());
    assert_eq!(project.mock.start_count("run"), 2);
}

#[tokio::test]
async fn test_separate_pushes_leave_one_running_copy() {
    init_test_logging();
    let project = project();
    let cancel = CancellationToken::new();
    let forced = PushOptions {
        force: true,
        ..PushOptions::default()
    };

    for _ in 0..3 {
        project
            .session(SessionOptions::default())
            .push_once(&forced, &cancel)
            .await
            .unwrap()
            .expect("forced push runs the pipeline");
    }

    assert_eq!(project.mock.start_count("run"), 3);
    assert!(project.mock.overlapping_starts().is_empty());
    assert!(project.mock.process("run").unwrap().alive);
}

#[tokio::test]
async fn test_failing_build_leaf_short_circuits() {
    init_test_logging();
    let project = project();
    project
        .mock
        .respond_to("npx tsc", ExecOutput::failed(2, "src/server.ts(1,1): error TS1005"));
    let session = project.session(SessionOptions::default());

    let err = session
        .push_once(&PushOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::CommandExecutionFailed);
    assert_eq!(err.exit_code(), 1);
    assert_mentions(&err.to_string(), &["error TS1005"]);
    assert!(
        project
            .mock
            .exec_calls()
            .iter()
            .all(|call| !call.line().contains("webpack")),
        "bundle ran after compile failed"
    );
    assert_eq!(project.mock.start_count("run"), 0);
}

#[tokio::test]
async fn test_named_run_command_replaces_default() {
    init_test_logging();
    let project = project();
    let session = project.session(SessionOptions::default());

    let report = session
        .push_once(
            &PushOptions {
                pipeline: PipelineRequest {
                    run_command: Some("RUN-INSPECT".to_string()),
                    ..PipelineRequest::default()
                },
                force: false,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.outcome_of("run-inspect"), Some(&StepOutcome::Succeeded));
    assert_eq!(project.mock.start_count("run-inspect"), 1);
    assert_eq!(project.mock.start_count("run"), 0);
}

#[tokio::test]
async fn test_unknown_run_command_is_a_configuration_error() {
    init_test_logging();
    let project = project();
    let session = project.session(SessionOptions::default());

    let err = session
        .push_once(
            &PushOptions {
                pipeline: PipelineRequest {
                    run_command: Some("serve".to_string()),
                    ..PipelineRequest::default()
                },
                force: true,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DevloopError::Command(_)));
    assert_eq!(err.code(), ErrorCode::CommandNotFound);
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_crashing_program_reports_container_logs() {
    init_test_logging();
    let mock = MockPlatform::builder()
        .target("nodejs")
        .logs("listening...\nError: Cannot find module 'express'\n")
        .build();
    mock.crash_on_start("run");
    let project = project().with_mock(mock);
    let session = project.session(SessionOptions::default());

    let err = session
        .push_once(&PushOptions::default(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::CommandExecutionFailed);
    assert_mentions(&err.to_string(), &["Cannot find module 'express'"]);
}
