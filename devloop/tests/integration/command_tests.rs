use std::process::{Command, Output};

use tempfile::TempDir;

use crate::common::{TestProject, assert_mentions, expect_exit, init_test_logging};

const MANIFEST: &str = r#"
name = "devloop-cli-no-debug-session"

[[containers]]
name = "runtime"

[[commands]]
id = "run"
group = "run"
default = true
exec = { component = "runtime", command_line = "npm start" }
"#;

fn devloop(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_devloop"))
        .args(args)
        .env_remove("DEVLOOP_PROJECT")
        .env_remove("DEVLOOP_LOG")
        .output()
        .expect("Failed to run devloop")
}

#[test]
fn test_devloop_help_lists_subcommands() {
    init_test_logging();
    let _guard = devloop_common::test_guard!();

    let output = devloop(&["--help"]);
    assert!(output.status.success(), "devloop --help failed");
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert_mentions(
        &stdout,
        &[
            "Sync, run and watch a component",
            "dev",
            "push",
            "watch",
            "debug",
            "logs",
            "test",
            "status",
        ],
    );
}

#[test]
fn test_missing_manifest_exits_with_configuration_code() {
    init_test_logging();
    let dir = TempDir::new().unwrap();

    let output = devloop(&["--project", dir.path().to_str().unwrap(), "status"]);
    let stderr = expect_exit(&output, 2);
    assert_mentions(&stderr, &["DL-E001", "no manifest found"]);
}

#[test]
fn test_invalid_manifest_is_reported() {
    init_test_logging();
    let project = TestProject::new(
        r#"
name = "broken"

[[containers]]
name = "runtime"

[[commands]]
id = "run"
group = "run"
exec = { component = "sidecar", command_line = "npm start" }
"#,
    );

    let output = devloop(&["--project", project.dir.path().to_str().unwrap(), "push"]);
    let stderr = expect_exit(&output, 2);
    assert_mentions(&stderr, &["DL-E003", "unknown container \"sidecar\""]);
}

#[test]
fn test_debug_info_without_session() {
    init_test_logging();
    let project = TestProject::new(MANIFEST);

    let output = devloop(&[
        "--project",
        project.dir.path().to_str().unwrap(),
        "debug",
        "info",
    ]);
    let stderr = expect_exit(&output, 2);
    assert_mentions(&stderr, &["has no debug session running"]);
}

#[test]
fn test_missing_kubectl_is_a_configuration_error() {
    init_test_logging();
    let project = TestProject::new(MANIFEST);

    let output = Command::new(env!("CARGO_BIN_EXE_devloop"))
        .args(["--project", project.dir.path().to_str().unwrap(), "status"])
        .env("DEVLOOP_KUBECTL", "/nonexistent/devloop-kubectl")
        .output()
        .expect("Failed to run devloop");

    let stderr = expect_exit(&output, 2);
    assert_mentions(&stderr, &["platform error"]);
}
