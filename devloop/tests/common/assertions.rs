use std::process::Output;

/// Asserts that every fragment appears in `text`.
pub fn assert_mentions(text: &str, fragments: &[&str]) {
    let missing: Vec<_> = fragments.iter().filter(|f| !text.contains(*f)).collect();
    assert!(missing.is_empty(), "missing {missing:?} in:\n{text}");
}

/// Asserts the CLI exited with `code` and returns its stderr.
pub fn expect_exit(output: &Output, code: i32) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    assert_eq!(output.status.code(), Some(code), "stderr:\n{stderr}");
    stderr
}
