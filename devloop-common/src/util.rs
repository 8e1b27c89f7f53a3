//! Shared utilities for devloop.

use std::borrow::Cow;

/// Name fragments that mark an environment assignment as secret.
const SECRET_MARKERS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "PASSWD", "API_KEY", "PRIVATE_KEY"];

/// Flags whose following value is secret.
const SECRET_FLAGS: &[&str] = &["--token", "--password", "--api-key", "--secret"];

/// Byte length of the shell word at the start of `s`, honoring quotes and
/// backslash escapes.
fn word_len(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
        } else if c == '"' || c == '\'' {
            in_quote = Some(c);
        } else if c.is_whitespace() {
            break;
        }
        end += c.len_utf8();
    }
    end
}

fn is_secret_assignment(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    !upper.is_empty()
        && upper
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && SECRET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Mask secret values in a command line before it is logged.
///
/// Handles `NAME=value` assignments whose name looks secret, and
/// `--flag value` / `--flag=value` for known secret flags.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let mut out = String::with_capacity(cmd.len());
    let mut rest = cmd;
    let mut mask_next = false;

    while !rest.is_empty() {
        let ws = rest.len() - rest.trim_start().len();
        out.push_str(&rest[..ws]);
        rest = &rest[ws..];
        if rest.is_empty() {
            break;
        }

        let len = word_len(rest);
        let word = &rest[..len];
        rest = &rest[len..];

        if mask_next {
            out.push_str("***");
            mask_next = false;
            continue;
        }

        if SECRET_FLAGS.contains(&word) {
            out.push_str(word);
            mask_next = true;
            continue;
        }

        match word.split_once('=') {
            Some((name, _)) if is_secret_assignment(name) || SECRET_FLAGS.contains(&name) => {
                out.push_str(name);
                out.push_str("=***");
            }
            _ => out.push_str(word),
        }
    }

    out
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(s))
}

/// Join a remote base folder and a `/`-separated relative path.
pub fn remote_join(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if base.is_empty() {
        format!("/{relative}")
    } else {
        format!("{base}/{relative}")
    }
}

/// Check whether a local process is still running.
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("ps")
            .args(["-p", &pid.to_string()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = pid;
        false
    }
}
