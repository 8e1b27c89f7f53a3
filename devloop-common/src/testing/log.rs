//! Per-test JSONL records for CI runs.
//!
//! `let _guard = test_guard!();` at the top of a test writes
//! `target/test-logs/<test>.jsonl` with a start record and a pass or fail
//! record when the guard drops. Recording is off unless
//! `DEVLOOP_TEST_LOGGING=1` or `CI` is set.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Start,
    Step,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub at: DateTime<Utc>,
    pub test: String,
    pub phase: TestPhase,
    pub message: String,
    pub elapsed_ms: u64,
}

fn recording_enabled() -> bool {
    match std::env::var("DEVLOOP_TEST_LOGGING").as_deref() {
        Ok("1" | "true") => true,
        Ok(_) => false,
        Err(_) => std::env::var_os("CI").is_some(),
    }
}

fn log_dir() -> PathBuf {
    let target = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../target"));
    target.join("test-logs")
}

struct Sink {
    test: String,
    started: Instant,
    file: Mutex<File>,
}

impl Sink {
    fn open(test: &str) -> Option<Self> {
        let dir = log_dir();
        std::fs::create_dir_all(&dir).ok()?;
        let file_name = test.replace([':', '/', '\\'], "_");
        let file = File::create(dir.join(format!("{file_name}.jsonl"))).ok()?;
        Some(Self {
            test: test.to_string(),
            started: Instant::now(),
            file: Mutex::new(file),
        })
    }

    fn record(&self, phase: TestPhase, message: &str) {
        let record = TestRecord {
            at: Utc::now(),
            test: self.test.clone(),
            phase,
            message: message.to_string(),
            elapsed_ms: u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        if let Ok(line) = serde_json::to_string(&record)
            && let Ok(mut file) = self.file.lock()
        {
            let _ = writeln!(file, "{line}");
        }
        tracing::info!(target: "test", test = %self.test, phase = ?phase, "{}", message);
    }
}

/// Records the outcome of one test when dropped.
pub struct TestGuard {
    sink: Option<Sink>,
}

impl TestGuard {
    pub fn new(test: &str) -> Self {
        let sink = recording_enabled().then(|| Sink::open(test)).flatten();
        if let Some(sink) = &sink {
            sink.record(TestPhase::Start, "TEST START");
        }
        Self { sink }
    }

    pub fn step(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.record(TestPhase::Step, message);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.sink.is_some()
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            if std::thread::panicking() {
                sink.record(TestPhase::Fail, "TEST FAIL");
            } else {
                sink.record(TestPhase::Pass, "TEST PASS");
            }
        }
    }
}

/// A [`TestGuard`] named after the enclosing function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn here() {}
        let path = std::any::type_name_of_val(&here);
        let name = path
            .split("::")
            .filter(|segment| *segment != "here" && *segment != "{{closure}}")
            .last()
            .unwrap_or(path);
        $crate::testing::TestGuard::new(name)
    }};
}
