//! Test support shared by devloop crates.

pub mod log;

pub use log::{TestGuard, TestPhase, TestRecord};
