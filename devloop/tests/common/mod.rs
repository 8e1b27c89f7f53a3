#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_mentions, expect_exit};
pub use fixtures::{TestProject, wait_for};
pub use logging::init_test_logging;
