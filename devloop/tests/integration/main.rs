#[path = "../common/mod.rs"]
mod common;

mod command_tests;
mod push_tests;
mod session_tests;
