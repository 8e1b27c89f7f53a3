//! Error catalog and definitions for devloop
//!
//! Every module error type maps to an [`ErrorCode`]; the code decides the
//! category shown to the user and the [`ErrorClass`] that drives exit codes
//! and whether a watch cycle failure is fatal.
//!
//! | Range      | Category    |
//! |------------|-------------|
//! | E001-E099  | Config      |
//! | E100-E199  | Command     |
//! | E200-E299  | Sync        |
//! | E300-E399  | Tunnel      |
//! | E400-E499  | Platform    |
//! | E500-E599  | Internal    |

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorClass, ErrorCode, ErrorEntry};
