//! devloop: inner-loop development against a remote cluster.
//!
//! A [`session::DevSession`] keeps a local tree synchronized with a running
//! container, re-runs the declared build and run commands on every change,
//! supervises the long-running programs they start and forwards the
//! container endpoints to local ports.

pub mod backoff;
pub mod commands;
pub mod debug_info;
pub mod error;
pub mod events;
pub mod kubectl;
pub mod lock;
pub mod runner;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod sync;
pub mod tunnel;
pub mod watch;

pub use error::DevloopError;
pub use events::{EventBus, SessionEvent};
pub use session::{DevSession, PushOptions, SessionOptions, SessionState};
