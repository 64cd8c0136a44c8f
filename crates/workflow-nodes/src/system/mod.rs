//! System nodes
//!
//! Bindings that run external processes.

mod command;

pub use command::{CommandSpec, CommandStep};
