//! Workflow Nodes
//!
//! Step bindings for the node engine. Each binding is the runtime half of a
//! registered interface.
//!
//! # Categories
//!
//! - **System**: `CommandStep`, which runs an external neuroimaging tool
//! - **Control**: in-process utilities (`identity`, `merge-metrics`)

pub mod control;
pub mod setup;
pub mod system;

pub use control::{Identity, MergeMetrics};
pub use setup::register_builtins;
pub use system::{CommandSpec, CommandStep};
