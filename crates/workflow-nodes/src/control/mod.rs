//! Control nodes
//!
//! Small in-process utility steps used to shape data between tools.

mod identity;
mod merge;

pub use identity::Identity;
pub use merge::MergeMetrics;
