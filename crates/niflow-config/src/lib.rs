//! niflow configuration
//!
//! Loads registration presets and pipeline documents (JSON or YAML) and turns
//! them into an [`InterfaceRegistry`](node_engine::InterfaceRegistry) plus a
//! [`WorkflowGraph`](node_engine::WorkflowGraph) ready to be frozen.

pub mod error;
pub mod format;
pub mod pipeline;
pub mod presets;

pub use error::{ConfigError, Result};
pub use format::{read_document, ConfigFormat};
pub use pipeline::{
    EdgeDecl, ExposeDecl, InterfaceDecl, NodeDecl, PipelineConfig, PresetSource, ReportDecl,
    SubworkflowDecl,
};
pub use presets::{Parameters, PresetLibrary};
