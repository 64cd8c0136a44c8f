//! Error types for the node engine
//!
//! Errors are split by the phase in which they can occur:
//!
//! - [`GraphError`]: construction time (registry, `add_node`, `connect`, `freeze`).
//!   Always fatal to the caller and never produced while a run is executing.
//! - [`StepError`]: a single step failed while running. Captured into the
//!   node's run record; sibling branches keep running.
//! - [`CacheError`]: the cache store could not be read or written. Lookups
//!   treat it as a miss and writes log it; neither fails the node.

use thiserror::Error;

use crate::types::{NodeId, PortDataType};

/// Result type alias using NodeEngineError
pub type Result<T> = std::result::Result<T, NodeEngineError>;

/// Result type alias for graph construction
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Errors raised while registering interfaces or building a workflow graph
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// An interface with this name is already registered
    #[error("Interface '{0}' is already registered")]
    DuplicateInterface(String),

    /// No interface with this name is registered
    #[error("Unknown interface '{0}'")]
    UnknownInterface(String),

    /// A node with this id already exists in the graph
    #[error("Node '{0}' already exists in the graph")]
    DuplicateNode(NodeId),

    /// A node id does not exist in the graph
    #[error("Unknown node '{0}'")]
    UnknownNode(NodeId),

    /// A port name does not exist on the node's interface
    #[error("Node '{node}' has no {direction} named '{port}'")]
    UnknownPort {
        node: NodeId,
        port: String,
        direction: PortDirection,
    },

    /// A value or edge does not match the declared port type
    #[error("Type mismatch at {location}: expected {expected}, found {found}")]
    TypeMismatch {
        location: String,
        expected: PortDataType,
        found: String,
    },

    /// A required input has no literal, no default and no incoming edge
    #[error("Node '{node}' is missing required input '{port}'")]
    MissingRequiredInput { node: NodeId, port: String },

    /// A target input already has a writer (edge or literal)
    #[error("Input '{port}' on node '{node}' already has a writer")]
    MultipleWriters { node: NodeId, port: String },

    /// The graph contains (or an edge would create) a cycle
    #[error("Cycle detected through nodes: {}", .nodes.join(" -> "))]
    Cycle { nodes: Vec<NodeId> },

    /// A sub-workflow declaration is inconsistent
    #[error("Invalid sub-workflow '{group}': {reason}")]
    InvalidGroup { group: String, reason: String },
}

/// Direction of a port, used in error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl std::fmt::Display for PortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Errors raised by a step while it runs
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    /// The underlying tool reported a failure
    #[error("Step failed: {0}")]
    Failed(String),

    /// No executor is bound to the node's interface
    #[error("No step binding registered for interface '{0}'")]
    NoBinding(String),

    /// The step finished without producing a declared output
    #[error("Step did not produce declared output '{0}'")]
    MissingOutput(String),

    /// The step produced an output of the wrong type
    #[error("Output '{port}' has wrong type: expected {expected}, found {found}")]
    OutputTypeMismatch {
        port: String,
        expected: PortDataType,
        found: String,
    },

    /// The run was cancelled while the step was running
    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    /// Create a failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors raised by a cache store
#[derive(Debug, Error)]
pub enum CacheError {
    /// The entry exists but cannot be decoded
    #[error("Corrupt cache entry '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    /// Serialization error while writing an entry
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the node engine
#[derive(Debug, Error)]
pub enum NodeEngineError {
    /// Graph construction error
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Step execution error
    #[error(transparent)]
    Step(#[from] StepError),

    /// Cache store error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = GraphError::Cycle {
            nodes: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected through nodes: a -> b -> a");
    }

    #[test]
    fn test_unknown_port_message() {
        let err = GraphError::UnknownPort {
            node: "reg-1".into(),
            port: "moving".into(),
            direction: PortDirection::Input,
        };
        assert_eq!(err.to_string(), "Node 'reg-1' has no input named 'moving'");
    }

    #[test]
    fn test_graph_error_converts() {
        let err: NodeEngineError = GraphError::UnknownInterface("bet".into()).into();
        assert!(matches!(err, NodeEngineError::Graph(_)));
    }
}
