//! Sub-workflows
//!
//! A [`NodeGroup`] wraps an inner [`WorkflowGraph`] and exposes selected
//! internal ports as its own inputs and outputs. Inside an outer graph the
//! group behaves like a single compound node: edges attach to the exposed
//! ports and cycle checks see the group as one vertex. Groups can nest, and
//! [`freeze`](crate::plan::freeze) flattens every level into one plan with
//! ids prefixed by the group path (`anat/skullstrip`).
//!
//! # Example
//!
//! ```ignore
//! let group = NodeGroup::new("anat", inner_graph)
//!     .expose_input("t1w", "skullstrip", "in_file")?
//!     .expose_output("brain", "skullstrip", "out_file")?;
//! outer.add_group(group, Bindings::new().deferred("t1w"))?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};
use crate::graph::WorkflowGraph;
use crate::types::{NodeId, PortDataType, PortId};

/// Separator between a group id and its inner node ids in flattened plans
pub const SCOPE_SEPARATOR: char = '/';

/// Maps a group-level port to a port on an internal node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port name at the group level
    pub port: PortId,
    /// Internal node the port forwards to
    pub internal_node: NodeId,
    /// Port on the internal node
    pub internal_port: PortId,
    /// Type of the internal port
    pub data_type: PortDataType,
    /// Whether the exposed input must be bound (always false for outputs)
    #[serde(default)]
    pub required: bool,
}

/// A sub-workflow with exposed ports
#[derive(Debug, Clone)]
pub struct NodeGroup {
    /// Group id, used as the compound node id and the flattening prefix
    pub id: String,
    /// Human-readable name for the group
    pub name: String,
    /// Optional description for the group
    pub description: Option<String>,
    graph: WorkflowGraph,
    exposed_inputs: Vec<PortMapping>,
    exposed_outputs: Vec<PortMapping>,
}

impl NodeGroup {
    /// Wrap an inner graph
    pub fn new(id: impl Into<String>, graph: WorkflowGraph) -> Self {
        let id = id.into();
        Self {
            name: graph.name.clone(),
            id,
            description: None,
            graph,
            exposed_inputs: Vec::new(),
            exposed_outputs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a description to the group
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Expose an internal input port at the group level
    ///
    /// The internal input must exist and must not already have a writer
    /// inside the group; each internal input can be exposed once.
    pub fn expose_input(
        mut self,
        port: impl Into<String>,
        internal_node: &str,
        internal_port: &str,
    ) -> GraphResult<Self> {
        let port = port.into();
        if self.exposed_input(&port).is_some() {
            return Err(self.invalid(format!("input '{}' is exposed twice", port)));
        }
        let node = self
            .graph
            .node(internal_node)
            .ok_or_else(|| self.invalid(format!("unknown internal node '{}'", internal_node)))?;
        let data_type = node.input_type(internal_port).ok_or_else(|| {
            self.invalid(format!(
                "node '{}' has no input '{}'",
                internal_node, internal_port
            ))
        })?;
        if node.has_writer(internal_port) {
            return Err(self.invalid(format!(
                "input '{}.{}' is already written inside the group",
                internal_node, internal_port
            )));
        }
        if self
            .exposed_inputs
            .iter()
            .any(|m| m.internal_node == internal_node && m.internal_port == internal_port)
        {
            return Err(self.invalid(format!(
                "input '{}.{}' is already exposed",
                internal_node, internal_port
            )));
        }
        let required = node.input_required(internal_port);

        self.exposed_inputs.push(PortMapping {
            port,
            internal_node: internal_node.to_string(),
            internal_port: internal_port.to_string(),
            data_type,
            required,
        });
        Ok(self)
    }

    /// Expose an internal output port at the group level
    pub fn expose_output(
        mut self,
        port: impl Into<String>,
        internal_node: &str,
        internal_port: &str,
    ) -> GraphResult<Self> {
        let port = port.into();
        if self.exposed_output(&port).is_some() {
            return Err(self.invalid(format!("output '{}' is exposed twice", port)));
        }
        let data_type = self
            .graph
            .node(internal_node)
            .ok_or_else(|| self.invalid(format!("unknown internal node '{}'", internal_node)))?
            .output_type(internal_port)
            .ok_or_else(|| {
                self.invalid(format!(
                    "node '{}' has no output '{}'",
                    internal_node, internal_port
                ))
            })?;

        self.exposed_outputs.push(PortMapping {
            port,
            internal_node: internal_node.to_string(),
            internal_port: internal_port.to_string(),
            data_type,
            required: false,
        });
        Ok(self)
    }

    fn invalid(&self, reason: String) -> GraphError {
        GraphError::InvalidGroup {
            group: self.id.clone(),
            reason,
        }
    }

    /// The inner graph
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Find an exposed input by group-level port name
    pub fn exposed_input(&self, port: &str) -> Option<&PortMapping> {
        self.exposed_inputs.iter().find(|m| m.port == port)
    }

    /// Find an exposed output by group-level port name
    pub fn exposed_output(&self, port: &str) -> Option<&PortMapping> {
        self.exposed_outputs.iter().find(|m| m.port == port)
    }

    pub fn exposed_inputs(&self) -> &[PortMapping] {
        &self.exposed_inputs
    }

    pub fn exposed_outputs(&self) -> &[PortMapping] {
        &self.exposed_outputs
    }
}
