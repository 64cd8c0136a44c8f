//! Fluent builder for workflow graphs
//!
//! Provides a chained API for constructing graphs programmatically against a
//! registry. The first construction error is kept and returned from
//! [`WorkflowBuilder::build`], so call chains never need intermediate `?`.

use serde_json::Value;

use crate::error::GraphResult;
use crate::graph::WorkflowGraph;
use crate::groups::NodeGroup;
use crate::registry::InterfaceRegistry;
use crate::types::Bindings;

/// Fluent builder for constructing workflow graphs
///
/// # Example
///
/// ```ignore
/// let graph = WorkflowBuilder::new(&registry, "anat", "Anatomical")
///     .node("bet", "bet", Bindings::new().value("in_file", json!("T1w.nii.gz")))
///     .node("reg", "ants-registration", Bindings::new().deferred("moving_image"))
///     .connect("bet", "out_file", "reg", "moving_image")
///     .build()?;
/// ```
pub struct WorkflowBuilder<'a> {
    registry: &'a InterfaceRegistry,
    graph: WorkflowGraph,
    error: Option<crate::error::GraphError>,
}

impl<'a> WorkflowBuilder<'a> {
    /// Create a new workflow builder
    pub fn new(
        registry: &'a InterfaceRegistry,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            graph: WorkflowGraph::new(id, name),
            error: None,
        }
    }

    fn apply(mut self, f: impl FnOnce(&mut WorkflowGraph, &InterfaceRegistry) -> GraphResult<()>) -> Self {
        if self.error.is_none() {
            if let Err(e) = f(&mut self.graph, self.registry) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Add a step node of a registered interface
    pub fn node(self, id: &str, interface: &str, bindings: Bindings) -> Self {
        self.apply(|graph, registry| {
            let interface = registry.resolve(interface)?;
            graph.add_named_node(id, &interface, bindings).map(|_| ())
        })
    }

    /// Add a step node whose inputs are all literals
    pub fn literal_node<I>(self, id: &str, interface: &str, literals: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let bindings: Bindings = literals.into_iter().collect();
        self.node(id, interface, bindings)
    }

    /// Add a sub-workflow
    pub fn group(self, group: NodeGroup, bindings: Bindings) -> Self {
        self.apply(|graph, _| graph.add_group(group, bindings).map(|_| ()))
    }

    /// Connect an output to an input
    pub fn connect(self, source: &str, output: &str, target: &str, input: &str) -> Self {
        self.apply(|graph, _| graph.connect(source, output, target, input))
    }

    /// Finish, returning the first error encountered
    pub fn build(self) -> GraphResult<WorkflowGraph> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.graph),
        }
    }
}
