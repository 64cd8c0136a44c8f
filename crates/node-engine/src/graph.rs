//! Workflow graph construction
//!
//! A [`WorkflowGraph`] owns its nodes and edges and enforces the structural
//! rules eagerly: literal bindings are type-checked by [`WorkflowGraph::add_node`],
//! and [`WorkflowGraph::connect`] rejects type mismatches, second writers and
//! edges that would close a cycle.
//!
//! Cycle detection is incremental. The graph keeps a topological position for
//! every node and, when a new edge goes "backwards" in that order, searches
//! only the affected region between the two positions (Pearce-Kelly). Edges
//! that already agree with the order are accepted without any search.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::{validate_bindings, BindingError, Interface};
use crate::error::{GraphError, GraphResult, PortDirection};
use crate::groups::NodeGroup;
use crate::types::{Binding, Bindings, NodeId, PortDataType, PortId};

/// What a graph node executes
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A single step bound to an interface
    Step { interface: Arc<Interface> },
    /// A nested sub-workflow, flattened when the graph is frozen
    Group(Box<NodeGroup>),
}

/// A node in a workflow graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub bindings: Bindings,
}

impl GraphNode {
    /// Interface name, or the group id for sub-workflows
    pub fn type_name(&self) -> &str {
        match &self.kind {
            NodeKind::Step { interface } => &interface.name,
            NodeKind::Group(group) => &group.id,
        }
    }

    /// Declared type of an input port
    pub fn input_type(&self, port: &str) -> Option<PortDataType> {
        match &self.kind {
            NodeKind::Step { interface } => interface.input(port).map(|p| p.data_type),
            NodeKind::Group(group) => group.exposed_input(port).map(|m| m.data_type),
        }
    }

    /// Declared type of an output port
    pub fn output_type(&self, port: &str) -> Option<PortDataType> {
        match &self.kind {
            NodeKind::Step { interface } => interface.output(port).map(|p| p.data_type),
            NodeKind::Group(group) => group.exposed_output(port).map(|m| m.data_type),
        }
    }

    /// Whether an input must be bound (required and without a default)
    pub fn input_required(&self, port: &str) -> bool {
        match &self.kind {
            NodeKind::Step { interface } => interface
                .input(port)
                .map(|p| p.required && p.default.is_none())
                .unwrap_or(false),
            NodeKind::Group(group) => group
                .exposed_input(port)
                .map(|m| m.required)
                .unwrap_or(false),
        }
    }

    /// Whether an input already has a writer (literal or edge)
    pub fn has_writer(&self, port: &str) -> bool {
        matches!(
            self.bindings.get(port),
            Some(Binding::Value { .. }) | Some(Binding::Edge { .. })
        )
    }
}

/// A data dependency between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: NodeId,
    pub source_port: PortId,
    pub target: NodeId,
    pub target_port: PortId,
}

impl std::fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source, self.source_port, self.target, self.target_port
        )
    }
}

/// A directed acyclic graph of nodes and edges
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    pub id: String,
    pub name: String,
    nodes: Vec<GraphNode>,
    index: HashMap<NodeId, usize>,
    edges: Vec<GraphEdge>,
    /// Topological position of each node, a permutation of `0..nodes.len()`
    ord: Vec<usize>,
    succ: Vec<Vec<usize>>,
    pred: Vec<Vec<usize>>,
    /// Next auto-id suffix per interface name
    counters: HashMap<String, usize>,
}

impl WorkflowGraph {
    /// Create a new empty graph
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            ord: Vec::new(),
            succ: Vec::new(),
            pred: Vec::new(),
            counters: HashMap::new(),
        }
    }

    /// Add a step node with an auto-generated id (`<interface>-<n>`)
    pub fn add_node(
        &mut self,
        interface: &Arc<Interface>,
        bindings: Bindings,
    ) -> GraphResult<NodeId> {
        let id = self.next_id(&interface.name);
        self.add_named_node(id, interface, bindings)
    }

    /// Add a step node with an explicit id
    ///
    /// Literal bindings are type-checked now; `Deferred` inputs are expected
    /// to be satisfied by a later [`connect`](Self::connect). `Edge` bindings
    /// can only be created by `connect` and are treated as `Deferred` here.
    pub fn add_named_node(
        &mut self,
        id: impl Into<String>,
        interface: &Arc<Interface>,
        bindings: Bindings,
    ) -> GraphResult<NodeId> {
        let id = id.into();
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let bindings = downgrade_edges(bindings);
        validate_bindings(interface, &bindings).map_err(|e| binding_error(&id, e))?;

        self.push_node(GraphNode {
            id: id.clone(),
            kind: NodeKind::Step {
                interface: interface.clone(),
            },
            bindings,
        });
        Ok(id)
    }

    /// Add a sub-workflow as a single compound node
    ///
    /// The node id is the group's id. Bindings address the group's exposed
    /// inputs.
    pub fn add_group(&mut self, group: NodeGroup, bindings: Bindings) -> GraphResult<NodeId> {
        let id = group.id.clone();
        if self.index.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let bindings = downgrade_edges(bindings);

        for (port, binding) in bindings.iter() {
            let mapping = group
                .exposed_input(port)
                .ok_or_else(|| GraphError::UnknownPort {
                    node: id.clone(),
                    port: port.clone(),
                    direction: PortDirection::Input,
                })?;
            if let Binding::Value { value } = binding {
                if !mapping.data_type.accepts(value) {
                    return Err(GraphError::TypeMismatch {
                        location: format!("{}.{}", id, port),
                        expected: mapping.data_type,
                        found: crate::types::describe_value(value),
                    });
                }
            }
        }
        if let Some(missing) = group
            .exposed_inputs()
            .iter()
            .find(|m| m.required && !bindings.contains(&m.port))
        {
            return Err(GraphError::MissingRequiredInput {
                node: id,
                port: missing.port.clone(),
            });
        }

        log::debug!(
            "Added sub-workflow '{}' with {} nodes to graph '{}'",
            id,
            group.graph().node_count(),
            self.id
        );
        self.push_node(GraphNode {
            id: id.clone(),
            kind: NodeKind::Group(Box::new(group)),
            bindings,
        });
        Ok(id)
    }

    fn next_id(&mut self, interface: &str) -> NodeId {
        let counter = self.counters.entry(interface.to_string()).or_insert(0);
        loop {
            *counter += 1;
            let candidate = format!("{}-{}", interface, counter);
            if !self.index.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn push_node(&mut self, node: GraphNode) {
        let idx = self.nodes.len();
        self.index.insert(node.id.clone(), idx);
        self.nodes.push(node);
        self.ord.push(idx);
        self.succ.push(Vec::new());
        self.pred.push(Vec::new());
    }

    /// Wire `source.output` into `target.input`
    ///
    /// Fails with `TypeMismatch` if the port types are incompatible,
    /// `MultipleWriters` if the input already has an edge or a literal, and
    /// `Cycle` if the edge would close a cycle. The graph is unchanged on
    /// failure.
    pub fn connect(
        &mut self,
        source: &str,
        output: &str,
        target: &str,
        input: &str,
    ) -> GraphResult<()> {
        let s = self.index_of(source)?;
        let t = self.index_of(target)?;

        let out_type = self.nodes[s]
            .output_type(output)
            .ok_or_else(|| GraphError::UnknownPort {
                node: source.to_string(),
                port: output.to_string(),
                direction: PortDirection::Output,
            })?;
        let in_type = self.nodes[t]
            .input_type(input)
            .ok_or_else(|| GraphError::UnknownPort {
                node: target.to_string(),
                port: input.to_string(),
                direction: PortDirection::Input,
            })?;

        if !out_type.is_compatible_with(&in_type) {
            return Err(GraphError::TypeMismatch {
                location: format!("{}.{} -> {}.{}", source, output, target, input),
                expected: in_type,
                found: out_type.to_string(),
            });
        }

        if self.nodes[t].has_writer(input) {
            return Err(GraphError::MultipleWriters {
                node: target.to_string(),
                port: input.to_string(),
            });
        }

        self.reorder_for_edge(s, t)?;

        self.succ[s].push(t);
        self.pred[t].push(s);
        self.edges.push(GraphEdge {
            source: source.to_string(),
            source_port: output.to_string(),
            target: target.to_string(),
            target_port: input.to_string(),
        });
        self.nodes[t].bindings.insert(
            input,
            Binding::Edge {
                node: source.to_string(),
                output: output.to_string(),
            },
        );
        Ok(())
    }

    /// Keep `ord` a topological order after adding `s -> t`
    fn reorder_for_edge(&mut self, s: usize, t: usize) -> GraphResult<()> {
        if s == t {
            let id = self.nodes[s].id.clone();
            return Err(GraphError::Cycle {
                nodes: vec![id.clone(), id],
            });
        }
        let lower = self.ord[t];
        let upper = self.ord[s];
        if lower > upper {
            return Ok(());
        }

        // Forward from the target, staying inside the affected region
        let mut forward = vec![t];
        let mut seen: HashSet<usize> = HashSet::from([t]);
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut stack = vec![t];
        while let Some(n) = stack.pop() {
            for &m in &self.succ[n] {
                if m == s {
                    return Err(GraphError::Cycle {
                        nodes: self.cycle_path(s, n, &parent),
                    });
                }
                if self.ord[m] < upper && seen.insert(m) {
                    parent.insert(m, n);
                    forward.push(m);
                    stack.push(m);
                }
            }
        }

        // Backward from the source
        let mut backward = vec![s];
        let mut seen: HashSet<usize> = HashSet::from([s]);
        let mut stack = vec![s];
        while let Some(n) = stack.pop() {
            for &m in &self.pred[n] {
                if self.ord[m] > lower && seen.insert(m) {
                    backward.push(m);
                    stack.push(m);
                }
            }
        }

        backward.sort_by_key(|&n| self.ord[n]);
        forward.sort_by_key(|&n| self.ord[n]);
        let mut slots: Vec<usize> = backward
            .iter()
            .chain(forward.iter())
            .map(|&n| self.ord[n])
            .collect();
        slots.sort_unstable();
        for (node, slot) in backward.into_iter().chain(forward).zip(slots) {
            self.ord[node] = slot;
        }
        Ok(())
    }

    /// Ids along `s -> t -> ... -> last -> s`
    fn cycle_path(&self, s: usize, last: usize, parent: &HashMap<usize, usize>) -> Vec<NodeId> {
        let mut back = vec![last];
        let mut cur = last;
        while let Some(&p) = parent.get(&cur) {
            back.push(p);
            cur = p;
        }
        back.reverse();

        let mut path = Vec::with_capacity(back.len() + 2);
        path.push(self.nodes[s].id.clone());
        path.extend(back.into_iter().map(|n| self.nodes[n].id.clone()));
        path.push(self.nodes[s].id.clone());
        path
    }

    fn index_of(&self, id: &str) -> GraphResult<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
    }

    /// Get a node by id
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Edges in insertion order
    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    /// Edges feeding a node
    pub fn incoming_edges<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a GraphEdge> {
        self.edges.iter().filter(move |e| e.target == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in the incrementally maintained topological order
    pub fn topological_order(&self) -> Vec<&str> {
        let mut ids: Vec<(usize, &str)> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (self.ord[i], n.id.as_str()))
            .collect();
        ids.sort_unstable_by_key(|(pos, _)| *pos);
        ids.into_iter().map(|(_, id)| id).collect()
    }
}

fn downgrade_edges(bindings: Bindings) -> Bindings {
    let mut out = Bindings::new();
    for (port, binding) in bindings.iter() {
        let binding = match binding {
            Binding::Edge { .. } => Binding::Deferred,
            other => other.clone(),
        };
        out.insert(port.clone(), binding);
    }
    out
}

fn binding_error(node: &str, err: BindingError) -> GraphError {
    match err {
        BindingError::UnknownInput(port) => GraphError::UnknownPort {
            node: node.to_string(),
            port,
            direction: PortDirection::Input,
        },
        BindingError::TypeMismatch {
            port,
            expected,
            found,
        } => GraphError::TypeMismatch {
            location: format!("{}.{}", node, port),
            expected,
            found,
        },
        BindingError::MissingRequired(port) => GraphError::MissingRequiredInput {
            node: node.to_string(),
            port,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PortSpec;
    use serde_json::json;

    fn passthrough(name: &str) -> Arc<Interface> {
        Arc::new(
            Interface::new(name)
                .with_input(PortSpec::required("in_file", PortDataType::Image))
                .with_output(PortSpec::required("out_file", PortDataType::Image)),
        )
    }

    fn source() -> Arc<Interface> {
        Arc::new(Interface::new("source").with_output(PortSpec::required("out_file", PortDataType::Image)))
    }

    fn chain(len: usize) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new("wf", "Chain");
        let iface = passthrough("step");
        for i in 0..len {
            graph
                .add_named_node(format!("n{}", i), &iface, Bindings::new().deferred("in_file"))
                .unwrap();
        }
        for i in 1..len {
            graph
                .connect(&format!("n{}", i - 1), "out_file", &format!("n{}", i), "in_file")
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_auto_ids() {
        let mut graph = WorkflowGraph::new("wf", "Auto");
        let bet = passthrough("bet");
        let a = graph.add_node(&bet, Bindings::new().deferred("in_file")).unwrap();
        let b = graph.add_node(&bet, Bindings::new().deferred("in_file")).unwrap();
        assert_eq!(a, "bet-1");
        assert_eq!(b, "bet-2");
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut graph = WorkflowGraph::new("wf", "Dup");
        let bet = passthrough("bet");
        graph.add_named_node("x", &bet, Bindings::new().deferred("in_file")).unwrap();
        let err = graph
            .add_named_node("x", &bet, Bindings::new().deferred("in_file"))
            .unwrap_err();
        assert_eq!(err, GraphError::DuplicateNode("x".into()));
    }

    #[test]
    fn test_add_node_checks_literals() {
        let mut graph = WorkflowGraph::new("wf", "Literal");
        let err = graph
            .add_named_node("bet", &passthrough("bet"), Bindings::new().value("in_file", json!(42)))
            .unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { ref location, .. } if location == "bet.in_file"));

        let err = graph
            .add_named_node("bet", &passthrough("bet"), Bindings::new())
            .unwrap_err();
        assert!(matches!(err, GraphError::MissingRequiredInput { .. }));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_connect_sets_edge_binding() {
        let graph = chain(2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(
            graph.node("n1").unwrap().bindings.get("in_file"),
            Some(&Binding::Edge {
                node: "n0".into(),
                output: "out_file".into()
            })
        );
        assert_eq!(graph.incoming_edges("n1").count(), 1);
        assert_eq!(graph.edges()[0].to_string(), "n0.out_file -> n1.in_file");
    }

    #[test]
    fn test_connect_type_mismatch() {
        let mut graph = WorkflowGraph::new("wf", "Types");
        let xfm = Arc::new(
            Interface::new("reg").with_output(PortSpec::required("transform", PortDataType::Transform)),
        );
        graph.add_named_node("reg", &xfm, Bindings::new()).unwrap();
        graph
            .add_named_node("bet", &passthrough("bet"), Bindings::new().deferred("in_file"))
            .unwrap();

        let err = graph.connect("reg", "transform", "bet", "in_file").unwrap_err();
        assert_eq!(
            err,
            GraphError::TypeMismatch {
                location: "reg.transform -> bet.in_file".into(),
                expected: PortDataType::Image,
                found: "transform".into(),
            }
        );
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_connect_unknown_port() {
        let mut graph = chain(2);
        let err = graph.connect("n0", "mask", "n1", "in_file").unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownPort {
                direction: PortDirection::Output,
                ..
            }
        ));
        assert_eq!(
            graph.connect("n0", "out_file", "missing", "in_file").unwrap_err(),
            GraphError::UnknownNode("missing".into())
        );
    }

    #[test]
    fn test_single_writer() {
        let mut graph = chain(2);
        graph.add_named_node("src", &source(), Bindings::new()).unwrap();
        let err = graph.connect("src", "out_file", "n1", "in_file").unwrap_err();
        assert_eq!(
            err,
            GraphError::MultipleWriters {
                node: "n1".into(),
                port: "in_file".into()
            }
        );
    }

    #[test]
    fn test_literal_counts_as_writer() {
        let mut graph = WorkflowGraph::new("wf", "Literal writer");
        graph.add_named_node("src", &source(), Bindings::new()).unwrap();
        graph
            .add_named_node(
                "bet",
                &passthrough("bet"),
                Bindings::new().value("in_file", json!("T1w.nii.gz")),
            )
            .unwrap();
        assert!(matches!(
            graph.connect("src", "out_file", "bet", "in_file"),
            Err(GraphError::MultipleWriters { .. })
        ));
    }

    #[test]
    fn test_connect_rejects_cycle_with_path() {
        let mut graph = chain(3);
        let err = graph.connect("n2", "out_file", "n0", "in_file").unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                nodes: vec!["n2".into(), "n0".into(), "n1".into(), "n2".into()]
            }
        );
        assert_eq!(
            graph.node("n0").unwrap().bindings.get("in_file"),
            Some(&Binding::Deferred)
        );

        let mut graph = WorkflowGraph::new("wf", "Cycle");
        let two_in = Arc::new(
            Interface::new("merge")
                .with_input(PortSpec::optional("a", PortDataType::Image))
                .with_input(PortSpec::optional("b", PortDataType::Image))
                .with_output(PortSpec::required("out_file", PortDataType::Image)),
        );
        for id in ["a", "b", "c"] {
            graph.add_named_node(id, &two_in, Bindings::new()).unwrap();
        }
        graph.connect("a", "out_file", "b", "a").unwrap();
        graph.connect("b", "out_file", "c", "a").unwrap();

        let err = graph.connect("c", "out_file", "a", "a").unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                nodes: vec!["c".into(), "a".into(), "b".into(), "c".into()]
            }
        );
        assert_eq!(graph.edge_count(), 2);

        let err = graph.connect("a", "out_file", "a", "b").unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                nodes: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_incremental_order_reorders_backward_edge() {
        let mut graph = WorkflowGraph::new("wf", "Reorder");
        let bet = passthrough("bet");
        // Added target-first, so the edge runs against insertion order
        graph.add_named_node("late", &bet, Bindings::new().deferred("in_file")).unwrap();
        graph.add_named_node("mid", &bet, Bindings::new().deferred("in_file")).unwrap();
        graph.add_named_node("early", &source(), Bindings::new()).unwrap();

        graph.connect("mid", "out_file", "late", "in_file").unwrap();
        graph.connect("early", "out_file", "mid", "in_file").unwrap();

        assert_eq!(graph.topological_order(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn test_edge_bindings_downgraded_on_add() {
        let mut graph = WorkflowGraph::new("wf", "Downgrade");
        let mut bindings = Bindings::new();
        bindings.insert(
            "in_file",
            Binding::Edge {
                node: "elsewhere".into(),
                output: "out".into(),
            },
        );
        graph.add_named_node("bet", &passthrough("bet"), bindings).unwrap();
        assert_eq!(
            graph.node("bet").unwrap().bindings.get("in_file"),
            Some(&Binding::Deferred)
        );
    }
}
