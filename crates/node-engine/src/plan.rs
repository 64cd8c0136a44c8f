//! Freezing a graph into an execution plan
//!
//! [`freeze`] flattens nested sub-workflows, resolves every input of every
//! step to either a literal (explicit or defaulted) or an upstream output,
//! rejects anything still unbound, and sorts the result into ready layers.
//! The plan is immutable; the scheduler only reads it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::descriptor::Interface;
use crate::error::{GraphError, GraphResult, PortDirection};
use crate::graph::{NodeKind, WorkflowGraph};
use crate::groups::SCOPE_SEPARATOR;
use crate::types::{Binding, NodeId, PortId};

/// Where a planned input gets its value
#[derive(Debug, Clone, PartialEq)]
pub enum PlanInput {
    /// A literal, either bound explicitly or filled from the port default
    Literal(serde_json::Value),
    /// An output of an upstream planned node
    Output { node: NodeId, port: PortId },
}

/// One step in a frozen plan
#[derive(Debug, Clone)]
pub struct PlannedNode {
    /// Flattened id (`group/inner` for nodes inside sub-workflows)
    pub id: NodeId,
    pub interface: Arc<Interface>,
    /// Every input that has a value, keyed by input name
    pub inputs: BTreeMap<PortId, PlanInput>,
    /// Upstream nodes, deduplicated, in plan order
    pub dependencies: Vec<NodeId>,
    /// Downstream nodes, deduplicated, in plan order
    pub dependents: Vec<NodeId>,
    /// Index of the ready layer this node belongs to
    pub layer: usize,
}

/// An immutable, topologically ordered plan
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph_id: String,
    nodes: Vec<PlannedNode>,
    index: HashMap<NodeId, usize>,
    layers: Vec<Vec<NodeId>>,
}

impl ExecutionPlan {
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Planned nodes in topological order
    pub fn nodes(&self) -> &[PlannedNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&PlannedNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Position of a node in the topological order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Ready layers: every node's dependencies lie in earlier layers
    pub fn layers(&self) -> &[Vec<NodeId>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All transitive dependents of a node, in plan order
    pub fn descendants(&self, id: &str) -> Vec<NodeId> {
        let mut marked = vec![false; self.nodes.len()];
        let mut stack: Vec<usize> = self.index.get(id).copied().into_iter().collect();
        while let Some(i) = stack.pop() {
            for dep in &self.nodes[i].dependents {
                if let Some(&j) = self.index.get(dep) {
                    if !marked[j] {
                        marked[j] = true;
                        stack.push(j);
                    }
                }
            }
        }
        self.nodes
            .iter()
            .zip(marked)
            .filter(|(_, m)| *m)
            .map(|(n, _)| n.id.clone())
            .collect()
    }
}

/// A step node after flattening, before ordering
struct FlatNode {
    id: NodeId,
    interface: Arc<Interface>,
    inputs: BTreeMap<PortId, PlanInput>,
}

/// Values flowing into a sub-workflow, keyed by (internal node, internal port)
type Inherited = HashMap<(NodeId, PortId), PlanInput>;

/// Flatten, validate and sort a graph
///
/// Fails with `MissingRequiredInput` if a required input of any step has no
/// literal, default or edge (including `Deferred` inputs never connected),
/// and with `Cycle` if no topological order exists.
pub fn freeze(graph: &WorkflowGraph) -> GraphResult<ExecutionPlan> {
    let mut flat = Vec::new();
    flatten(graph, "", &Inherited::new(), &mut flat)?;

    for node in &mut flat {
        for spec in &node.interface.inputs {
            if node.inputs.contains_key(&spec.name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    node.inputs
                        .insert(spec.name.clone(), PlanInput::Literal(default.clone()));
                }
                None if spec.required => {
                    return Err(GraphError::MissingRequiredInput {
                        node: node.id.clone(),
                        port: spec.name.clone(),
                    });
                }
                None => {}
            }
        }
    }

    let plan = order(&graph.id, flat)?;
    log::debug!(
        "Froze graph '{}' into {} nodes across {} layers",
        plan.graph_id,
        plan.nodes.len(),
        plan.layers.len()
    );
    Ok(plan)
}

fn flatten(
    graph: &WorkflowGraph,
    prefix: &str,
    inherited: &Inherited,
    out: &mut Vec<FlatNode>,
) -> GraphResult<()> {
    for node in graph.nodes() {
        let flat_id = format!("{}{}", prefix, node.id);

        let mut inputs = BTreeMap::new();
        for (port, binding) in node.bindings.iter() {
            let resolved = match binding {
                Binding::Value { value } => Some(PlanInput::Literal(value.clone())),
                Binding::Edge { node: src, output } => {
                    Some(resolve_output(graph, prefix, src, output)?)
                }
                Binding::Deferred => None,
            };
            if let Some(resolved) = resolved {
                inputs.insert(port.clone(), resolved);
            }
        }
        for ((inner, port), value) in inherited {
            if *inner == node.id {
                inputs.insert(port.clone(), value.clone());
            }
        }

        match &node.kind {
            NodeKind::Step { interface } => out.push(FlatNode {
                id: flat_id,
                interface: interface.clone(),
                inputs,
            }),
            NodeKind::Group(group) => {
                let mut child = Inherited::new();
                for mapping in group.exposed_inputs() {
                    if let Some(value) = inputs.remove(&mapping.port) {
                        child.insert(
                            (mapping.internal_node.clone(), mapping.internal_port.clone()),
                            value,
                        );
                    }
                }
                let child_prefix = format!("{}{}", flat_id, SCOPE_SEPARATOR);
                flatten(group.graph(), &child_prefix, &child, out)?;
            }
        }
    }
    Ok(())
}

/// Follow an output through nested groups down to the producing step
fn resolve_output(
    graph: &WorkflowGraph,
    prefix: &str,
    node_id: &str,
    port: &str,
) -> GraphResult<PlanInput> {
    let node = graph
        .node(node_id)
        .ok_or_else(|| GraphError::UnknownNode(format!("{}{}", prefix, node_id)))?;
    match &node.kind {
        NodeKind::Step { .. } => Ok(PlanInput::Output {
            node: format!("{}{}", prefix, node_id),
            port: port.to_string(),
        }),
        NodeKind::Group(group) => {
            let mapping = group
                .exposed_output(port)
                .ok_or_else(|| GraphError::UnknownPort {
                    node: format!("{}{}", prefix, node_id),
                    port: port.to_string(),
                    direction: PortDirection::Output,
                })?;
            let child_prefix = format!("{}{}{}", prefix, node_id, SCOPE_SEPARATOR);
            resolve_output(
                group.graph(),
                &child_prefix,
                &mapping.internal_node,
                &mapping.internal_port,
            )
        }
    }
}

/// Kahn layering with insertion order as the tie-break
fn order(graph_id: &str, flat: Vec<FlatNode>) -> GraphResult<ExecutionPlan> {
    let position: HashMap<NodeId, usize> = flat
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); flat.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); flat.len()];
    for (i, node) in flat.iter().enumerate() {
        for input in node.inputs.values() {
            if let PlanInput::Output { node: src, .. } = input {
                let j = *position
                    .get(src)
                    .ok_or_else(|| GraphError::UnknownNode(src.clone()))?;
                if !deps[i].contains(&j) {
                    deps[i].push(j);
                    dependents[j].push(i);
                }
            }
        }
    }

    let mut indegree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut layer_of = vec![usize::MAX; flat.len()];
    let mut layers_idx: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..flat.len()).filter(|&i| indegree[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            layer_of[i] = layers_idx.len();
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    next.push(j);
                }
            }
        }
        next.sort_unstable();
        layers_idx.push(current);
        current = next;
    }

    let stuck: Vec<NodeId> = flat
        .iter()
        .enumerate()
        .filter(|(i, _)| layer_of[*i] == usize::MAX)
        .map(|(_, n)| n.id.clone())
        .collect();
    if !stuck.is_empty() {
        return Err(GraphError::Cycle { nodes: stuck });
    }

    let sorted: Vec<usize> = layers_idx.iter().flatten().copied().collect();
    let rank: HashMap<usize, usize> = sorted.iter().enumerate().map(|(r, &i)| (i, r)).collect();
    let names: Vec<NodeId> = flat.iter().map(|n| n.id.clone()).collect();
    let in_plan_order = |mut idx: Vec<usize>| -> Vec<NodeId> {
        idx.sort_unstable_by_key(|i| rank.get(i).copied().unwrap_or(usize::MAX));
        idx.into_iter().map(|i| names[i].clone()).collect()
    };

    let mut slots: Vec<Option<FlatNode>> = flat.into_iter().map(Some).collect();
    let mut nodes = Vec::with_capacity(sorted.len());
    for &i in &sorted {
        if let Some(node) = slots[i].take() {
            nodes.push(PlannedNode {
                id: node.id,
                interface: node.interface,
                inputs: node.inputs,
                dependencies: in_plan_order(deps[i].clone()),
                dependents: in_plan_order(dependents[i].clone()),
                layer: layer_of[i],
            });
        }
    }

    let index = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();
    let layers = layers_idx
        .into_iter()
        .map(|layer| layer.into_iter().map(|i| names[i].clone()).collect())
        .collect();

    Ok(ExecutionPlan {
        graph_id: graph_id.to_string(),
        nodes,
        index,
        layers,
    })
}
