//! Pipeline configuration documents
//!
//! A pipeline document declares everything the CLI needs to build and run a
//! workflow: interface contracts (optionally bound to external commands),
//! presets, nodes, edges, reusable sub-workflows, and an optional report.
//!
//! ```yaml
//! name: anat-preproc
//! cache_dir: .niflow/cache
//! max_concurrency: 4
//! presets: presets/
//! flavor: testing
//! interfaces:
//!   - name: bet
//!     inputs:
//!       - {name: in_file, type: image, required: true}
//!     outputs:
//!       - {name: out_file, type: image, required: true}
//!     command:
//!       program: bet
//!       args: ["{in_file}", "{work_dir}/brain.nii.gz"]
//!       outputs: {out_file: brain.nii.gz}
//! nodes:
//!   - id: strip
//!     interface: bet
//!     inputs: {in_file: sub-01_T1w.nii.gz}
//! edges:
//!   - {from: strip.out_file, to: reg.moving_image}
//! ```
//!
//! Relative paths are resolved against the directory holding the document.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use node_engine::{
    Binding, Bindings, Interface, InterfaceRegistry, NodeGroup, PortSpec, WorkflowGraph,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use workflow_nodes::{register_builtins, CommandSpec, CommandStep};

use crate::error::{ConfigError, Result};
use crate::format::{read_document, ConfigFormat};
use crate::presets::{preset_bindings, PresetLibrary};

const DEFAULT_CACHE_DIR: &str = ".niflow/cache";
const DEFAULT_WORK_DIR: &str = ".niflow/work";

/// Top-level pipeline document
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline name, also used as the graph id
    pub name: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Root of per-node scratch directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub presets: Option<PresetSource>,
    /// Preset flavor tried before the base preset (e.g. `precise`)
    #[serde(default)]
    pub flavor: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceDecl>,
    #[serde(default)]
    pub subworkflows: Vec<SubworkflowDecl>,
    #[serde(default)]
    pub nodes: Vec<NodeDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
    #[serde(default)]
    pub report: Option<ReportDecl>,

    #[serde(skip)]
    base_dir: PathBuf,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIR)
}

/// Where presets come from: a file or directory path, or an inline mapping
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PresetSource {
    Path(PathBuf),
    Inline(Map<String, Value>),
}

/// An interface contract, optionally bound to an external command
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

impl InterfaceDecl {
    pub fn to_interface(&self) -> Interface {
        Interface {
            name: self.name.clone(),
            description: self.description.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }
}

/// A node: an interface instance or a sub-workflow instance
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDecl {
    pub id: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    /// Base preset name; the pipeline flavor is applied on top
    #[serde(default)]
    pub preset: Option<String>,
    /// Literal inputs, overriding preset values
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

/// `from: node.output` -> `to: node.input`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeDecl {
    pub from: String,
    pub to: String,
}

/// A reusable sub-workflow, instantiated by nodes with `workflow: <id>`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubworkflowDecl {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDecl>,
    #[serde(default)]
    pub edges: Vec<EdgeDecl>,
    #[serde(default)]
    pub expose: ExposeDecl,
}

/// Group-level port name -> `node.port` inside the sub-workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposeDecl {
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportDecl {
    /// Report template document (YAML or JSON)
    pub template: PathBuf,
    /// HTML file to write
    pub output: PathBuf,
}

impl PipelineConfig {
    /// Parse a document in the given format
    pub fn parse(text: &str, format: ConfigFormat) -> Result<Self> {
        format.parse(text, "pipeline")
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Self::parse(text, ConfigFormat::Yaml)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Self::parse(text, ConfigFormat::Json)
    }

    /// Read a document from disk; relative paths resolve against its directory
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config: Self = read_document(path)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        log::debug!("Loaded pipeline '{}' from {:?}", config.name, path);
        Ok(config)
    }

    /// Directory relative paths are resolved against
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.resolve_path(&self.cache_dir)
    }

    pub fn work_path(&self) -> PathBuf {
        self.resolve_path(&self.work_dir)
    }

    /// Built-in interfaces plus every declared one
    ///
    /// Declarations with a `command` get a [`CommandStep`] binding; the rest
    /// are registered as bare contracts.
    pub fn registry(&self) -> Result<InterfaceRegistry> {
        let mut registry = InterfaceRegistry::new();
        register_builtins(&mut registry).map_err(|e| ConfigError::graph("interfaces", e))?;

        for (i, decl) in self.interfaces.iter().enumerate() {
            let path = format!("interfaces[{}]", i);
            if let Some(command) = &decl.command {
                if let Some(port) = command.outputs.keys().find(|p| {
                    !decl.outputs.iter().any(|o| &o.name == *p)
                }) {
                    return Err(ConfigError::malformed(
                        format!("{}.command.outputs.{}", path, port),
                        format!("'{}' is not a declared output of '{}'", port, decl.name),
                    ));
                }
            }

            let interface = decl.to_interface();
            let registered = match &decl.command {
                Some(command) => registry
                    .register_with_executor(interface, Arc::new(CommandStep::new(command.clone()))),
                None => registry.register(interface),
            };
            registered.map_err(|e| ConfigError::graph(path, e))?;
        }
        Ok(registry)
    }

    /// Load the configured presets (empty when none are configured)
    pub fn load_presets(&self) -> Result<PresetLibrary> {
        match &self.presets {
            None => Ok(PresetLibrary::new()),
            Some(PresetSource::Path(path)) => PresetLibrary::from_path(self.resolve_path(path)),
            Some(PresetSource::Inline(presets)) => PresetLibrary::from_mapping(presets.clone()),
        }
    }

    /// Build the workflow graph described by `nodes` and `edges`
    ///
    /// Inputs targeted by an edge are bound as deferred automatically.
    /// Errors name the offending entry (`nodes[2].interface`,
    /// `subworkflows[0].edges[1]`).
    pub fn build(&self, registry: &InterfaceRegistry, presets: &PresetLibrary) -> Result<WorkflowGraph> {
        let mut assembler = Assembler {
            config: self,
            registry,
            presets,
            stack: Vec::new(),
        };
        let graph = assembler.scope("", &self.name, &self.name, &self.nodes, &self.edges, &[])?;
        log::info!(
            "Built pipeline '{}': {} nodes, {} edges",
            self.name,
            graph.node_count(),
            graph.edge_count()
        );
        Ok(graph)
    }
}

/// Split `node.port` at the last dot
fn endpoint<'s>(text: &'s str, path: &str) -> Result<(&'s str, &'s str)> {
    match text.rsplit_once('.') {
        Some((node, port)) if !node.is_empty() && !port.is_empty() => Ok((node, port)),
        _ => Err(ConfigError::malformed(
            path,
            format!("expected 'node.port', found '{}'", text),
        )),
    }
}

struct Assembler<'a> {
    config: &'a PipelineConfig,
    registry: &'a InterfaceRegistry,
    presets: &'a PresetLibrary,
    /// Sub-workflows currently being expanded
    stack: Vec<String>,
}

impl<'a> Assembler<'a> {
    fn scope(
        &mut self,
        prefix: &str,
        id: &str,
        name: &str,
        nodes: &[NodeDecl],
        edges: &[EdgeDecl],
        exposed: &[(String, String)],
    ) -> Result<WorkflowGraph> {
        let mut wires = Vec::with_capacity(edges.len());
        let mut targets: HashSet<(String, String)> = exposed.iter().cloned().collect();
        for (i, edge) in edges.iter().enumerate() {
            let path = format!("{}edges[{}]", prefix, i);
            let from = endpoint(&edge.from, &format!("{}.from", path))?;
            let to = endpoint(&edge.to, &format!("{}.to", path))?;
            targets.insert((to.0.to_string(), to.1.to_string()));
            wires.push((path, from, to));
        }

        let mut graph = WorkflowGraph::new(id, name);
        for (i, decl) in nodes.iter().enumerate() {
            let path = format!("{}nodes[{}]", prefix, i);
            self.node(&mut graph, &path, decl, &targets)?;
        }

        for (path, (source, output), (target, input)) in wires {
            graph
                .connect(source, output, target, input)
                .map_err(|e| ConfigError::graph(path, e))?;
        }
        Ok(graph)
    }

    fn node(
        &mut self,
        graph: &mut WorkflowGraph,
        path: &str,
        decl: &NodeDecl,
        targets: &HashSet<(String, String)>,
    ) -> Result<()> {
        let deferred = |mut bindings: Bindings| {
            for (node, port) in targets {
                if node == &decl.id && !bindings.contains(port) {
                    bindings.insert(port.clone(), Binding::Deferred);
                }
            }
            bindings
        };

        match (&decl.interface, &decl.workflow) {
            (Some(interface), None) => {
                let iface = self
                    .registry
                    .resolve(interface)
                    .map_err(|e| ConfigError::graph(format!("{}.interface", path), e))?;

                let mut bindings = match &decl.preset {
                    Some(base) => {
                        let (chosen, params) = self
                            .presets
                            .resolve_flavored(base, self.config.flavor.as_deref())?;
                        log::debug!("Node '{}' uses preset '{}'", decl.id, chosen);
                        preset_bindings(chosen, params, &iface)?
                    }
                    None => Bindings::new(),
                };
                for (port, value) in &decl.inputs {
                    bindings.insert(port.clone(), Binding::Value { value: value.clone() });
                }

                graph
                    .add_named_node(&decl.id, &iface, deferred(bindings))
                    .map_err(|e| ConfigError::graph(path, e))?;
            }
            (None, Some(workflow)) => {
                if decl.preset.is_some() {
                    return Err(ConfigError::malformed(
                        format!("{}.preset", path),
                        "presets apply to interface nodes only",
                    ));
                }
                let group = self.group(&format!("{}.workflow", path), workflow, &decl.id)?;
                let bindings = decl
                    .inputs
                    .iter()
                    .map(|(port, value)| (port.clone(), value.clone()))
                    .collect::<Bindings>();

                graph
                    .add_group(group, deferred(bindings))
                    .map_err(|e| ConfigError::graph(path, e))?;
            }
            _ => {
                return Err(ConfigError::malformed(
                    path,
                    "exactly one of 'interface' or 'workflow' is required",
                ))
            }
        }
        Ok(())
    }

    /// Instantiate sub-workflow `workflow` as a group with id `node_id`
    fn group(&mut self, path: &str, workflow: &str, node_id: &str) -> Result<NodeGroup> {
        let config = self.config;
        let (index, decl) = config
            .subworkflows
            .iter()
            .enumerate()
            .find(|(_, w)| w.id == workflow)
            .ok_or_else(|| {
                ConfigError::malformed(path, format!("unknown sub-workflow '{}'", workflow))
            })?;
        if self.stack.iter().any(|w| w == workflow) {
            return Err(ConfigError::malformed(
                path,
                format!(
                    "sub-workflow '{}' includes itself ({} -> {})",
                    workflow,
                    self.stack.join(" -> "),
                    workflow
                ),
            ));
        }

        let prefix = format!("subworkflows[{}].", index);
        let mut inputs = Vec::with_capacity(decl.expose.inputs.len());
        for (port, target) in &decl.expose.inputs {
            let (node, internal) = endpoint(target, &format!("{}expose.inputs.{}", prefix, port))?;
            inputs.push((port, node.to_string(), internal.to_string()));
        }
        let exposed: Vec<(String, String)> =
            inputs.iter().map(|(_, n, p)| (n.clone(), p.clone())).collect();

        self.stack.push(workflow.to_string());
        let name = decl.name.as_deref().unwrap_or(&decl.id);
        let graph = self.scope(&prefix, &decl.id, name, &decl.nodes, &decl.edges, &exposed);
        self.stack.pop();

        let mut group = NodeGroup::new(node_id, graph?);
        if let Some(description) = &decl.description {
            group = group.with_description(description.clone());
        }
        for (port, node, internal) in &inputs {
            group = group
                .expose_input(port.as_str(), node, internal)
                .map_err(|e| ConfigError::graph(format!("{}expose.inputs.{}", prefix, port), e))?;
        }
        for (port, source) in &decl.expose.outputs {
            let key = format!("{}expose.outputs.{}", prefix, port);
            let (node, internal) = endpoint(source, &key)?;
            group = group
                .expose_output(port.as_str(), node, internal)
                .map_err(|e| ConfigError::graph(key, e))?;
        }
        Ok(group)
    }
}
