//! Plan execution
//!
//! The [`Scheduler`] walks a frozen [`ExecutionPlan`] with a bounded worker
//! pool. Each node moves through
//! `Pending -> Ready -> Running -> {Succeeded | Failed}`, or ends `Skipped`
//! when an upstream node failed or the run was cancelled before it started.
//!
//! A node becomes ready as soon as all of its own dependencies succeeded;
//! there are no level barriers. Before invoking a step the scheduler derives
//! the node's [`CacheKey`] and serves a hit without running anything. With a
//! work directory configured, each invocation gets `<work>/<node>/<key>`, so
//! file outputs of different inputs never overwrite each other.
//!
//! Failure policy is fail-forward-skip: a failed node's transitive dependents
//! are skipped, independent branches keep running, and the run fails iff
//! some node failed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::descriptor::Interface;
use crate::error::StepError;
use crate::events::{EventSink, NullEventSink, WorkflowEvent};
use crate::plan::{ExecutionPlan, PlanInput, PlannedNode};
use crate::registry::{InterfaceRegistry, StepContext, StepExecutor};
use crate::types::{describe_value, NodeId, PortValues};

/// Lifecycle state of a node within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Terminal status of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Provenance for one node in one run
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub node_id: NodeId,
    pub interface: String,
    pub state: NodeState,
    /// Key derived from the resolved inputs, once the node was dispatched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<CacheKey>,
    /// Outputs came from the cache rather than a step invocation
    pub cached: bool,
    /// The step executor was called in this run
    pub invoked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Error payload for failed nodes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failed upstream node that caused a skip (`None` when cancelled)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_because: Option<NodeId>,
}

impl RunRecord {
    fn pending(node: &PlannedNode) -> Self {
        Self {
            node_id: node.id.clone(),
            interface: node.interface.name.clone(),
            state: NodeState::Pending,
            cache_key: None,
            cached: false,
            invoked: false,
            started_at: None,
            finished_at: None,
            error: None,
            skipped_because: None,
        }
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    /// One record per planned node, in plan order
    pub records: Vec<RunRecord>,
    /// Outputs of every succeeded node
    #[serde(skip)]
    pub outputs: HashMap<NodeId, PortValues>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn record(&self, node_id: &str) -> Option<&RunRecord> {
        self.records.iter().find(|r| r.node_id == node_id)
    }

    pub fn state(&self, node_id: &str) -> Option<NodeState> {
        self.record(node_id).map(|r| r.state)
    }

    pub fn failed_nodes(&self) -> Vec<&RunRecord> {
        self.records
            .iter()
            .filter(|r| r.state == NodeState::Failed)
            .collect()
    }

    /// Count of nodes in a given state
    pub fn count(&self, state: NodeState) -> usize {
        self.records.iter().filter(|r| r.state == state).count()
    }

    /// Nodes served from the cache
    pub fn cache_hits(&self) -> usize {
        self.records.iter().filter(|r| r.cached).count()
    }

    /// Steps that were actually invoked
    pub fn invocations(&self) -> usize {
        self.records.iter().filter(|r| r.invoked).count()
    }

    /// Get one output value of a node
    pub fn output(&self, node_id: &str, port: &str) -> Option<&serde_json::Value> {
        self.outputs.get(node_id).and_then(|o| o.get(port))
    }

    /// Human-readable summary listing every node's terminal state
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Run {} of '{}' {}: {} succeeded, {} failed, {} skipped ({} cache hits, {} invocations)\n",
            self.execution_id,
            self.graph_id,
            self.status,
            self.count(NodeState::Succeeded),
            self.count(NodeState::Failed),
            self.count(NodeState::Skipped),
            self.cache_hits(),
            self.invocations(),
        );
        let width = self.records.iter().map(|r| r.node_id.len()).max().unwrap_or(0);
        for record in &self.records {
            out.push_str(&format!("  {:<width$}  {}", record.node_id, record.state, width = width));
            if record.cached {
                out.push_str(" (cached)");
            }
            if let Some(error) = &record.error {
                out.push_str(&format!("  {}", error));
            }
            if let Some(cause) = &record.skipped_because {
                out.push_str(&format!("  (upstream '{}' failed)", cause));
            }
            out.push('\n');
        }
        out
    }
}

/// Engine knobs for one run
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of steps running at once (at least 1)
    pub max_concurrency: usize,
    /// Explicit run id; a UUID is generated when absent
    pub execution_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            execution_id: None,
        }
    }
}

/// Result of one dispatched node
enum NodeOutcome {
    Succeeded { outputs: PortValues, cached: bool },
    /// `invoked` is false when the node failed before its step was called
    Failed { error: StepError, invoked: bool },
}

impl NodeOutcome {
    fn not_invoked(error: StepError) -> Self {
        NodeOutcome::Failed {
            error,
            invoked: false,
        }
    }

    fn invoked(error: StepError) -> Self {
        NodeOutcome::Failed {
            error,
            invoked: true,
        }
    }
}

/// Everything a worker needs to run one node
struct NodeTask {
    ctx: StepContext,
    executor: Option<Arc<dyn StepExecutor>>,
    cache: Arc<dyn CacheStore>,
    key: CacheKey,
    inputs: PortValues,
}

impl NodeTask {
    async fn run(self) -> NodeOutcome {
        match self.cache.lookup(&self.key).await {
            Ok(Some(entry)) => match check_outputs(&self.ctx.interface, &entry.outputs) {
                Ok(()) => {
                    log::debug!("Cache hit for '{}' ({})", self.ctx.node_id, self.key);
                    return NodeOutcome::Succeeded {
                        outputs: entry.outputs,
                        cached: true,
                    };
                }
                Err(e) => {
                    log::warn!(
                        "Evicting cache entry {} for '{}': {}",
                        self.key,
                        self.ctx.node_id,
                        e
                    );
                    if let Err(e) = self.cache.evict(&self.key).await {
                        log::warn!("Failed to evict cache entry {}: {}", self.key, e);
                    }
                }
            },
            Ok(None) => log::debug!("Cache miss for '{}' ({})", self.ctx.node_id, self.key),
            Err(e) => log::warn!(
                "Cache lookup failed for '{}', treating as miss: {}",
                self.ctx.node_id,
                e
            ),
        }

        let Some(executor) = self.executor else {
            return NodeOutcome::not_invoked(StepError::NoBinding(self.ctx.interface.name.clone()));
        };

        let result = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(StepError::Cancelled),
            result = executor.execute(&self.ctx, self.inputs) => result,
        };
        let outputs = match result.and_then(|o| check_outputs(&self.ctx.interface, &o).map(|_| o)) {
            Ok(outputs) => outputs,
            Err(e) => return NodeOutcome::invoked(e),
        };

        let entry = CacheEntry::succeeded(
            self.key.clone(),
            self.ctx.interface.name.clone(),
            outputs.clone(),
        );
        if let Err(e) = self.cache.store(entry).await {
            log::warn!("Failed to store cache entry for '{}': {}", self.ctx.node_id, e);
        }

        NodeOutcome::Succeeded {
            outputs,
            cached: false,
        }
    }
}

/// Check step outputs against the interface's declared outputs
///
/// Required outputs must be present; every declared output that is present
/// must have the declared type.
pub fn check_outputs(interface: &Interface, outputs: &PortValues) -> Result<(), StepError> {
    for spec in &interface.outputs {
        match outputs.get(&spec.name) {
            None if spec.required => return Err(StepError::MissingOutput(spec.name.clone())),
            None => {}
            Some(value) if !spec.data_type.accepts(value) => {
                return Err(StepError::OutputTypeMismatch {
                    port: spec.name.clone(),
                    expected: spec.data_type,
                    found: describe_value(value),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Runs execution plans against a registry and a cache store
pub struct Scheduler {
    registry: Arc<InterfaceRegistry>,
    cache: Arc<dyn CacheStore>,
    events: Arc<dyn EventSink>,
    work_dir: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(registry: Arc<InterfaceRegistry>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            registry,
            cache,
            events: Arc::new(NullEventSink),
            work_dir: None,
        }
    }

    /// Send lifecycle events to a sink
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Give each node a scratch directory under `dir` (`<dir>/<node id>`)
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Run a plan with at most `max_concurrency` steps in flight
    pub async fn run(&self, plan: &ExecutionPlan, max_concurrency: usize) -> RunReport {
        self.run_with_cancel(plan, max_concurrency, CancellationToken::new())
            .await
    }

    /// Run a plan until it completes or `cancel` fires
    pub async fn run_with_cancel(
        &self,
        plan: &ExecutionPlan,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> RunReport {
        let config = SchedulerConfig {
            max_concurrency,
            execution_id: None,
        };
        self.run_with_config(plan, &config, cancel).await
    }

    pub async fn run_with_config(
        &self,
        plan: &ExecutionPlan,
        config: &SchedulerConfig,
        cancel: CancellationToken,
    ) -> RunReport {
        let execution_id = config
            .execution_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let max_concurrency = config.max_concurrency.max(1);
        let started_at = Utc::now();
        log::info!(
            "Starting run {} of '{}' ({} nodes, max concurrency {})",
            execution_id,
            plan.graph_id(),
            plan.len(),
            max_concurrency
        );
        self.emit(WorkflowEvent::RunStarted {
            graph_id: plan.graph_id().to_string(),
            execution_id: execution_id.clone(),
            node_count: plan.len(),
        });

        let mut run = RunState::new(plan);
        let mut running: JoinSet<(usize, NodeOutcome)> = JoinSet::new();
        let mut cancel_seen = false;

        loop {
            while running.len() < max_concurrency && !cancel.is_cancelled() {
                let Some(idx) = run.ready.pop_front() else {
                    break;
                };
                self.dispatch(plan, &mut run, idx, &execution_id, &cancel, &mut running);
            }
            if running.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    log::info!("Run {} cancelled, waiting for {} running steps", execution_id, running.len());
                    self.emit(WorkflowEvent::RunCancelled { execution_id: execution_id.clone() });
                }
                joined = running.join_next() => match joined {
                    Some(Ok((idx, outcome))) => {
                        self.complete(plan, &mut run, idx, outcome, &execution_id, &cancel);
                    }
                    Some(Err(e)) => log::error!("Worker task failed to join: {}", e),
                    None => {}
                },
            }
        }

        if cancel.is_cancelled() && !cancel_seen {
            self.emit(WorkflowEvent::RunCancelled {
                execution_id: execution_id.clone(),
            });
        }
        for idx in 0..plan.len() {
            if !run.records[idx].state.is_terminal() {
                run.records[idx].state = NodeState::Skipped;
                self.emit(WorkflowEvent::NodeSkipped {
                    node_id: run.records[idx].node_id.clone(),
                    execution_id: execution_id.clone(),
                    cause: None,
                });
            }
        }

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if run.records.iter().any(|r| r.state == NodeState::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let report = RunReport {
            execution_id: execution_id.clone(),
            graph_id: plan.graph_id().to_string(),
            status,
            records: run.records,
            outputs: run.outputs,
            started_at,
            finished_at: Utc::now(),
        };
        log::info!(
            "Run {} {}: {} succeeded, {} failed, {} skipped, {} cache hits",
            execution_id,
            status,
            report.count(NodeState::Succeeded),
            report.count(NodeState::Failed),
            report.count(NodeState::Skipped),
            report.cache_hits()
        );
        self.emit(WorkflowEvent::RunCompleted {
            graph_id: report.graph_id.clone(),
            execution_id,
            status: status.to_string(),
        });
        report
    }

    fn dispatch(
        &self,
        plan: &ExecutionPlan,
        run: &mut RunState,
        idx: usize,
        execution_id: &str,
        cancel: &CancellationToken,
        running: &mut JoinSet<(usize, NodeOutcome)>,
    ) {
        let node = &plan.nodes()[idx];
        run.records[idx].started_at = Some(Utc::now());

        let inputs = match resolve_inputs(node, &run.outputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.complete(plan, run, idx, NodeOutcome::not_invoked(e), execution_id, cancel);
                return;
            }
        };
        let key = CacheKey::derive(&node.interface, &inputs);

        run.records[idx].state = NodeState::Running;
        run.records[idx].cache_key = Some(key.clone());
        log::debug!("Dispatching '{}' ({})", node.id, node.interface.name);
        self.emit(WorkflowEvent::NodeStarted {
            node_id: node.id.clone(),
            execution_id: execution_id.to_string(),
        });

        let task = NodeTask {
            ctx: StepContext {
                execution_id: execution_id.to_string(),
                node_id: node.id.clone(),
                interface: node.interface.clone(),
                work_dir: self
                    .work_dir
                    .as_ref()
                    .map(|dir| dir.join(&node.id).join(key.as_str())),
                cancel: cancel.child_token(),
            },
            executor: self.registry.executor(&node.interface.name),
            cache: self.cache.clone(),
            key,
            inputs,
        };
        running.spawn(async move {
            // Run in a separate task so a panicking step becomes a node failure
            let outcome = match tokio::spawn(task.run()).await {
                Ok(outcome) => outcome,
                Err(e) => NodeOutcome::invoked(StepError::failed(format!("step panicked: {}", e))),
            };
            (idx, outcome)
        });
    }

    fn complete(
        &self,
        plan: &ExecutionPlan,
        run: &mut RunState,
        idx: usize,
        outcome: NodeOutcome,
        execution_id: &str,
        cancel: &CancellationToken,
    ) {
        let node = &plan.nodes()[idx];
        let record = &mut run.records[idx];
        record.finished_at = Some(Utc::now());

        match outcome {
            NodeOutcome::Succeeded { outputs, cached } => {
                record.state = NodeState::Succeeded;
                record.cached = cached;
                record.invoked = !cached;
                if cached {
                    self.emit(WorkflowEvent::NodeCacheHit {
                        node_id: node.id.clone(),
                        execution_id: execution_id.to_string(),
                        cache_key: record.cache_key.as_ref().map(|k| k.to_string()).unwrap_or_default(),
                    });
                }
                self.emit(WorkflowEvent::NodeSucceeded {
                    node_id: node.id.clone(),
                    execution_id: execution_id.to_string(),
                    cached,
                });
                run.outputs.insert(node.id.clone(), outputs);

                for dependent in &node.dependents {
                    let Some(j) = plan.position(dependent) else {
                        continue;
                    };
                    run.remaining[j] = run.remaining[j].saturating_sub(1);
                    if run.remaining[j] == 0
                        && run.records[j].state == NodeState::Pending
                        && !cancel.is_cancelled()
                    {
                        run.records[j].state = NodeState::Ready;
                        run.ready.push_back(j);
                    }
                }
            }
            NodeOutcome::Failed { error, invoked } => {
                log::warn!("Node '{}' failed: {}", node.id, error);
                record.state = NodeState::Failed;
                record.invoked = invoked;
                record.error = Some(error.to_string());
                self.emit(WorkflowEvent::NodeFailed {
                    node_id: node.id.clone(),
                    execution_id: execution_id.to_string(),
                    error: error.to_string(),
                });

                let mut skipped = 0;
                for descendant in plan.descendants(&node.id) {
                    let Some(j) = plan.position(&descendant) else {
                        continue;
                    };
                    if run.records[j].state != NodeState::Pending {
                        continue;
                    }
                    run.records[j].state = NodeState::Skipped;
                    run.records[j].skipped_because = Some(node.id.clone());
                    skipped += 1;
                    self.emit(WorkflowEvent::NodeSkipped {
                        node_id: descendant,
                        execution_id: execution_id.to_string(),
                        cause: Some(node.id.clone()),
                    });
                }
                if skipped > 0 {
                    log::info!("Skipping {} downstream nodes of failed '{}'", skipped, node.id);
                }
            }
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.events.send(event) {
            log::debug!("Dropped workflow event: {}", e);
        }
    }
}

/// Mutable bookkeeping for one run, indexed by plan position
struct RunState {
    records: Vec<RunRecord>,
    remaining: Vec<usize>,
    ready: VecDeque<usize>,
    outputs: HashMap<NodeId, PortValues>,
}

impl RunState {
    fn new(plan: &ExecutionPlan) -> Self {
        let mut records: Vec<RunRecord> = plan.nodes().iter().map(RunRecord::pending).collect();
        let remaining: Vec<usize> = plan.nodes().iter().map(|n| n.dependencies.len()).collect();
        let mut ready = VecDeque::new();
        for (idx, left) in remaining.iter().enumerate() {
            if *left == 0 {
                records[idx].state = NodeState::Ready;
                ready.push_back(idx);
            }
        }
        Self {
            records,
            remaining,
            ready,
            outputs: HashMap::new(),
        }
    }
}

/// Build a node's input mapping from literals and upstream outputs
///
/// An upstream output that was legitimately not produced (an optional output)
/// falls back to the input's default, or leaves an optional input unset.
fn resolve_inputs(
    node: &PlannedNode,
    outputs: &HashMap<NodeId, PortValues>,
) -> Result<PortValues, StepError> {
    let mut resolved = PortValues::new();
    for (port, input) in &node.inputs {
        let value = match input {
            PlanInput::Literal(value) => Some(value.clone()),
            PlanInput::Output { node: src, port: out } => {
                outputs.get(src).and_then(|o| o.get(out)).cloned()
            }
        };
        let value = match value {
            Some(value) => Some(value),
            None => {
                let spec = node.interface.input(port);
                match spec.and_then(|s| s.default.clone()) {
                    Some(default) => Some(default),
                    None if spec.map(|s| s.required).unwrap_or(false) => {
                        return Err(StepError::failed(format!(
                            "required input '{}' has no value from upstream",
                            port
                        )))
                    }
                    None => None,
                }
            }
        };
        if let Some(value) = value {
            resolved.insert(port.clone(), value);
        }
    }
    Ok(resolved)
}
