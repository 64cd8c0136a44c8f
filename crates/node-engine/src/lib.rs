//! Node Engine - typed workflow graphs for neuroimaging pipelines
//!
//! This crate composes and executes pipelines of opaque processing steps
//! (skull stripping, registration, resampling, ...). It supports:
//!
//! - An interface registry with typed input/output contracts
//! - Graph construction with eager type, single-writer and cycle checks
//! - Nested sub-workflows, flattened into one plan at freeze time
//! - A content-addressed cache so unchanged steps are never re-run
//! - A bounded parallel scheduler with fail-forward-skip semantics
//!
//! # Architecture
//!
//! - `InterfaceRegistry`: contracts plus step bindings
//! - `WorkflowGraph` / `NodeGroup`: construction-time graph and sub-workflows
//! - `freeze` -> `ExecutionPlan`: immutable, layered topological order
//! - `Scheduler`: runs a plan against a `CacheStore`, emits `WorkflowEvent`s
//!
//! # Example
//!
//! ```ignore
//! use node_engine::{freeze, Bindings, MemoryCache, Scheduler, WorkflowBuilder};
//!
//! let graph = WorkflowBuilder::new(&registry, "anat", "Anatomical")
//!     .node("bet", "bet", Bindings::new().value("in_file", json!("T1w.nii.gz")))
//!     .build()?;
//! let plan = freeze(&graph)?;
//! let report = Scheduler::new(Arc::new(registry), Arc::new(MemoryCache::new()))
//!     .run(&plan, 4)
//!     .await;
//! ```

pub mod builder;
pub mod cache;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod groups;
pub mod plan;
pub mod registry;
pub mod types;

// Re-export key types
pub use builder::WorkflowBuilder;
pub use cache::{CacheEntry, CacheKey, CacheStore, DiskCache, MemoryCache};
pub use descriptor::{validate_bindings, BindingError, Interface, PortSpec};
pub use error::{
    CacheError, GraphError, GraphResult, NodeEngineError, PortDirection, Result, StepError,
};
pub use events::{ChannelEventSink, EventError, EventSink, NullEventSink, VecEventSink, WorkflowEvent};
pub use executor::{
    check_outputs, NodeState, RunRecord, RunReport, RunStatus, Scheduler, SchedulerConfig,
};
pub use graph::{GraphEdge, GraphNode, NodeKind, WorkflowGraph};
pub use groups::{NodeGroup, PortMapping};
pub use plan::{freeze, ExecutionPlan, PlanInput, PlannedNode};
pub use registry::{CallbackStep, InterfaceRegistry, StepContext, StepExecutor, SyncCallbackStep};
pub use types::{Binding, Bindings, NodeId, PortDataType, PortId, PortValues};
