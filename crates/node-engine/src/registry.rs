//! Interface registry and step bindings
//!
//! The registry maps interface names to their typed contracts and, for
//! interfaces that can run, to a [`StepExecutor`] that performs the actual
//! work (usually an external neuroimaging tool).
//!
//! # Usage
//!
//! ```ignore
//! use node_engine::{InterfaceRegistry, Interface, PortSpec, PortDataType};
//!
//! let mut registry = InterfaceRegistry::new();
//! registry.register_callback(
//!     Interface::new("echo").with_input(PortSpec::required("value", PortDataType::Any)),
//!     |_ctx, inputs| async move { Ok(inputs) },
//! )?;
//! let echo = registry.resolve("echo")?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::descriptor::Interface;
use crate::error::{GraphError, GraphResult, StepError};
use crate::types::{NodeId, PortValues};

/// Per-run information handed to a step
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Identifier of the run this step belongs to
    pub execution_id: String,
    /// Id of the node being executed (flattened, e.g. "anat/skullstrip")
    pub node_id: NodeId,
    /// Contract of the node's interface
    pub interface: Arc<Interface>,
    /// Scratch directory reserved for this invocation (`<work>/<node>/<key>`),
    /// if the scheduler has one
    pub work_dir: Option<PathBuf>,
    /// Fires when the run is cancelled
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Context for invoking a step outside of a scheduled run
    pub fn detached(node_id: impl Into<String>, interface: Arc<Interface>) -> Self {
        Self {
            execution_id: "detached".to_string(),
            node_id: node_id.into(),
            interface,
            work_dir: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Runtime binding for one interface
///
/// The scheduler treats this as an opaque, possibly long-running call.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step with fully resolved inputs
    async fn execute(
        &self,
        ctx: &StepContext,
        inputs: PortValues,
    ) -> std::result::Result<PortValues, StepError>;
}

type BoxedStepFuture =
    Pin<Box<dyn Future<Output = std::result::Result<PortValues, StepError>> + Send>>;

/// Async closure wrapped as a [`StepExecutor`]
pub struct CallbackStep {
    callback: Box<dyn Fn(StepContext, PortValues) -> BoxedStepFuture + Send + Sync>,
}

impl CallbackStep {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(StepContext, PortValues) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<PortValues, StepError>> + Send + 'static,
    {
        Self {
            callback: Box::new(move |ctx, inputs| Box::pin(callback(ctx, inputs))),
        }
    }
}

#[async_trait]
impl StepExecutor for CallbackStep {
    async fn execute(
        &self,
        ctx: &StepContext,
        inputs: PortValues,
    ) -> std::result::Result<PortValues, StepError> {
        (self.callback)(ctx.clone(), inputs).await
    }
}

type SyncStepFn =
    dyn Fn(&StepContext, PortValues) -> std::result::Result<PortValues, StepError> + Send + Sync;

/// Blocking closure wrapped as a [`StepExecutor`]
///
/// The closure runs on tokio's blocking pool so a long computation does not
/// stall the scheduler.
pub struct SyncCallbackStep {
    callback: Arc<SyncStepFn>,
}

impl SyncCallbackStep {
    pub fn new(
        callback: impl Fn(&StepContext, PortValues) -> std::result::Result<PortValues, StepError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            callback: Arc::new(callback),
        }
    }
}

#[async_trait]
impl StepExecutor for SyncCallbackStep {
    async fn execute(
        &self,
        ctx: &StepContext,
        inputs: PortValues,
    ) -> std::result::Result<PortValues, StepError> {
        let callback = self.callback.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || callback(&ctx, inputs))
            .await
            .map_err(|e| StepError::failed(format!("step panicked: {}", e)))?
    }
}

/// A registration entry combining the contract with an optional binding
struct RegistryEntry {
    interface: Arc<Interface>,
    executor: Option<Arc<dyn StepExecutor>>,
}

/// Registry of interfaces and their step bindings
pub struct InterfaceRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl std::fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceRegistry")
            .field("interfaces", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InterfaceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register an interface without a step binding
    ///
    /// Nodes of this interface can be built and validated; running them fails
    /// with [`StepError::NoBinding`] unless an executor is bound later.
    pub fn register(&mut self, interface: Interface) -> GraphResult<Arc<Interface>> {
        self.insert(interface, None)
    }

    /// Register an interface together with its step binding
    pub fn register_with_executor(
        &mut self,
        interface: Interface,
        executor: Arc<dyn StepExecutor>,
    ) -> GraphResult<Arc<Interface>> {
        self.insert(interface, Some(executor))
    }

    /// Register an interface backed by an async closure
    pub fn register_callback<F, Fut>(
        &mut self,
        interface: Interface,
        callback: F,
    ) -> GraphResult<Arc<Interface>>
    where
        F: Fn(StepContext, PortValues) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<PortValues, StepError>> + Send + 'static,
    {
        self.insert(interface, Some(Arc::new(CallbackStep::new(callback))))
    }

    fn insert(
        &mut self,
        interface: Interface,
        executor: Option<Arc<dyn StepExecutor>>,
    ) -> GraphResult<Arc<Interface>> {
        if self.entries.contains_key(&interface.name) {
            return Err(GraphError::DuplicateInterface(interface.name));
        }
        let interface = Arc::new(interface);
        log::debug!("Registered interface '{}'", interface.name);
        self.entries.insert(
            interface.name.clone(),
            RegistryEntry {
                interface: interface.clone(),
                executor,
            },
        );
        Ok(interface)
    }

    /// Attach (or replace) the step binding of a registered interface
    pub fn bind(&mut self, name: &str, executor: Arc<dyn StepExecutor>) -> GraphResult<()> {
        let entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownInterface(name.to_string()))?;
        entry.executor = Some(executor);
        Ok(())
    }

    /// Look up an interface contract by name
    pub fn resolve(&self, name: &str) -> GraphResult<Arc<Interface>> {
        self.entries
            .get(name)
            .map(|e| e.interface.clone())
            .ok_or_else(|| GraphError::UnknownInterface(name.to_string()))
    }

    /// Get the step binding for an interface
    pub fn executor(&self, name: &str) -> Option<Arc<dyn StepExecutor>> {
        self.entries.get(name).and_then(|e| e.executor.clone())
    }

    /// Check if an interface is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered interface names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move every entry of `other` into this registry
    ///
    /// Fails without modifying `self` if any name is already registered.
    pub fn merge(&mut self, other: InterfaceRegistry) -> GraphResult<()> {
        if let Some(dup) = other.entries.keys().find(|name| self.entries.contains_key(*name)) {
            return Err(GraphError::DuplicateInterface(dup.clone()));
        }
        self.entries.extend(other.entries);
        Ok(())
    }
}

impl Default for InterfaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
