//! Built-in registration for host applications.
//!
//! Hosts call [`register_builtins`] on a fresh registry before adding their
//! own interfaces, so configuration documents can refer to the utility steps
//! by name.

use std::sync::Arc;

use node_engine::{GraphResult, InterfaceRegistry, SyncCallbackStep};

use crate::control::{Identity, MergeMetrics};

/// Register `identity` and `merge-metrics` with their bindings
pub fn register_builtins(registry: &mut InterfaceRegistry) -> GraphResult<()> {
    registry.register_with_executor(
        Identity::interface(),
        Arc::new(SyncCallbackStep::new(Identity::run)),
    )?;
    registry.register_with_executor(
        MergeMetrics::interface(),
        Arc::new(SyncCallbackStep::new(MergeMetrics::run)),
    )?;
    log::debug!("Registered built-in interfaces");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_engine::{freeze, Bindings, MemoryCache, NodeState, Scheduler, WorkflowBuilder};
    use serde_json::json;

    #[test]
    fn test_register_builtins_twice_fails() {
        let mut registry = InterfaceRegistry::new();
        register_builtins(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["identity", "merge-metrics"]);
        assert!(register_builtins(&mut registry).is_err());
    }

    #[tokio::test]
    async fn test_builtins_run_in_a_graph() {
        let mut registry = InterfaceRegistry::new();
        register_builtins(&mut registry).unwrap();

        let graph = WorkflowBuilder::new(&registry, "qc", "QC metrics")
            .node("anat", "identity", Bindings::new().value("value", json!({"cjv": 0.4})))
            .node("func", "identity", Bindings::new().value("value", json!({"fd_mean": 0.1})))
            .node("merge", "merge-metrics", Bindings::new().deferred("in1").deferred("in2"))
            .connect("anat", "value", "merge", "in1")
            .connect("func", "value", "merge", "in2")
            .build()
            .unwrap();
        let plan = freeze(&graph).unwrap();

        let report = Scheduler::new(Arc::new(registry), Arc::new(MemoryCache::new()))
            .run(&plan, 2)
            .await;

        assert_eq!(report.state("merge"), Some(NodeState::Succeeded));
        assert_eq!(
            report.output("merge", "metrics"),
            Some(&json!({"cjv": 0.4, "fd_mean": 0.1}))
        );
    }
}
