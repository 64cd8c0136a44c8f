//! Event types for streaming run progress
//!
//! Events are sent from the scheduler to any consumer (a CLI progress
//! printer, a log forwarder, a test) to report node lifecycle changes.

use serde::{Deserialize, Serialize};

/// Destination for scheduler events
///
/// Sinks must not block; a failed send is logged by the scheduler and never
/// affects the run.
pub trait EventSink: Send + Sync {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to deliver event: {message}")]
pub struct EventError {
    pub message: String,
}

impl EventError {
    /// The receiving end has gone away
    pub fn channel_closed() -> Self {
        Self {
            message: "receiver dropped".to_string(),
        }
    }
}

/// Events emitted while a plan runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The run started
    RunStarted {
        graph_id: String,
        execution_id: String,
        node_count: usize,
    },

    /// A node was dispatched to a worker
    NodeStarted {
        node_id: String,
        execution_id: String,
    },

    /// A node's outputs were served from the cache
    NodeCacheHit {
        node_id: String,
        execution_id: String,
        cache_key: String,
    },

    /// A node finished successfully
    NodeSucceeded {
        node_id: String,
        execution_id: String,
        cached: bool,
    },

    /// A node failed
    NodeFailed {
        node_id: String,
        execution_id: String,
        error: String,
    },

    /// A node will not run because an upstream node failed or the run was
    /// cancelled
    NodeSkipped {
        node_id: String,
        execution_id: String,
        cause: Option<String>,
    },

    /// The run reached a terminal status
    RunCompleted {
        graph_id: String,
        execution_id: String,
        status: String,
    },

    /// Cancellation was requested
    RunCancelled { execution_id: String },
}

impl WorkflowEvent {
    /// Id of the node the event is about, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::NodeStarted { node_id, .. }
            | WorkflowEvent::NodeCacheHit { node_id, .. }
            | WorkflowEvent::NodeSucceeded { node_id, .. }
            | WorkflowEvent::NodeFailed { node_id, .. }
            | WorkflowEvent::NodeSkipped { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Drops every event
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Buffers events in memory, in emission order
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the buffered events
    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards events into a tokio channel
pub struct ChannelEventSink {
    tx: tokio::sync::mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.tx.send(event).map_err(|_| EventError::channel_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffering_sink_records_and_clears() {
        let buffer = VecEventSink::new();

        buffer.send(WorkflowEvent::NodeSucceeded {
            node_id: "bet-1".to_string(),
            execution_id: "exec1".to_string(),
            cached: true,
        })
        .unwrap();

        let recorded = buffer.events();
        assert_eq!(recorded[0].node_id(), Some("bet-1"));
        assert!(matches!(recorded.as_slice(), [WorkflowEvent::NodeSucceeded { cached: true, .. }]));

        buffer.clear();
        assert!(buffer.events().is_empty());
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        NullEventSink.send(WorkflowEvent::RunCancelled {
            execution_id: "exec1".to_string(),
        })
        .unwrap();
    }

    #[test]
    fn test_channel_sink_reports_closed() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelEventSink::new(tx);
        drop(rx);
        let err = sink
            .send(WorkflowEvent::RunCancelled {
                execution_id: "exec1".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to deliver event: receiver dropped");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = WorkflowEvent::NodeFailed {
            node_id: "reg".to_string(),
            execution_id: "exec1".to_string(),
            error: "exit 1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["node_id"], "reg");
    }
}
