//! Run events
//!
//! The runner reports node lifecycle, progress and live values pushed along
//! outgoing edges to whoever holds the sink.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{NodeId, PortValue};

/// Receiver of run events
///
/// Delivery failures are logged by the runner and never abort a run.
pub trait EventSink: Send + Sync {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError>;
}

/// An event could not be delivered
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("Event receiver dropped")]
    ChannelClosed,
}

impl EventError {
    pub fn channel_closed() -> Self {
        Self::ChannelClosed
    }
}

/// Why a node was not dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    /// The node already had outputs (seeded for resume)
    Cached,
    /// The caller asked for the node to be skipped
    Skipped,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Skipped => "skipped",
        }
    }
}

/// Everything a run reports while it executes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// Run started
    #[serde(rename_all = "camelCase")]
    RunStarted { run_id: String, node_count: usize },

    /// A node was handed to its handler
    #[serde(rename_all = "camelCase")]
    NodeStarted { node_id: NodeId, node_type: String },

    /// A node produced its outputs
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node_id: NodeId,
        outputs: crate::types::NodeOutputs,
    },

    /// A node failed
    #[serde(rename_all = "camelCase")]
    NodeError { node_id: NodeId, error: String },

    /// A node was not dispatched
    #[serde(rename_all = "camelCase")]
    NodeSkipped { node_id: NodeId, reason: SkipReason },

    /// Completed-node counter advanced
    #[serde(rename_all = "camelCase")]
    Progress { completed: usize, total: usize },

    /// Status of a polled prediction
    #[serde(rename_all = "camelCase")]
    PredictionProgress {
        node_id: NodeId,
        prediction_id: String,
        attempt: u32,
        status: String,
    },

    /// A produced value was pushed along one outgoing edge
    #[serde(rename_all = "camelCase")]
    NodeContentChanged {
        source_id: NodeId,
        target_id: NodeId,
        source_handle: String,
        target_handle: String,
        content: PortValue,
    },

    /// Run finished (successfully or not)
    #[serde(rename_all = "camelCase")]
    RunFinished {
        run_id: String,
        success: bool,
        error: Option<String>,
    },
}

impl WorkflowEvent {
    /// Create a node started event
    pub fn node_started(node_id: &str, node_type: &str) -> Self {
        Self::NodeStarted {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
        }
    }

    /// Create a node error event
    pub fn node_error(node_id: &str, error: impl Into<String>) -> Self {
        Self::NodeError {
            node_id: node_id.to_string(),
            error: error.into(),
        }
    }

    /// Create a node skipped event
    pub fn node_skipped(node_id: &str, reason: SkipReason) -> Self {
        Self::NodeSkipped {
            node_id: node_id.to_string(),
            reason,
        }
    }
}

/// Discards every event
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: WorkflowEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// Keeps events in memory, in emission order
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<WorkflowEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything received so far
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

/// Event sink backed by an unbounded tokio channel
///
/// The receiving half can live anywhere (a UI bridge, a logger task);
/// sends never block the scheduler.
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiver that drains it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: WorkflowEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}
