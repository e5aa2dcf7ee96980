//! Output propagation
//!
//! After a node completes, each of its outputs is pushed once along every
//! outgoing edge bound to that output's handle, as a
//! [`WorkflowEvent::NodeContentChanged`]. The scheduler itself reads the
//! output table; these events are for live listeners.

use crate::events::{EventSink, WorkflowEvent};
use crate::types::{GraphEdge, NodeOutputs, DEFAULT_HANDLE};

/// Pushes completed outputs to the listeners of outgoing edges
pub struct OutputDispatcher<'a> {
    edges: &'a [GraphEdge],
    sink: &'a dyn EventSink,
}

impl<'a> OutputDispatcher<'a> {
    pub fn new(edges: &'a [GraphEdge], sink: &'a dyn EventSink) -> Self {
        Self { edges, sink }
    }

    /// Publish `outputs` of `node_id`; returns the number of events sent
    ///
    /// A `default` output also feeds edges whose source handle the node did
    /// not produce, matching how inputs are resolved.
    pub fn dispatch(&self, node_id: &str, outputs: &NodeOutputs) -> usize {
        let mut handles: Vec<&String> = outputs.keys().collect();
        handles.sort();

        let mut sent = 0;
        for handle in handles {
            let value = &outputs[handle];
            let bound = self.edges.iter().filter(|edge| {
                edge.source == node_id
                    && (edge.source_handle() == handle.as_str()
                        || (handle == DEFAULT_HANDLE && !outputs.contains_key(edge.source_handle())))
            });

            for edge in bound {
                let event = WorkflowEvent::NodeContentChanged {
                    source_id: node_id.to_string(),
                    target_id: edge.target.clone(),
                    source_handle: handle.clone(),
                    target_handle: edge.target_handle().to_string(),
                    content: value.clone(),
                };
                match self.sink.send(event) {
                    Ok(()) => sent += 1,
                    Err(e) => log::debug!("Dropped content update {} -> {}: {}", node_id, edge.target, e),
                }
            }
        }
        sent
    }
}
