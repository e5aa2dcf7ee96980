//! Input aggregation
//!
//! Gathers the resolved outputs of a node's upstream producers, grouped by
//! the target handle they are wired into.

use std::collections::HashMap;

use crate::types::{GraphEdge, HandleId, OutputTable, PortValue, DEFAULT_HANDLE};

/// Values arriving at one target handle
#[derive(Debug, Clone, PartialEq)]
pub enum HandleInput {
    /// Exactly one edge contributed a value
    Single(PortValue),
    /// Two or more edges contributed, in edge order
    Many(Vec<PortValue>),
}

impl HandleInput {
    /// All contributed values, in edge order
    pub fn values(&self) -> Vec<&PortValue> {
        match self {
            Self::Single(value) => vec![value],
            Self::Many(values) => values.iter().collect(),
        }
    }

    /// Number of contributed values
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value as JSON: a single value, or an array of values
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Single(value) => value.value.clone(),
            Self::Many(values) => {
                serde_json::Value::Array(values.iter().map(|v| v.value.clone()).collect())
            }
        }
    }
}

/// Inputs of one node keyed by target handle
pub type NodeInputs = HashMap<HandleId, HandleInput>;

/// Look up the value an edge carries, if its producer emitted one
///
/// The producer's output at the edge's source handle wins; a producer that
/// only emitted a `default` output still feeds the edge.
pub fn resolve_edge_value<'a>(edge: &GraphEdge, outputs: &'a OutputTable) -> Option<&'a PortValue> {
    let producer = outputs.get(&edge.source)?;
    producer
        .get(edge.source_handle())
        .or_else(|| producer.get(DEFAULT_HANDLE))
}

/// Aggregate the inputs of `node_id` from the edges targeting it
///
/// Edges whose producer has no output contribute nothing. A handle fed by one
/// edge yields [`HandleInput::Single`]; fed by several, [`HandleInput::Many`]
/// in the order the edges appear in `edges`.
pub fn aggregate_inputs(node_id: &str, edges: &[GraphEdge], outputs: &OutputTable) -> NodeInputs {
    let mut collected: Vec<(HandleId, Vec<PortValue>)> = Vec::new();

    for edge in edges.iter().filter(|e| e.target == node_id) {
        let Some(value) = resolve_edge_value(edge, outputs) else {
            log::debug!(
                "Edge {} -> {} carries no value yet",
                edge.source,
                edge.target
            );
            continue;
        };

        let handle = edge.target_handle();
        match collected.iter_mut().find(|(h, _)| h == handle) {
            Some((_, values)) => values.push(value.clone()),
            None => collected.push((handle.to_string(), vec![value.clone()])),
        }
    }

    collected
        .into_iter()
        .map(|(handle, mut values)| {
            let input = if values.len() == 1 {
                HandleInput::Single(values.remove(0))
            } else {
                HandleInput::Many(values)
            };
            (handle, input)
        })
        .collect()
}
