//! Passthrough handler for display, group and unknown nodes

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{ExecutionContext, NodeHandler, NodeTask};
use crate::error::Result;
use crate::types::{DataKind, HandleId, NodeOutputs, PortValue, OUTPUT_HANDLE};

/// Forwards the first connected value and marks it as passed through
///
/// Nodes with nothing connected emit an empty marker, which downstream
/// consumers treat as no value.
pub struct PassthroughHandler;

#[async_trait]
impl NodeHandler for PassthroughHandler {
    async fn execute(&self, task: &NodeTask<'_>, _ctx: &ExecutionContext) -> Result<NodeOutputs> {
        let mut handles: Vec<&HandleId> = task.inputs.keys().collect();
        handles.sort();

        let forwarded = handles
            .into_iter()
            .flat_map(|h| task.inputs[h].values())
            .find(|v| !v.is_chip)
            .cloned();

        let mut marker = Map::new();
        marker.insert("passthrough".to_string(), Value::Bool(true));
        let value = match forwarded {
            Some(value) => value,
            None => PortValue::new(DataKind::Any, Value::Null),
        };

        let mut outputs = NodeOutputs::new();
        outputs.insert(OUTPUT_HANDLE.to_string(), value.with_metadata(marker));
        Ok(outputs)
    }
}
