//! Generation handlers (text, image, video, audio, upscaler)

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{ExecutionContext, NodeHandler, NodeTask};
use crate::chips::{collect_chip_values, ChipResolver};
use crate::error::{NodeEngineError, Result};
use crate::events::WorkflowEvent;
use crate::poller::poll_prediction;
use crate::remote::{with_cancel, ChatMessage, ChatRequest, PredictionStatus};
use crate::request::{
    build_fallback_request, build_request, combine_prompt, ConnectedInputs, PromptFields,
    NO_PROMPT,
};
use crate::router::Route;
use crate::types::{DataKind, GraphNode, NodeOutputs, PortValue, OUTPUT_HANDLE};

/// Pull the usable value out of a prediction's raw output
///
/// Strings are returned as is and arrays yield their first element. Text
/// models stream tokens as an array of strings; for text those are joined.
pub fn extract_output(raw: &Value, kind: DataKind) -> Option<Value> {
    match raw {
        Value::Null => None,
        Value::Array(items) if kind == DataKind::Text && items.iter().all(Value::is_string) => {
            let joined: String = items.iter().filter_map(Value::as_str).collect();
            (!joined.is_empty()).then_some(Value::String(joined))
        }
        Value::Array(items) => items.first().filter(|v| !v.is_null()).cloned(),
        other => Some(other.clone()),
    }
}

/// Model id of the node, falling back to the configured default
fn resolve_model(node: &GraphNode, ctx: &ExecutionContext) -> Result<String> {
    node.data_str("model")
        .or_else(|| ctx.config.default_models.for_node(&node.node_type))
        .map(|m| m.trim().to_string())
        .ok_or_else(|| NodeEngineError::MissingInput("No model specified".to_string()))
}

/// Connected inputs and prompt fields with chip placeholders substituted
fn prepare_inputs(task: &NodeTask<'_>) -> (ConnectedInputs, PromptFields) {
    let chip_values = collect_chip_values(task.node, task.nodes, &task.inputs, task.outputs);
    let chips = ChipResolver::new(chip_values);
    let mut connected = ConnectedInputs::from_inputs(&task.inputs);
    connected.resolve_chips(&chips);
    let prompts = PromptFields::from_node(task.node, &chips);
    (connected, prompts)
}

fn output_metadata(model: &str, prediction_id: Option<&str>) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("model".to_string(), Value::String(model.to_string()));
    if let Some(id) = prediction_id {
        metadata.insert("predictionId".to_string(), Value::String(id.to_string()));
    }
    metadata
}

/// Build, submit and poll a prediction, returning the node's single output
async fn run_prediction(
    task: &NodeTask<'_>,
    ctx: &ExecutionContext,
    model: &str,
    kind: DataKind,
    connected: &ConnectedInputs,
    prompts: &PromptFields,
) -> Result<NodeOutputs> {
    let node = task.node;

    let request = match ctx
        .schemas
        .get_or_fetch(model, ctx.predictions.as_ref(), task.cancel)
        .await
    {
        Ok(schema) => build_request(&schema, node, connected, prompts)?,
        Err(NodeEngineError::Cancelled) => return Err(NodeEngineError::Cancelled),
        Err(e) => {
            log::warn!(
                "Schema for {} unavailable ({}), building minimal request for node {}",
                model,
                e,
                node.id
            );
            build_fallback_request(node, connected, prompts)?
        }
    };

    log::debug!("Submitting {} for node {}", model, node.id);
    let prediction = with_cancel(
        task.cancel,
        ctx.predictions.create_prediction(model, Value::Object(request)),
    )
    .await?;
    log::info!("Node {} submitted prediction {}", node.id, prediction.id);

    let raw = if prediction.status == PredictionStatus::Succeeded && prediction.output.is_some() {
        prediction.output.clone().unwrap_or(Value::Null)
    } else {
        poll_prediction(
            ctx.predictions.as_ref(),
            &prediction.id,
            &ctx.config.poll,
            task.cancel,
            |attempt, latest| {
                let event = WorkflowEvent::PredictionProgress {
                    node_id: node.id.clone(),
                    prediction_id: latest.id.clone(),
                    attempt,
                    status: latest.status.as_str().to_string(),
                };
                if let Err(e) = task.events.send(event) {
                    log::debug!("Progress event for node {} dropped: {}", node.id, e);
                }
            },
        )
        .await?
    };

    let value = extract_output(&raw, kind).ok_or_else(|| {
        NodeEngineError::failed(format!("Model {} returned no output", model))
    })?;

    let mut outputs = NodeOutputs::new();
    outputs.insert(
        OUTPUT_HANDLE.to_string(),
        PortValue::new(kind, value).with_metadata(output_metadata(model, Some(&prediction.id))),
    );
    Ok(outputs)
}

/// Image, video, audio and upscaler nodes
pub struct GenerationHandler {
    kind: DataKind,
    /// Output kind follows the connected media (video in, video out)
    follows_input: bool,
}

impl GenerationHandler {
    pub fn new(kind: DataKind) -> Self {
        Self {
            kind,
            follows_input: false,
        }
    }

    /// Upscalers emit the kind of media they were given
    pub fn upscaler() -> Self {
        Self {
            kind: DataKind::Image,
            follows_input: true,
        }
    }

    fn output_kind(&self, connected: &ConnectedInputs) -> DataKind {
        if self.follows_input && connected.first(DataKind::Video).is_some() {
            DataKind::Video
        } else {
            self.kind
        }
    }
}

#[async_trait]
impl NodeHandler for GenerationHandler {
    async fn execute(&self, task: &NodeTask<'_>, ctx: &ExecutionContext) -> Result<NodeOutputs> {
        let model = resolve_model(task.node, ctx)?;
        let (connected, prompts) = prepare_inputs(task);
        let kind = self.output_kind(&connected);
        run_prediction(task, ctx, &model, kind, &connected, &prompts).await
    }
}

/// Text nodes: chat completion or prediction, per the provider router
pub struct TextHandler;

#[async_trait]
impl NodeHandler for TextHandler {
    async fn execute(&self, task: &NodeTask<'_>, ctx: &ExecutionContext) -> Result<NodeOutputs> {
        let (connected, prompts) = prepare_inputs(task);
        let prompt = combine_prompt(&connected.texts(), prompts.prompt.as_deref());
        if prompt.is_empty() {
            return Err(NodeEngineError::MissingInput(NO_PROMPT.to_string()));
        }
        let model = resolve_model(task.node, ctx)?;

        let (provider, chat_model) = match ctx.router.route(&model) {
            Route::Chat { provider, model } => (provider, model),
            Route::Prediction => {
                return run_prediction(task, ctx, &model, DataKind::Text, &connected, &prompts)
                    .await;
            }
        };

        let chat = ctx.chat.as_ref().ok_or_else(|| {
            NodeEngineError::failed(format!("No chat client configured for provider '{}'", provider))
        })?;

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &prompts.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(prompt));

        let request = ChatRequest {
            provider,
            model: chat_model,
            messages,
            temperature: task
                .node
                .data_value("temperature")
                .and_then(Value::as_f64)
                .map(|t| t as f32),
        };

        log::debug!("Chat completion for node {} via {}", task.node.id, request.provider);
        let reply = with_cancel(task.cancel, chat.chat_completion(request)).await?;

        let mut outputs = NodeOutputs::new();
        outputs.insert(
            OUTPUT_HANDLE.to_string(),
            PortValue::text(reply).with_metadata(output_metadata(&model, None)),
        );
        Ok(outputs)
    }
}
