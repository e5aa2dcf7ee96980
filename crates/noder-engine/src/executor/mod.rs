//! Node executor dispatch
//!
//! Every node variant is served by a [`NodeHandler`] registered under its
//! [`NodeType`]. Types without a registered handler fall through to the
//! passthrough handler, so an unknown node never fails a run.
//!
//! # Usage
//!
//! ```ignore
//! let context = ExecutionContext::new(predictions, EngineConfig::default())
//!     .with_chat(chat_client)
//!     .with_files(file_manager);
//! let executor = NodeExecutor::new(context, HandlerRegistry::with_defaults());
//! let outputs = executor.execute(&task).await?;
//! ```

mod assets;
mod generation;
mod passthrough;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::EventSink;
use crate::files::FileLifecycleManager;
use crate::inputs::NodeInputs;
use crate::remote::{ChatClient, MediaSink, PredictionClient};
use crate::router::{OwnerTableRouter, ProviderRouter};
use crate::schema_cache::SchemaCache;
use crate::types::{DataKind, GraphNode, NodeOutputs, NodeType, OutputTable};

pub use assets::{ChipHandler, MediaHandler, SaveHandler};
pub use generation::{extract_output, GenerationHandler, TextHandler};
pub use passthrough::PassthroughHandler;

/// Everything a handler needs to know about the node it runs
pub struct NodeTask<'a> {
    pub node: &'a GraphNode,
    /// Values arriving at each input handle
    pub inputs: NodeInputs,
    /// Every node of the run, for chip lookup
    pub nodes: &'a [GraphNode],
    /// Outputs produced so far, for chip lookup
    pub outputs: &'a OutputTable,
    pub events: &'a dyn EventSink,
    pub cancel: &'a CancellationToken,
}

/// Shared collaborators of all handlers
pub struct ExecutionContext {
    pub predictions: Arc<dyn PredictionClient>,
    pub chat: Option<Arc<dyn ChatClient>>,
    pub files: Option<Arc<FileLifecycleManager>>,
    pub media_sink: Option<Arc<dyn MediaSink>>,
    pub schemas: SchemaCache,
    pub router: Arc<dyn ProviderRouter>,
    pub config: EngineConfig,
}

impl ExecutionContext {
    /// Context with a fresh schema cache and the default router
    pub fn new(predictions: Arc<dyn PredictionClient>, config: EngineConfig) -> Self {
        Self {
            predictions,
            chat: None,
            files: None,
            media_sink: None,
            schemas: SchemaCache::with_config(&config.schema_cache),
            router: Arc::new(OwnerTableRouter::default()),
            config,
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatClient>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_files(mut self, files: Arc<FileLifecycleManager>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.media_sink = Some(sink);
        self
    }

    pub fn with_schema_cache(mut self, schemas: SchemaCache) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn ProviderRouter>) -> Self {
        self.router = router;
        self
    }
}

/// Executes one node variant
#[async_trait]
pub trait NodeHandler: Send + Sync {
    async fn execute(&self, task: &NodeTask<'_>, ctx: &ExecutionContext) -> Result<NodeOutputs>;
}

/// Handler table keyed by node variant
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
    fallback: Arc<dyn NodeHandler>,
}

impl HandlerRegistry {
    /// Registry with no handlers; everything passes through
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(PassthroughHandler),
        }
    }

    /// Registry with the built-in handler of every known variant
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(NodeType::Text, Arc::new(TextHandler));
        registry.register(NodeType::Image, Arc::new(GenerationHandler::new(DataKind::Image)));
        registry.register(NodeType::Video, Arc::new(GenerationHandler::new(DataKind::Video)));
        registry.register(NodeType::Audio, Arc::new(GenerationHandler::new(DataKind::Audio)));
        registry.register(NodeType::Upscaler, Arc::new(GenerationHandler::upscaler()));
        registry.register(NodeType::Media, Arc::new(MediaHandler));
        registry.register(NodeType::Chip, Arc::new(ChipHandler));
        registry.register(NodeType::SaveMedia, Arc::new(SaveHandler));
        registry.register(NodeType::Display, Arc::new(PassthroughHandler));
        registry.register(NodeType::Group, Arc::new(PassthroughHandler));
        registry
    }

    /// Register or replace the handler of a variant
    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type, handler);
    }

    /// Handler for a variant, or the passthrough fallback
    pub fn handler_for(&self, node_type: &NodeType) -> Arc<dyn NodeHandler> {
        match self.handlers.get(node_type) {
            Some(handler) => handler.clone(),
            None => {
                log::debug!("No handler for node type '{}', passing through", node_type);
                self.fallback.clone()
            }
        }
    }

    pub fn has_handler(&self, node_type: &NodeType) -> bool {
        self.handlers.contains_key(node_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Dispatches nodes to their handlers
pub struct NodeExecutor {
    context: ExecutionContext,
    registry: HandlerRegistry,
}

impl NodeExecutor {
    pub fn new(context: ExecutionContext, registry: HandlerRegistry) -> Self {
        Self { context, registry }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run the handler registered for the task's node type
    pub async fn execute(&self, task: &NodeTask<'_>) -> Result<NodeOutputs> {
        log::debug!(
            "Dispatching node {} ({})",
            task.node.id,
            task.node.node_type
        );
        let handler = self.registry.handler_for(&task.node.node_type);
        handler.execute(task, &self.context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullEventSink, VecEventSink, WorkflowEvent};
    use crate::inputs::HandleInput;
    use crate::testing::{FakeChatClient, FakeFileClient, FakeMediaSink, FakePredictionClient};
    use crate::types::{PortValue, OUTPUT_HANDLE};
    use serde_json::{json, Value};

    fn fast_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.poll.interval_ms = 1;
        config
    }

    fn executor_with(predictions: FakePredictionClient) -> (Arc<FakePredictionClient>, NodeExecutor) {
        let predictions = Arc::new(predictions);
        let context = ExecutionContext::new(predictions.clone(), fast_config());
        (predictions, NodeExecutor::new(context, HandlerRegistry::with_defaults()))
    }

    async fn run(executor: &NodeExecutor, node: &GraphNode, inputs: NodeInputs) -> Result<NodeOutputs> {
        let cancel = CancellationToken::new();
        let outputs = OutputTable::new();
        let nodes = vec![node.clone()];
        let task = NodeTask {
            node,
            inputs,
            nodes: &nodes,
            outputs: &outputs,
            events: &NullEventSink,
            cancel: &cancel,
        };
        executor.execute(&task).await
    }

    fn painter_schema() -> Value {
        json!({"components": {"schemas": {
            "Input": {
                "required": ["prompt"],
                "properties": {
                    "prompt": {"type": "string", "x-order": 0},
                    "image": {"type": "string", "format": "uri", "x-order": 1},
                    "num_outputs": {"type": "integer", "default": 1, "x-order": 2}
                }
            },
            "Output": {"type": "array", "items": {"type": "string", "format": "uri"}}
        }}})
    }

    #[tokio::test]
    async fn test_unknown_type_passes_through() {
        let (predictions, executor) = executor_with(FakePredictionClient::new());
        let node = GraphNode::new("n", "sticky-note", json!({}));
        let outputs = run(&executor, &node, NodeInputs::new()).await.unwrap();
        assert!(outputs.contains_key(OUTPUT_HANDLE));
        assert!(predictions.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_image_node_uses_schema_and_first_array_output() {
        let (predictions, executor) = executor_with(
            FakePredictionClient::new()
                .with_schema("acme/painter", painter_schema())
                .with_output("acme/painter", json!(["https://out.test/1.png", "https://out.test/2.png"])),
        );
        let node = GraphNode::new(
            "img",
            "image",
            json!({"model": "acme/painter", "prompt": "a fox", "numOutputs": 2}),
        );

        let outputs = run(&executor, &node, NodeInputs::new()).await.unwrap();
        let out = &outputs[OUTPUT_HANDLE];
        assert_eq!(out.kind, DataKind::Image);
        assert_eq!(out.as_str(), Some("https://out.test/1.png"));
        assert_eq!(out.metadata.as_ref().unwrap()["model"], "acme/painter");

        let (model, input) = &predictions.submissions()[0];
        assert_eq!(model, "acme/painter");
        assert_eq!(input, &json!({"prompt": "a fox", "num_outputs": 2}));
    }

    #[tokio::test]
    async fn test_schema_failure_degrades_to_fallback() {
        let (predictions, executor) = executor_with(FakePredictionClient::new());
        let node = GraphNode::new(
            "vid",
            "video",
            json!({"model": "acme/motion", "prompt": "waves", "fps": 24}),
        );
        let mut inputs = NodeInputs::new();
        inputs.insert(
            "image".into(),
            HandleInput::Single(PortValue::new(DataKind::Image, "https://in.test/a.png")),
        );

        let outputs = run(&executor, &node, inputs).await.unwrap();
        assert_eq!(outputs[OUTPUT_HANDLE].kind, DataKind::Video);
        assert_eq!(
            predictions.submissions()[0].1,
            json!({"prompt": "waves", "image": "https://in.test/a.png", "fps": 24})
        );
    }

    #[tokio::test]
    async fn test_validation_error_is_not_a_fallback() {
        let (predictions, executor) = executor_with(
            FakePredictionClient::new().with_schema("acme/painter", painter_schema()),
        );
        let node = GraphNode::new("img", "image", json!({"model": "acme/painter", "prompt": "x"}));
        let mut inputs = NodeInputs::new();
        inputs.insert(
            "audio".into(),
            HandleInput::Single(PortValue::new(DataKind::Audio, "https://in.test/a.mp3")),
        );

        let err = run(&executor, &node, inputs).await.unwrap_err();
        assert!(matches!(err, crate::error::NodeEngineError::Validation(_)));
        assert!(predictions.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_text_node_without_prompt_fails() {
        let (_, executor) = executor_with(FakePredictionClient::new());
        let node = GraphNode::new("t", "text", json!({"model": "meta/llama", "prompt": ""}));
        let err = run(&executor, &node, NodeInputs::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "No prompt provided");
    }

    #[tokio::test]
    async fn test_text_node_routes_to_chat() {
        let predictions = Arc::new(FakePredictionClient::new());
        let chat = Arc::new(FakeChatClient::replying("Once upon a time"));
        let context = ExecutionContext::new(predictions.clone(), fast_config()).with_chat(chat.clone());
        let executor = NodeExecutor::new(context, HandlerRegistry::with_defaults());

        let node = GraphNode::new(
            "t",
            "text",
            json!({"model": "openai/gpt-4o-mini", "prompt": "Tell a story", "temperature": 0.2}),
        );
        let outputs = run(&executor, &node, NodeInputs::new()).await.unwrap();
        assert_eq!(outputs[OUTPUT_HANDLE].as_str(), Some("Once upon a time"));

        let request = &chat.requests()[0];
        assert_eq!(request.provider, "openai");
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.messages.last().unwrap().content, "Tell a story");
        assert_eq!(request.temperature, Some(0.2));
        assert!(predictions.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_text_prediction_joins_token_stream() {
        let (_, executor) = executor_with(
            FakePredictionClient::new().with_output("meta/llama", json!(["Hel", "lo", "!"])),
        );
        let node = GraphNode::new("t", "text", json!({"model": "meta/llama", "prompt": "hi"}));
        let outputs = run(&executor, &node, NodeInputs::new()).await.unwrap();
        assert_eq!(outputs[OUTPUT_HANDLE].as_str(), Some("Hello!"));
    }

    #[tokio::test]
    async fn test_missing_model_uses_configured_default() {
        let predictions = Arc::new(FakePredictionClient::new());
        let mut config = fast_config();
        config.default_models.image = Some("acme/default".into());
        let executor = NodeExecutor::new(
            ExecutionContext::new(predictions.clone(), config),
            HandlerRegistry::with_defaults(),
        );
        let node = GraphNode::new("img", "image", json!({"prompt": "x"}));
        run(&executor, &node, NodeInputs::new()).await.unwrap();
        assert_eq!(predictions.submissions()[0].0, "acme/default");

        let (_, bare) = executor_with(FakePredictionClient::new());
        let err = run(&bare, &node, NodeInputs::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "No model specified");
    }

    #[tokio::test]
    async fn test_prediction_progress_events() {
        use crate::remote::PredictionStatus;

        let mut statuses = vec![PredictionStatus::Processing; 10];
        statuses.push(PredictionStatus::Succeeded);
        let (_, executor) =
            executor_with(FakePredictionClient::new().with_status_sequence("acme/slow", statuses));
        let node = GraphNode::new("img", "image", json!({"model": "acme/slow", "prompt": "x"}));
        let sink = VecEventSink::new();
        let cancel = CancellationToken::new();
        let outputs = OutputTable::new();
        let nodes = vec![node.clone()];
        let task = NodeTask {
            node: &node,
            inputs: NodeInputs::new(),
            nodes: &nodes,
            outputs: &outputs,
            events: &sink,
            cancel: &cancel,
        };

        // Succeeded without output is a failure, but progress is still reported
        assert!(executor.execute(&task).await.is_err());
        let progress = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, WorkflowEvent::PredictionProgress { .. }))
            .count();
        assert_eq!(progress, 1);
    }

    #[tokio::test]
    async fn test_media_node_uploads_local_file() {
        let predictions = Arc::new(FakePredictionClient::new());
        let file_client = Arc::new(FakeFileClient::new());
        let files = Arc::new(FileLifecycleManager::new(file_client.clone()));
        let executor = NodeExecutor::new(
            ExecutionContext::new(predictions, fast_config()).with_files(files.clone()),
            HandlerRegistry::with_defaults(),
        );

        let node = GraphNode::new(
            "m",
            "media",
            json!({"mediaPath": "/tmp/photo.jpg", "mediaType": "image"}),
        );
        let outputs = run(&executor, &node, NodeInputs::new()).await.unwrap();
        assert_eq!(outputs[OUTPUT_HANDLE].as_str(), Some("https://files.fake.test/file-1"));
        assert_eq!(file_client.uploads().len(), 1);
        assert_eq!(files.get("m").unwrap().file_path, "/tmp/photo.jpg");
    }

    #[tokio::test]
    async fn test_save_node_persists_first_value() {
        let sink = Arc::new(FakeMediaSink::new());
        let executor = NodeExecutor::new(
            ExecutionContext::new(Arc::new(FakePredictionClient::new()), fast_config())
                .with_media_sink(sink.clone()),
            HandlerRegistry::with_defaults(),
        );
        let node = GraphNode::new("s", "save-media", json!({"saveLocation": "/tmp/out"}));
        let mut inputs = NodeInputs::new();
        inputs.insert(
            "in".into(),
            HandleInput::Many(vec![
                PortValue::new(DataKind::Image, ""),
                PortValue::new(DataKind::Image, "https://out.test/1.png"),
            ]),
        );

        let outputs = run(&executor, &node, inputs).await.unwrap();
        assert_eq!(sink.saved(), vec!["https://out.test/1.png"]);
        assert_eq!(outputs[OUTPUT_HANDLE].as_str(), Some("/tmp/out/output.png"));

        let err = run(&executor, &node, NodeInputs::new()).await.unwrap_err();
        assert!(err.to_string().contains("No media to save"));
    }
}
