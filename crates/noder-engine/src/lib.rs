//! Noder Engine - Layered workflow execution for generation graphs
//!
//! This crate turns a node/edge graph built in the editor into an ordered,
//! partially parallel, resumable execution. It supports:
//!
//! - Topological layering with cycle detection
//! - Concurrent execution of independent nodes within a layer
//! - Schema-driven provider requests with a minimal fallback
//! - `__CHIP__` placeholder substitution
//! - Resume from cached outputs and explicit skip lists
//! - Cancellation threaded through every remote call
//! - Best-effort lifecycle management of uploaded files
//!
//! # Architecture
//!
//! - `WorkflowRunner`: the run loop (layers, skips, errors, cleanup)
//! - `NodeExecutor`: per-variant handlers looked up in a `HandlerRegistry`
//! - `SchemaCache`: injectable, bounded cache of normalized model schemas
//! - `EventSink`: lifecycle events and live output propagation
//! - `PredictionClient`, `ChatClient`, `FileClient`, `MediaSink`: the remote
//!   collaborators, implemented elsewhere
//!
//! # Example
//!
//! ```ignore
//! use noder_engine::{ExecutionContext, HandlerRegistry, NodeExecutor, WorkflowRunner};
//!
//! let context = ExecutionContext::new(predictions, EngineConfig::default());
//! let runner = WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));
//! let result = runner.run(&nodes, &edges, RunOptions::default(), &NullEventSink).await?;
//! ```

pub mod chips;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod files;
pub mod graph;
pub mod inputs;
pub mod poller;
pub mod remote;
pub mod request;
pub mod router;
pub mod runner;
pub mod schema;
pub mod schema_cache;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

// Re-export key types
pub use config::{DefaultModels, EngineConfig, PollConfig, SchemaCacheConfig};
pub use error::{NodeEngineError, Result};
pub use events::{ChannelEventSink, EventSink, NullEventSink, SkipReason, VecEventSink, WorkflowEvent};
pub use executor::{ExecutionContext, HandlerRegistry, NodeExecutor, NodeHandler, NodeTask};
pub use files::{FileInfo, FileLifecycleManager};
pub use graph::{compute_layers, DependencyGraph};
pub use remote::{
    ChatClient, ChatMessage, ChatRequest, FileClient, MediaSink, Prediction, PredictionClient,
    PredictionStatus, UploadedFile,
};
pub use router::{OwnerTableRouter, ProviderRouter, Route};
pub use runner::{NodeFailure, RunOptions, RunResult, WorkflowRunner};
pub use schema::NormalizedSchema;
pub use schema_cache::SchemaCache;
pub use types::{
    DataKind, GraphEdge, GraphNode, NodeOutputs, NodeType, OutputTable, PortValue, WorkflowGraph,
};

// Consumers need the token type to cancel runs
pub use tokio_util::sync::CancellationToken;
