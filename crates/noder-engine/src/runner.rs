//! Workflow orchestration
//!
//! The run loop: seed cached outputs, layer the graph, run each layer's nodes
//! concurrently, store and publish their outputs, collect failures, then clean
//! up remote files.
//!
//! A node only starts once every layer holding its dependencies has finished,
//! so nodes never observe a missing upstream output. Within a layer nodes read
//! a shared snapshot of the output table and results are written back after
//! the layer completes, one key per node.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::dispatch::OutputDispatcher;
use crate::error::{NodeEngineError, Result};
use crate::events::{EventSink, SkipReason, WorkflowEvent};
use crate::executor::{NodeExecutor, NodeTask};
use crate::files::FileLifecycleManager;
use crate::graph::compute_layers;
use crate::inputs::aggregate_inputs;
use crate::types::{GraphEdge, GraphNode, NodeId, NodeOutputs, OutputTable, WorkflowGraph};

/// Caller-controlled behaviour of one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Outputs from an earlier run; these nodes are not executed again
    pub initial_node_outputs: OutputTable,
    /// Nodes that must not be executed
    pub skip_node_ids: HashSet<NodeId>,
    /// Keep running independent nodes after a failure
    pub continue_on_error: bool,
    /// Delete uploaded files when the run ends
    pub auto_cleanup: bool,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            initial_node_outputs: OutputTable::new(),
            skip_node_ids: HashSet::new(),
            continue_on_error: false,
            auto_cleanup: true,
            cancel: CancellationToken::new(),
        }
    }
}

/// A failed node and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub message: String,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    /// True when no node failed and the run was not cancelled
    pub success: bool,
    /// Wall-clock duration in milliseconds
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    /// Every output present at the end, seeded ones included
    pub node_outputs: OutputTable,
    pub completed_count: usize,
    /// Nodes skipped on request or because they already had outputs
    pub skipped_nodes: Vec<NodeId>,
    /// Message of the first failure
    pub error: Option<String>,
    pub errors: Vec<NodeFailure>,
}

/// Mutable state of one run
#[derive(Debug, Default)]
struct ExecutionState {
    node_outputs: OutputTable,
    completed_count: usize,
    skipped_node_ids: Vec<NodeId>,
    errors: Vec<NodeFailure>,
    cancelled: bool,
}

/// Runs whole workflows on top of a [`NodeExecutor`]
pub struct WorkflowRunner {
    executor: Arc<NodeExecutor>,
    files: Option<Arc<FileLifecycleManager>>,
}

impl WorkflowRunner {
    pub fn new(executor: NodeExecutor) -> Self {
        let files = executor.context().files.clone();
        Self {
            executor: Arc::new(executor),
            files,
        }
    }

    pub fn executor(&self) -> &NodeExecutor {
        &self.executor
    }

    /// Run a graph value
    pub async fn run_graph(
        &self,
        graph: &WorkflowGraph,
        options: RunOptions,
        events: &dyn EventSink,
    ) -> Result<RunResult> {
        self.run(&graph.nodes, &graph.edges, options, events).await
    }

    /// Run `nodes`/`edges` to completion
    ///
    /// Node failures never surface as `Err`: they are reported through
    /// `events` and collected in the result. Without `continue_on_error` the
    /// layer in which the first failure happens is finished and no later
    /// layer is started. Graph-level problems (a cycle, an edge to an unknown
    /// node) fail the run before any node starts.
    pub async fn run(
        &self,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
        options: RunOptions,
        events: &dyn EventSink,
    ) -> Result<RunResult> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let total = nodes.len();
        log::info!("Run {} started with {} nodes", run_id, total);
        emit(
            events,
            WorkflowEvent::RunStarted {
                run_id: run_id.clone(),
                node_count: total,
            },
        );

        let mut state = ExecutionState {
            node_outputs: options.initial_node_outputs,
            ..Default::default()
        };
        state.completed_count = nodes
            .iter()
            .filter(|n| state.node_outputs.contains_key(&n.id))
            .count();
        if state.completed_count > 0 {
            emit(
                events,
                WorkflowEvent::Progress {
                    completed: state.completed_count,
                    total,
                },
            );
        }

        let layers = match compute_layers(nodes, edges) {
            Ok(layers) => layers,
            Err(e) => {
                log::warn!("Run {} refused: {}", run_id, e);
                self.cleanup_if(options.auto_cleanup).await;
                emit(
                    events,
                    WorkflowEvent::RunFinished {
                        run_id,
                        success: false,
                        error: Some(e.to_string()),
                    },
                );
                return Err(e);
            }
        };

        let mut by_id: HashMap<&str, &GraphNode> = HashMap::with_capacity(nodes.len());
        for node in nodes {
            by_id.entry(node.id.as_str()).or_insert(node);
        }

        let semaphore = self
            .executor
            .context()
            .config
            .max_concurrency
            .filter(|limit| *limit > 0)
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let cancel = &options.cancel;

        for (index, layer) in layers.iter().enumerate() {
            if cancel.is_cancelled() {
                state.cancelled = true;
                break;
            }

            let mut runnable = Vec::with_capacity(layer.len());
            for id in layer {
                if options.skip_node_ids.contains(id) {
                    log::debug!("Skipping node {} on request", id);
                    state.skipped_node_ids.push(id.clone());
                    emit(events, WorkflowEvent::node_skipped(id, SkipReason::Skipped));
                } else if state.node_outputs.contains_key(id) {
                    log::debug!("Node {} already has outputs", id);
                    state.skipped_node_ids.push(id.clone());
                    emit(events, WorkflowEvent::node_skipped(id, SkipReason::Cached));
                } else if let Some(node) = by_id.get(id.as_str()) {
                    runnable.push(*node);
                }
            }
            if runnable.is_empty() {
                continue;
            }
            log::debug!("Layer {}: running {} nodes", index, runnable.len());

            let completed = AtomicUsize::new(state.completed_count);
            let snapshot = &state.node_outputs;
            let results = join_all(runnable.iter().map(|node| {
                self.run_node(
                    node,
                    nodes,
                    edges,
                    snapshot,
                    events,
                    cancel,
                    semaphore.as_deref(),
                    &completed,
                    total,
                )
            }))
            .await;
            state.completed_count = completed.into_inner();

            let mut failed = false;
            for (node, result) in runnable.iter().zip(results) {
                match result {
                    Ok(outputs) => {
                        state.node_outputs.insert(node.id.clone(), outputs);
                    }
                    Err(NodeEngineError::Cancelled) => state.cancelled = true,
                    Err(e) => {
                        failed = true;
                        state.errors.push(NodeFailure {
                            node_id: node.id.clone(),
                            message: e.to_string(),
                        });
                    }
                }
            }

            if state.cancelled {
                break;
            }
            if failed && !options.continue_on_error {
                log::info!("Run {} halted after layer {}", run_id, index);
                break;
            }
        }

        self.cleanup_if(options.auto_cleanup).await;

        let error = state
            .errors
            .first()
            .map(|f| f.message.clone())
            .or_else(|| {
                state
                    .cancelled
                    .then(|| NodeEngineError::Cancelled.to_string())
            });
        let success = error.is_none();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        log::info!(
            "Run {} finished in {} ms (success: {}, completed: {}/{})",
            run_id,
            duration_ms,
            success,
            state.completed_count,
            total
        );
        emit(
            events,
            WorkflowEvent::RunFinished {
                run_id: run_id.clone(),
                success,
                error: error.clone(),
            },
        );

        Ok(RunResult {
            run_id,
            success,
            duration_ms,
            node_outputs: state.node_outputs,
            completed_count: state.completed_count,
            skipped_nodes: state.skipped_node_ids,
            error,
            errors: state.errors,
        })
    }

    async fn cleanup_if(&self, auto_cleanup: bool) {
        if !auto_cleanup {
            return;
        }
        if let Some(files) = &self.files {
            files.cleanup_all().await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_node(
        &self,
        node: &GraphNode,
        nodes: &[GraphNode],
        edges: &[GraphEdge],
        snapshot: &OutputTable,
        events: &dyn EventSink,
        cancel: &CancellationToken,
        semaphore: Option<&Semaphore>,
        completed: &AtomicUsize,
        total: usize,
    ) -> Result<NodeOutputs> {
        let _permit = match semaphore {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };
        if cancel.is_cancelled() {
            return Err(NodeEngineError::Cancelled);
        }

        emit(
            events,
            WorkflowEvent::node_started(&node.id, node.node_type.as_str()),
        );

        let task = NodeTask {
            node,
            inputs: aggregate_inputs(&node.id, edges, snapshot),
            nodes,
            outputs: snapshot,
            events,
            cancel,
        };

        match self.executor.execute(&task).await {
            Ok(outputs) => {
                emit(
                    events,
                    WorkflowEvent::NodeCompleted {
                        node_id: node.id.clone(),
                        outputs: outputs.clone(),
                    },
                );
                OutputDispatcher::new(edges, events).dispatch(&node.id, &outputs);
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                emit(events, WorkflowEvent::Progress { completed: done, total });
                Ok(outputs)
            }
            Err(NodeEngineError::Cancelled) => {
                log::info!("Node {} cancelled", node.id);
                Err(NodeEngineError::Cancelled)
            }
            Err(e) => {
                log::warn!("Node {} failed: {}", node.id, e);
                emit(events, WorkflowEvent::node_error(&node.id, e.to_string()));
                Err(e)
            }
        }
    }
}

fn emit(events: &dyn EventSink, event: WorkflowEvent) {
    if let Err(e) = events.send(event) {
        log::debug!("Event dropped: {}", e);
    }
}
