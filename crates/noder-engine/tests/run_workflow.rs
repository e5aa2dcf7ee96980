//! End-to-end runs against in-memory collaborators

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use noder_engine::testing::{FakeChatClient, FakeFileClient, FakePredictionClient};
use noder_engine::{
    CancellationToken, DataKind, EngineConfig, ExecutionContext, FileLifecycleManager, GraphEdge,
    GraphNode, HandlerRegistry, NodeEngineError, NodeExecutor, NodeOutputs, OutputTable,
    PortValue, PredictionStatus, RunOptions, SkipReason, VecEventSink, WorkflowEvent,
    WorkflowRunner,
};
use serde_json::json;

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.poll.interval_ms = 5;
    config
}

fn runner(predictions: FakePredictionClient) -> WorkflowRunner {
    let context = ExecutionContext::new(Arc::new(predictions), fast_config());
    WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()))
}

fn media(id: &str, url: &str) -> GraphNode {
    GraphNode::new(id, "media", json!({"fileUrl": url, "mediaType": "image"}))
}

fn started(events: &[WorkflowEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::NodeStarted { node_id, .. } => Some(node_id.clone()),
            _ => None,
        })
        .collect()
}

fn count(events: &[WorkflowEvent], pred: impl Fn(&WorkflowEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

#[tokio::test]
async fn test_seeded_node_is_skipped_as_cached() {
    let nodes = vec![media("a", "https://cdn.test/a.png"), media("b", "https://cdn.test/b.png")];
    let mut seeded = OutputTable::new();
    let mut a_out = NodeOutputs::new();
    a_out.insert("out".into(), PortValue::new(DataKind::Image, "cached-output"));
    seeded.insert("a".into(), a_out);

    let sink = VecEventSink::new();
    let options = RunOptions {
        initial_node_outputs: seeded,
        ..Default::default()
    };
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &[], options, &sink)
        .await
        .unwrap();
    let events = sink.events();

    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::NodeSkipped { node_id, reason: SkipReason::Cached } if node_id == "a"
    )));
    assert_eq!(started(&events), vec!["b"]);
    assert_eq!(
        count(&events, |e| matches!(e, WorkflowEvent::NodeCompleted { .. })),
        1
    );
    assert_eq!(result.node_outputs["a"]["out"].as_str(), Some("cached-output"));
    assert_eq!(result.completed_count, 2);
    assert!(result.success);
}

#[tokio::test]
async fn test_explicit_skip_is_never_started() {
    let nodes = vec![media("a", "https://cdn.test/a.png"), media("b", "https://cdn.test/b.png")];
    let sink = VecEventSink::new();
    let options = RunOptions {
        skip_node_ids: HashSet::from(["b".to_string()]),
        ..Default::default()
    };
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &[], options, &sink)
        .await
        .unwrap();
    let events = sink.events();

    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::NodeSkipped { node_id, reason: SkipReason::Skipped } if node_id == "b"
    )));
    assert!(!started(&events).contains(&"b".to_string()));
    assert_eq!(result.skipped_nodes, vec!["b"]);
    assert!(!result.node_outputs.contains_key("b"));
}

#[tokio::test]
async fn test_chip_node_output() {
    let nodes = vec![GraphNode::new(
        "chip",
        "chip",
        json!({"content": "my chip value", "chipId": "CHARACTER"}),
    )];
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &[], RunOptions::default(), &VecEventSink::new())
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(&result.node_outputs["chip"]["out"]).unwrap(),
        json!({"type": "text", "value": "my chip value", "chipId": "CHARACTER", "isChip": true})
    );
}

#[tokio::test]
async fn test_failure_with_continue_on_error_keeps_other_outputs() {
    let nodes = vec![
        GraphNode::new("t", "text", json!({"model": "meta/llama", "prompt": ""})),
        media("m", "https://cdn.test/m.png"),
    ];
    let sink = VecEventSink::new();
    let options = RunOptions {
        continue_on_error: true,
        ..Default::default()
    };
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &[], options, &sink)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("No prompt provided"));
    assert!(result.node_outputs.contains_key("m"));
    assert_eq!(
        count(&sink.events(), |e| matches!(e, WorkflowEvent::NodeError { .. })),
        1
    );
}

#[tokio::test]
async fn test_empty_prompt_reported_before_missing_model() {
    let nodes = vec![GraphNode::new("t", "text", json!({"prompt": ""}))];
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &[], RunOptions::default(), &VecEventSink::new())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("No prompt provided"));
    assert_eq!(result.errors[0].node_id, "t");
}

#[tokio::test]
async fn test_failure_without_continue_on_error_stops_later_layers() {
    // m -> t2 puts the second failing text node in a later layer than t1
    let nodes = vec![
        GraphNode::new("t1", "text", json!({"model": "meta/llama"})),
        media("m", "https://cdn.test/m.png"),
        GraphNode::new("t2", "text", json!({"model": "meta/llama"})),
        media("after", "https://cdn.test/after.png"),
    ];
    let edges = vec![
        GraphEdge::new("m", "out", "t2", "image"),
        GraphEdge::new("t1", "out", "after", "in"),
    ];
    let sink = VecEventSink::new();
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &edges, RunOptions::default(), &sink)
        .await
        .unwrap();
    let events = sink.events();

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].node_id, "t1");
    let started = started(&events);
    assert!(!started.contains(&"t2".to_string()));
    assert!(!started.contains(&"after".to_string()));
    assert_eq!(
        count(&events, |e| matches!(e, WorkflowEvent::NodeError { .. })),
        1
    );
}

#[tokio::test]
async fn test_cycle_is_refused_before_running() {
    let nodes = vec![
        media("a", "https://cdn.test/a.png"),
        media("b", "https://cdn.test/b.png"),
        media("c", "https://cdn.test/c.png"),
    ];
    let edges = vec![
        GraphEdge::new("a", "out", "b", "in"),
        GraphEdge::new("b", "out", "c", "in"),
        GraphEdge::new("c", "out", "b", "in"),
    ];
    let sink = VecEventSink::new();
    let err = runner(FakePredictionClient::new())
        .run(&nodes, &edges, RunOptions::default(), &sink)
        .await
        .unwrap_err();

    assert!(matches!(err, NodeEngineError::Cycle { .. }));
    assert_eq!(err.to_string(), "Workflow contains a cycle involving nodes: b, c");
    assert!(started(&sink.events()).is_empty());
}

#[tokio::test]
async fn test_refused_run_still_cleans_up_earlier_uploads() {
    let file_client = Arc::new(FakeFileClient::new());
    let files = Arc::new(FileLifecycleManager::new(file_client.clone()));
    let context = ExecutionContext::new(Arc::new(FakePredictionClient::new()), fast_config())
        .with_files(files.clone());
    let runner = WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));

    let upload = vec![GraphNode::new("m", "media", json!({"mediaPath": "/tmp/photo.png"}))];
    let keep = RunOptions {
        auto_cleanup: false,
        ..Default::default()
    };
    runner
        .run(&upload, &[], keep, &VecEventSink::new())
        .await
        .unwrap();
    assert_eq!(files.len(), 1);

    let looped = vec![media("a", "https://cdn.test/a.png"), media("b", "https://cdn.test/b.png")];
    let edges = vec![
        GraphEdge::new("a", "out", "b", "in"),
        GraphEdge::new("b", "out", "a", "in"),
    ];
    let err = runner
        .run(&looped, &edges, RunOptions::default(), &VecEventSink::new())
        .await
        .unwrap_err();

    assert!(matches!(err, NodeEngineError::Cycle { .. }));
    assert_eq!(file_client.deletes(), vec!["file-1"]);
    assert!(files.is_empty());
}

#[tokio::test]
async fn test_outputs_flow_downstream_with_chips() {
    let predictions = FakePredictionClient::new()
        .with_output("acme/painter", json!(["https://out.test/castle.png"]));
    let chat = Arc::new(FakeChatClient::replying("A castle on a hill"));
    let predictions = Arc::new(predictions);
    let context = ExecutionContext::new(predictions.clone(), fast_config()).with_chat(chat.clone());
    let runner = WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));

    let nodes = vec![
        GraphNode::new("hero", "chip", json!({"chipId": "HERO", "content": "a knight"})),
        GraphNode::new(
            "writer",
            "text",
            json!({"model": "openai/gpt-4o", "prompt": "Describe where __hero__ lives"}),
        ),
        GraphNode::new("painter", "image", json!({"model": "acme/painter"})),
        GraphNode::new("show", "display", json!({})),
    ];
    let edges = vec![
        GraphEdge::new("writer", "out", "painter", "prompt"),
        GraphEdge::new("painter", "out", "show", "in"),
    ];
    let sink = VecEventSink::new();
    let result = runner
        .run(&nodes, &edges, RunOptions::default(), &sink)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(chat.requests()[0].messages.last().unwrap().content, "Describe where a knight lives");
    assert_eq!(predictions.submissions()[0].1, json!({"prompt": "A castle on a hill"}));
    assert_eq!(
        result.node_outputs["show"]["out"].as_str(),
        Some("https://out.test/castle.png")
    );

    let pushes: Vec<(String, String)> = sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            WorkflowEvent::NodeContentChanged {
                source_id,
                target_id,
                ..
            } => Some((source_id, target_id)),
            _ => None,
        })
        .collect();
    assert_eq!(
        pushes,
        vec![
            ("writer".to_string(), "painter".to_string()),
            ("painter".to_string(), "show".to_string())
        ]
    );
}

#[tokio::test]
async fn test_uploads_are_cleaned_up_unless_disabled() {
    for auto_cleanup in [true, false] {
        let file_client = Arc::new(FakeFileClient::new());
        let files = Arc::new(FileLifecycleManager::new(file_client.clone()));
        let context = ExecutionContext::new(Arc::new(FakePredictionClient::new()), fast_config())
            .with_files(files.clone());
        let runner =
            WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));

        let nodes = vec![GraphNode::new(
            "m",
            "media",
            json!({"mediaPath": "/tmp/photo.png"}),
        )];
        let options = RunOptions {
            auto_cleanup,
            ..Default::default()
        };
        let result = runner
            .run(&nodes, &[], options, &VecEventSink::new())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(file_client.uploads().len(), 1);
        if auto_cleanup {
            assert_eq!(file_client.deletes(), vec!["file-1"]);
            assert!(files.is_empty());
        } else {
            assert!(file_client.deletes().is_empty());
            assert_eq!(files.len(), 1);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_stops_polling_and_cleans_up() {
    let predictions = Arc::new(
        FakePredictionClient::new()
            .with_status_sequence("acme/slow", vec![PredictionStatus::Processing]),
    );
    let file_client = Arc::new(FakeFileClient::new());
    let files = Arc::new(FileLifecycleManager::new(file_client.clone()));
    let context =
        ExecutionContext::new(predictions.clone(), fast_config()).with_files(files.clone());
    let runner = WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));

    let nodes = vec![
        GraphNode::new("m", "media", json!({"mediaPath": "/tmp/ref.png"})),
        GraphNode::new("img", "image", json!({"model": "acme/slow", "prompt": "x"})),
        media("later", "https://cdn.test/later.png"),
    ];
    let edges = vec![
        GraphEdge::new("m", "out", "img", "image"),
        GraphEdge::new("img", "out", "later", "in"),
    ];

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let sink = VecEventSink::new();
    let options = RunOptions {
        cancel,
        ..Default::default()
    };
    let result = runner.run(&nodes, &edges, options, &sink).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Workflow cancelled"));
    assert!(result.errors.is_empty());
    assert_eq!(predictions.cancelled(), vec!["pred-1"]);
    assert!(!started(&sink.events()).contains(&"later".to_string()));
    assert_eq!(file_client.deletes(), vec!["file-1"]);
}

#[tokio::test]
async fn test_unknown_node_type_passes_through() {
    let nodes = vec![
        media("a", "https://cdn.test/a.png"),
        GraphNode::new("note", "sticky-note", json!({})),
    ];
    let edges = vec![GraphEdge::new("a", "out", "note", "in")];
    let result = runner(FakePredictionClient::new())
        .run(&nodes, &edges, RunOptions::default(), &VecEventSink::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.node_outputs["note"]["out"].as_str(), Some("https://cdn.test/a.png"));
}

#[tokio::test]
async fn test_bounded_concurrency_still_runs_every_node() {
    let mut config = fast_config();
    config.max_concurrency = Some(1);
    let context = ExecutionContext::new(Arc::new(FakePredictionClient::new()), config);
    let runner = WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));

    let nodes: Vec<GraphNode> = (0..5)
        .map(|i| {
            GraphNode::new(
                format!("img{}", i),
                "image",
                json!({"model": "acme/x", "prompt": "p"}),
            )
        })
        .collect();
    let result = runner
        .run(&nodes, &[], RunOptions::default(), &VecEventSink::new())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.completed_count, 5);
}
