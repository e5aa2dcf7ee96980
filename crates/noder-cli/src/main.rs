//! `noder`: run a workflow file against the configured providers

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use noder_engine::{
    CancellationToken, ChannelEventSink, EngineConfig, ExecutionContext, FileLifecycleManager,
    HandlerRegistry, NodeEngineError, NodeExecutor, OutputTable, RunOptions, WorkflowEvent,
    WorkflowGraph, WorkflowRunner,
};
use noder_providers::{
    LocalMediaSaver, ProviderChatClient, ProviderError, ProviderSettings, ReplicateClient,
};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Engine(#[from] NodeEngineError),

    #[error("Failed to write result: {0}")]
    Output(#[from] serde_json::Error),
}

/// Run a Noder generation workflow
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Workflow JSON file with `nodes` and `edges`
    workflow: PathBuf,

    /// Provider settings file (defaults to <config dir>/noder/settings.json)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Engine configuration JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Earlier run result (or bare output table) whose outputs are reused
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Node id to leave out of the run (repeatable)
    #[arg(long = "skip", value_name = "NODE_ID")]
    skip: Vec<String>,

    /// Keep running independent nodes after a failure
    #[arg(long)]
    continue_on_error: bool,

    /// Leave uploaded files on the provider when the run ends
    #[arg(long)]
    no_cleanup: bool,

    /// Print workflow events to stderr as JSON lines
    #[arg(long)]
    events: bool,
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CliError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_str(&contents).map_err(|source| CliError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Outputs to resume from: a run result's `nodeOutputs`, or the table itself
fn resume_table(document: Value) -> Result<OutputTable, serde_json::Error> {
    match document {
        Value::Object(mut map) if map.contains_key("nodeOutputs") => {
            serde_json::from_value(map.remove("nodeOutputs").unwrap_or(Value::Null))
        }
        other => serde_json::from_value(other),
    }
}

/// Settings supply default models the engine configuration leaves unset
fn merge_default_models(config: &mut EngineConfig, settings: &ProviderSettings) {
    let from_settings = settings.default_models();
    let models = &mut config.default_models;
    for (slot, fallback) in [
        (&mut models.text, from_settings.text),
        (&mut models.image, from_settings.image),
        (&mut models.video, from_settings.video),
        (&mut models.audio, from_settings.audio),
        (&mut models.upscaler, from_settings.upscaler),
    ] {
        if slot.is_none() {
            *slot = fallback;
        }
    }
}

fn log_event(event: &WorkflowEvent, print: bool) {
    if print {
        match serde_json::to_string(event) {
            Ok(line) => eprintln!("{}", line),
            Err(e) => log::warn!("Failed to encode event: {}", e),
        }
        return;
    }
    match event {
        WorkflowEvent::NodeStarted { node_id, .. } => log::info!("Node {} started", node_id),
        WorkflowEvent::NodeError { node_id, error } => {
            log::error!("Node {} failed: {}", node_id, error)
        }
        WorkflowEvent::Progress { completed, total } => {
            log::info!("Progress {}/{}", completed, total)
        }
        other => log::debug!("{:?}", other),
    }
}

async fn run(cli: Cli) -> Result<bool, CliError> {
    let settings = ProviderSettings::load(cli.settings.as_deref()).await?;
    let mut config = match &cli.config {
        Some(path) => read_json::<EngineConfig>(path).await?,
        None => EngineConfig::default(),
    };
    merge_default_models(&mut config, &settings);

    let graph: WorkflowGraph = read_json(&cli.workflow).await?;
    let initial_node_outputs = match &cli.resume {
        Some(path) => {
            let document: Value = read_json(path).await?;
            resume_table(document).map_err(|source| CliError::Parse {
                path: path.clone(),
                source,
            })?
        }
        None => OutputTable::new(),
    };

    let replicate = Arc::new(ReplicateClient::from_settings(&settings)?);
    let files = Arc::new(FileLifecycleManager::with_expiry_buffer(
        replicate.clone(),
        config.link_expiry_buffer_secs,
    ));
    let context = ExecutionContext::new(replicate, config)
        .with_chat(Arc::new(ProviderChatClient::from_settings(&settings)))
        .with_files(files)
        .with_media_sink(Arc::new(LocalMediaSaver::from_settings(&settings)));
    let runner = WorkflowRunner::new(NodeExecutor::new(context, HandlerRegistry::with_defaults()));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let (sink, mut receiver) = ChannelEventSink::new();
    let print_events = cli.events;
    let drain = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            log_event(&event, print_events);
        }
    });

    let options = RunOptions {
        initial_node_outputs,
        skip_node_ids: cli.skip.into_iter().collect::<HashSet<_>>(),
        continue_on_error: cli.continue_on_error,
        auto_cleanup: !cli.no_cleanup,
        cancel,
    };
    let result = runner.run_graph(&graph, options, &sink).await;
    drop(sink);
    if let Err(e) = drain.await {
        log::debug!("Event drain ended abnormally: {}", e);
    }

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(2);
        }
    }
}
