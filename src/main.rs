use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dagwright_core::{EngineConfig, EventBus, Payload};
use dagwright_engine::Executor;
use dagwright_nodes::{GraphLoader, LoadedGraph};

#[derive(Parser)]
#[command(name = "dagwright", version, about = "Layered DAG workflow runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "dagwright.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a graph definition and print the result as JSON
    Run {
        /// Graph definition file
        graph: PathBuf,
        /// JSON file mapping node ids to initial inputs
        #[arg(long)]
        inputs: Option<PathBuf>,
        /// Stream lifecycle events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Print the execution layers of a graph
    Layers {
        graph: PathBuf,
    },
    /// Check that a graph loads and is acyclic
    Validate {
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            graph,
            inputs,
            events,
        } => {
            let success = run_graph(&config, &graph, inputs.as_deref(), events).await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Layers { graph } => {
            let loaded = GraphLoader::new(&config).load_file(&graph)?;
            let layers = loaded.graph.topological_layers()?;
            println!("{}", serde_json::to_string_pretty(&layers)?);
        }
        Commands::Validate { graph } => {
            let loaded = GraphLoader::new(&config).load_file(&graph)?;
            let layers = loaded.graph.topological_layers()?;
            println!(
                "ok: {} ({} nodes, {} edges, {} layers)",
                display_name(&loaded, &graph),
                loaded.graph.len(),
                loaded.graph.edges().len(),
                layers.len()
            );
        }
    }

    Ok(())
}

async fn run_graph(
    config: &EngineConfig,
    path: &Path,
    inputs: Option<&Path>,
    stream_events: bool,
) -> anyhow::Result<bool> {
    let initial_inputs = match inputs {
        Some(p) => read_inputs(p)?,
        None => HashMap::new(),
    };

    let mut loader = GraphLoader::new(config);
    let mut executor = Executor::from_config(&config.engine);
    let mut printer = None;

    if stream_events {
        let bus = Arc::new(EventBus::new(config.engine.event_capacity));
        let mut rx = bus.subscribe();
        printer = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => match serde_json::to_string(&record) {
                        Ok(line) => eprintln!("{}", line),
                        Err(e) => warn!(error = %e, "Failed to encode event"),
                    },
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Event stream lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        }));
        loader = loader.with_sink(bus.clone());
        executor = executor.with_sink(bus);
    }

    let loaded = loader.load_file(path)?;
    info!(graph = %display_name(&loaded, path), "Running graph");
    let result = executor.execute(&loaded.graph, initial_inputs).await;

    // Every sink handle must be gone before the printer sees the channel close.
    drop(executor);
    drop(loaded);
    drop(loader);
    if let Some(handle) = printer {
        handle.await.context("event printer task failed")?;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(result.success)
}

fn read_inputs(path: &Path) -> anyhow::Result<HashMap<String, Payload>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading inputs from {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("{} must map node ids to JSON objects", path.display()))
}

fn display_name(loaded: &LoadedGraph, path: &Path) -> String {
    if loaded.name.is_empty() {
        path.display().to_string()
    } else {
        loaded.name.clone()
    }
}
