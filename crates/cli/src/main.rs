use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nagare_core::{demos, EngineError, NodeStatus, WorkflowExecutor};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;

use config::{CliConfig, LogConfig};

#[derive(Parser, Debug)]
#[command(name = "nagare")]
#[command(about = "Dynamic workflow engine - runs the reference workflows locally", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "nagare.toml", env = "NAGARE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count the letters two strings have in common
    CountCharacters {
        #[arg(long)]
        s1: String,

        #[arg(long)]
        s2: String,
    },

    /// Sort integers, splitting recursively above a threshold
    MergeSort {
        /// Comma-separated integers
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        numbers: Vec<i64>,

        /// Lists at or below this size are sorted in a single task
        #[arg(long, value_parser = clap::value_parser!(i64).range(1..))]
        run_local_at_count: Option<i64>,
    },

    /// Print the static plan of a registered workflow as DOT
    Graph { workflow: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = CliConfig::load(&args.config)?;
    init_tracing(&config.logging);

    let registry = demos::registry().context("Failed to register reference workflows")?;
    let executor = WorkflowExecutor::new(Arc::new(registry), config.engine);

    match args.command {
        Command::CountCharacters { s1, s2 } => {
            let output = run(
                &executor,
                "dynamic_wf",
                vec![("s1", json!(s1)), ("s2", json!(s2))],
            )
            .await?;
            println!("{}", output);
        }
        Command::MergeSort {
            numbers,
            run_local_at_count,
        } => {
            let mut inputs = vec![
                ("numbers_count", json!(numbers.len())),
                ("numbers", json!(numbers)),
            ];
            if let Some(count) = run_local_at_count {
                inputs.push(("run_local_at_count", json!(count)));
            }
            let output = run(&executor, "merge_sort", inputs).await?;
            println!("{}", output);
        }
        Command::Graph { workflow } => {
            let plan = executor.compile(&workflow).with_context(|| {
                format!(
                    "Failed to compile '{}' (registered workflows: {})",
                    workflow,
                    executor.registry().workflow_names().join(", ")
                )
            })?;
            println!("{}", plan.to_dot());
        }
    }

    Ok(())
}

/// Run a workflow, cancelling it on Ctrl-C
async fn run(
    executor: &WorkflowExecutor,
    workflow: &str,
    inputs: Vec<(&str, Value)>,
) -> Result<Value> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling run");
            on_signal.cancel();
        }
    });

    let run = executor
        .run(workflow, inputs, cancel)
        .await
        .map_err(|err| report(workflow, err))?;

    tracing::info!(
        "Run {} of {} finished with {} nodes",
        run.id,
        run.workflow,
        run.nodes.len()
    );
    Ok(run.output.unwrap_or_default())
}

/// Log what a failed run left behind and attach the workflow to the cause
fn report(workflow: &str, err: EngineError) -> anyhow::Error {
    if let Some(run) = err.run() {
        for node in run.nodes.iter().filter(|n| n.status == NodeStatus::Failed) {
            tracing::error!(
                "Node {} ({}) failed: {}",
                node.name,
                node.id,
                node.error.as_deref().unwrap_or("no error recorded")
            );
        }
        tracing::info!(
            "Run {} of {} ended {:?} with {} nodes",
            run.id,
            run.workflow,
            run.status,
            run.nodes.len()
        );
    }

    let context = match err.node() {
        _ if err.is_construction_error() => format!("Invalid workflow '{}'", workflow),
        Some(node) => format!("Workflow '{}' failed at {}", workflow, node),
        None => format!("Workflow '{}' failed", workflow),
    };
    anyhow::Error::new(err.into_root()).context(context)
}

fn init_tracing(logging: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    // Logs go to stderr so workflow output can be piped
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
