// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The flowengine CLI: an interface-only front end over `flowengine-core`'s
//! `Runner` -- parses a workflow file, wires up providers/secrets/state, and
//! drives one run, one resume, or one event delivery per invocation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowengine_core::expr::StepContext;
use flowengine_core::providers::LanguageModel;
use flowengine_core::runner::RunObserver;
use flowengine_core::scheduler::StepStatus as SchedulerStepStatus;
use flowengine_core::{Runner, Workflow};
use flowengine_providers::{AnthropicModel, OpenAiModel};
use flowengine_secrets::{EnvSecretsProvider, SecretsProvider};
use flowengine_state::{SqliteStateStore, StateStore, StateStoreObserver, StepExecution, StepStatus as StoreStepStatus};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Environment variable prefix a run's secrets are collected from, e.g.
/// `FLOWENGINE_SECRET_API_KEY` becomes `secrets.API_KEY` inside `${{ }}` expressions.
const SECRET_ENV_PREFIX: &str = "FLOWENGINE_SECRET_";

const EXIT_SUCCESS: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_CANCELLED: i32 = 2;
const EXIT_CONFIG_ERROR: i32 = 3;

#[derive(Parser)]
#[command(name = "flowengine")]
#[command(version, about = "Durable, agent-oriented workflow runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition without running it
    Validate {
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow from scratch
    Run {
        #[arg(value_name = "FILE")]
        file: String,

        /// Input as `key=value`; repeatable. Values are parsed as JSON, falling back
        /// to a plain string.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// SQLite database path for durable state; `:memory:` for a throwaway run.
        #[arg(long, default_value = "flowengine.sqlite")]
        db: String,

        /// Workflow-level cap on concurrently in-flight steps.
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Resume a previously-interrupted run
    Resume {
        /// The workflow file that produced the run being resumed -- the state store
        /// only records the workflow's name, not its full definition.
        #[arg(value_name = "FILE")]
        file: String,

        #[arg(value_name = "RUN_ID")]
        run_id: Uuid,

        #[arg(long, default_value = "flowengine.sqlite")]
        db: String,
    },

    /// Deliver an external event to a run's suspended steps
    Event {
        #[arg(value_name = "RUN_ID")]
        run_id: Uuid,

        #[arg(value_name = "NAME")]
        name: String,

        /// Event payload as a JSON string; defaults to `null`.
        #[arg(value_name = "DATA")]
        data: Option<String>,

        #[arg(long, default_value = "flowengine.sqlite")]
        db: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("flowengine={log_level}").into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let exit_code = match cli.command {
        Commands::Validate { file } => match validate_workflow(&file) {
            Ok(()) => EXIT_SUCCESS,
            Err(err) => report(err, EXIT_CONFIG_ERROR),
        },
        Commands::Run { file, inputs, db, max_concurrency } => {
            match run_cancellable(run_workflow(&file, &inputs, &db, max_concurrency)).await {
                Some(Ok(failed)) if failed => EXIT_FAILED,
                Some(Ok(_)) => EXIT_SUCCESS,
                Some(Err(err)) => report(err, EXIT_CONFIG_ERROR),
                None => EXIT_CANCELLED,
            }
        }
        Commands::Resume { file, run_id, db } => match run_cancellable(resume_workflow(&file, run_id, &db)).await {
            Some(Ok(failed)) if failed => EXIT_FAILED,
            Some(Ok(_)) => EXIT_SUCCESS,
            Some(Err(err)) => report(err, EXIT_CONFIG_ERROR),
            None => EXIT_CANCELLED,
        },
        Commands::Event { run_id, name, data, db } => match deliver_event(run_id, &name, data.as_deref(), &db).await {
            Ok(()) => EXIT_SUCCESS,
            Err(err) => report(err, EXIT_CONFIG_ERROR),
        },
    };

    std::process::exit(exit_code);
}

/// Races a run/resume future against Ctrl-C; `None` means the user cancelled
/// first. The workflow task itself is left to die with the process -- there is
/// no cancellation token threaded into `Runner::run`/`resume` from here, so a
/// cancelled CLI invocation simply abandons the in-flight run rather than
/// unwinding it gracefully.
async fn run_cancellable<T>(fut: impl std::future::Future<Output = Result<T>>) -> Option<Result<T>> {
    tokio::select! {
        result = fut => Some(result),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "cancelled by user".yellow().bold());
            None
        }
    }
}

fn report(err: anyhow::Error, code: i32) -> i32 {
    eprintln!("{} {err:#}", "error:".red().bold());
    code
}

fn load_workflow(file_path: &str) -> Result<Workflow> {
    let content = std::fs::read_to_string(file_path).with_context(|| format!("failed to read workflow file: {file_path}"))?;
    let workflow: Workflow =
        serde_yaml::from_str(&content).with_context(|| format!("failed to parse workflow YAML: {file_path}"))?;
    workflow.validate().context("workflow validation failed")?;
    Ok(workflow)
}

fn parse_inputs(pairs: &[String]) -> Result<Value> {
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, raw) = pair.split_once('=').with_context(|| format!("malformed --input (expected key=value): {pair}"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(Value::Object(map))
}

async fn load_secrets() -> Result<Value> {
    let provider = EnvSecretsProvider::new(SECRET_ENV_PREFIX);
    provider.load().await.context("failed to load secrets")
}

/// Registers whichever LLM providers have credentials available in the environment.
/// A workflow with no `llm` steps runs fine with none registered.
fn build_runner(workflow: Workflow) -> Result<Runner> {
    let mut runner = Runner::new(workflow).context("failed to construct runner")?;

    let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
    match AnthropicModel::from_env() {
        Ok(model) => {
            info!("registered anthropic model");
            models.insert("anthropic".to_string(), Arc::new(model));
        }
        Err(_) => info!("anthropic model not available (ANTHROPIC_API_KEY not set)"),
    }
    match OpenAiModel::from_env() {
        Ok(model) => {
            info!("registered openai model");
            models.insert("openai".to_string(), Arc::new(model));
        }
        Err(_) => info!("openai model not available (OPENAI_API_KEY not set)"),
    }
    for (name, model) in models {
        runner = runner.with_model(name, model);
    }
    Ok(runner)
}

fn print_outcome(outcome: &flowengine_core::runner::RunOutcome) {
    println!("{} {}", "run id:".cyan().bold(), outcome.run_id);
    if outcome.failed_steps.is_empty() {
        println!("{}", "status: completed".green().bold());
    } else {
        println!("{} {:?}", "status: failed steps".red().bold(), outcome.failed_steps);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.outputs).unwrap_or_else(|_| format!("{:?}", outcome.outputs))
    );
}

fn validate_workflow(file_path: &str) -> Result<()> {
    let workflow = load_workflow(file_path)?;
    println!("{}", "workflow is valid".green().bold());
    println!("  name: {}", workflow.name);
    println!("  steps: {}", workflow.steps.len());
    Ok(())
}

/// Returns `true` if the run finished with one or more failed steps.
async fn run_workflow(file_path: &str, inputs: &[String], db: &str, max_concurrency: Option<usize>) -> Result<bool> {
    let mut workflow = load_workflow(file_path)?;
    if let Some(limit) = max_concurrency {
        workflow.concurrency = Some(limit);
    }
    let workflow_name = workflow.name.clone();

    let inputs_value = parse_inputs(inputs)?;
    let secrets = load_secrets().await?;

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::connect(db).await.context("failed to open state store")?);
    let observer = Arc::new(StateStoreObserver::new(Arc::clone(&store), workflow_name));

    let run_id = Uuid::new_v4();
    observer.record_run_start(run_id, &inputs_value).await.context("failed to record run start")?;

    let runner = build_runner(workflow)?.with_observer(observer as Arc<dyn RunObserver>).with_secrets(&secrets);

    println!("{} {}", "running workflow:".cyan().bold(), file_path);
    let outcome = Arc::new(runner)
        .resume(run_id, inputs_value, secrets, Value::Object(env_as_json()), Vec::new())
        .await
        .context("workflow execution failed")?;

    let failed = !outcome.failed_steps.is_empty();
    print_outcome(&outcome);
    Ok(failed)
}

async fn resume_workflow(file_path: &str, run_id: Uuid, db: &str) -> Result<bool> {
    let workflow = load_workflow(file_path)?;
    let secrets = load_secrets().await?;

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::connect(db).await.context("failed to open state store")?);
    let run = store.get_run(run_id).await.with_context(|| format!("no such run: {run_id}"))?;

    // Iteration rows are keyed by the same step_id as their foreach parent; only the
    // parent (iteration_index IS NULL) participates in the scheduler's per-step
    // status, so iteration rows are read separately, on demand, below.
    let executions = store.list_step_executions(run_id).await.context("failed to load step executions")?;
    let mut completed: Vec<(String, StepContext, SchedulerStepStatus)> = Vec::new();
    for exec in executions.into_iter().filter(|e| e.iteration_index.is_none()) {
        let status = match exec.status {
            StoreStepStatus::Completed => SchedulerStepStatus::Completed,
            StoreStepStatus::Failed => SchedulerStepStatus::Failed,
            StoreStepStatus::Skipped => SchedulerStepStatus::Skipped,
            // Suspended/pending/running: a plain step is re-dispatched from scratch
            // (re-entering a suspended step needs its stored message history, which
            // isn't carried by this row shape yet); a foreach parent whose iterations
            // have all since settled is promoted to completed in memory only -- the
            // row itself is never written back (hydration is a read-time derivation).
            StoreStepStatus::Suspended | StoreStepStatus::Pending | StoreStepStatus::Running => {
                match hydrate_foreach_parent(&store, run_id, &exec).await? {
                    Some(ctx) => {
                        completed.push((exec.step_id.clone(), ctx, SchedulerStepStatus::Completed));
                    }
                    None => {}
                }
                continue;
            }
        };
        let ctx = StepContext {
            output: exec.output.unwrap_or(Value::Null),
            outputs: exec.outputs.unwrap_or(Value::Null),
            status: exec.status.as_str().to_string(),
            error: exec.error,
            items: None,
        };
        completed.push((exec.step_id, ctx, status));
    }

    if completed.is_empty() {
        warn!(%run_id, "no completed steps found to hydrate; resuming from a clean slate");
    }

    let observer = Arc::new(StateStoreObserver::new(Arc::clone(&store), run.workflow_name.clone()));
    let runner = build_runner(workflow)?.with_observer(observer as Arc<dyn RunObserver>).with_secrets(&secrets);

    println!("{} {run_id}", "resuming run:".cyan().bold());
    let outcome = Arc::new(runner)
        .resume(run_id, run.inputs, secrets, Value::Object(env_as_json()), completed)
        .await
        .context("workflow resume failed")?;

    let failed = !outcome.failed_steps.is_empty();
    print_outcome(&outcome);
    Ok(failed)
}

/// Derives a foreach parent's status from its iteration rows when the parent row
/// itself is still `running`/`pending` (spec hydration contract): if every expected
/// iteration has settled to `success`/`skipped`, returns a reconstructed parent
/// `StepContext`; otherwise `None`, leaving the step to re-dispatch from scratch.
/// Never writes the promotion back -- the DB row is left exactly as it was.
async fn hydrate_foreach_parent(store: &Arc<dyn StateStore>, run_id: Uuid, main: &StepExecution) -> Result<Option<StepContext>> {
    let expected = main
        .output
        .as_ref()
        .and_then(|o| o.get("__foreachItems"))
        .and_then(|v| v.as_array())
        .map(|items| items.len());
    let Some(expected) = expected else {
        return Ok(None);
    };
    if expected == 0 {
        return Ok(Some(StepContext {
            output: Value::Array(Vec::new()),
            outputs: serde_json::json!({ "item_count": 0, "failed_count": 0 }),
            status: "success".to_string(),
            error: None,
            items: Some(Vec::new()),
        }));
    }

    let large_fanout = expected > flowengine_core::foreach::LARGE_FANOUT_THRESHOLD;
    let iterations = store
        .get_step_iterations(run_id, &main.step_id, !large_fanout)
        .await
        .context("failed to load foreach iterations")?;

    if iterations.len() < expected || !iterations.iter().all(|it| matches!(it.status, StoreStepStatus::Completed | StoreStepStatus::Skipped)) {
        return Ok(None);
    }

    if large_fanout {
        return Ok(Some(StepContext {
            output: Value::Array(Vec::new()),
            outputs: serde_json::json!({}),
            status: "success".to_string(),
            error: None,
            items: None,
        }));
    }

    let outputs: Vec<Value> = iterations.iter().map(|it| it.output.clone().unwrap_or(Value::Null)).collect();
    let items: Vec<StepContext> = iterations
        .iter()
        .map(|it| StepContext {
            output: it.output.clone().unwrap_or(Value::Null),
            outputs: it.outputs.clone().unwrap_or(Value::Null),
            status: it.status.as_str().to_string(),
            error: it.error.clone(),
            items: None,
        })
        .collect();
    Ok(Some(StepContext {
        output: Value::Array(outputs),
        outputs: serde_json::json!({ "item_count": iterations.len(), "failed_count": 0 }),
        status: "success".to_string(),
        error: None,
        items: Some(items),
    }))
}

async fn deliver_event(run_id: Uuid, name: &str, data: Option<&str>, db: &str) -> Result<()> {
    let payload: Value = match data {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        None => Value::Null,
    };
    let store = SqliteStateStore::connect(db).await.context("failed to open state store")?;
    let suspension = store
        .resolve_suspension(run_id, name, payload)
        .await
        .with_context(|| format!("no pending suspension for event {name:?} on run {run_id}"))?;
    println!(
        "{} step {:?} resumed by event {:?}",
        "delivered:".green().bold(),
        suspension.step_id,
        name
    );
    Ok(())
}

fn env_as_json() -> serde_json::Map<String, Value> {
    std::env::vars().map(|(k, v)| (k, Value::String(v))).collect()
}
