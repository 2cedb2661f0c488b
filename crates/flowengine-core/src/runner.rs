// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The top-level orchestrator (spec §5): drains a workflow's DAG through the
//! scheduler, dispatching each runnable step onto a [`tokio::task::JoinSet`] and
//! feeding completions back until the run drains or every step reaches a terminal
//! status.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::exec::dynamic::{DynamicHandler, DynamicHandlerRegistry};
use crate::exec::llm::ToolDispatch;
use crate::exec::memory::{InMemoryBackend, MemoryBackend};
use crate::exec::{self, StepExecOutcome};
use crate::expr::{self, EvalContext, StepContext};
use crate::foreach;
use crate::mcp::McpClient;
use crate::pool::ResourcePoolManager;
use crate::providers::{LanguageModel, ToolSchema};
use crate::recovery;
use crate::redact::Redactor;
use crate::resilience::with_timeout;
use crate::scheduler::{Scheduler, StepStatus};
use crate::workflow::{Step, StepConfig, Workflow};

/// Observes run/step lifecycle transitions. A durable state store implements this to
/// persist every transition; a run without persistence just keeps the no-op defaults.
#[async_trait]
pub trait RunObserver: Send + Sync {
    /// `iteration_index` is `Some` for a foreach fan-out child, `None` for a
    /// top-level step (or a foreach parent itself).
    async fn on_step_started(&self, _run_id: Uuid, _step_id: &str, _iteration_index: Option<i64>) {}

    /// Fired once a foreach step's iterable has been evaluated, before any iteration
    /// runs -- lets an observer record the fan-out size as a hydration hint.
    async fn on_foreach_started(&self, _run_id: Uuid, _step_id: &str, _items: &[Value]) {}

    async fn on_step_completed(&self, _run_id: Uuid, _step_id: &str, _ctx: &StepContext, _iteration_index: Option<i64>) {}

    async fn on_run_completed(&self, _run_id: Uuid, _outputs: &Value, _failed: bool) {}
}

struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {}

/// What a completed run produced.
pub struct RunOutcome {
    pub run_id: Uuid,
    pub outputs: HashMap<String, Value>,
    pub failed_steps: Vec<String>,
}

/// Assembles everything a run needs -- registered models, declared pools, dynamic
/// handlers, a memory backend, sub-workflow definitions -- and drives one workflow
/// through to completion.
pub struct Runner {
    workflow: Workflow,
    models: HashMap<String, Arc<dyn LanguageModel>>,
    sub_workflows: HashMap<String, Workflow>,
    pools: Arc<ResourcePoolManager>,
    dynamic_handlers: DynamicHandlerRegistry,
    memory_backend: Arc<dyn MemoryBackend>,
    observer: Arc<dyn RunObserver>,
    secrets_for_redaction: Vec<String>,
    config: EngineConfig,
    mcp_clients: HashMap<String, Arc<tokio::sync::Mutex<Box<dyn McpClient>>>>,
}

impl Runner {
    pub fn new(workflow: Workflow) -> Result<Self> {
        Self::with_config(workflow, EngineConfig::default())
    }

    /// Builds a runner with an explicit [`EngineConfig`] rather than the defaults --
    /// the pool-capacity/denylist/timeout equivalent of `Runner::new`.
    pub fn with_config(workflow: Workflow, config: EngineConfig) -> Result<Self> {
        workflow.validate()?;
        let pools = Arc::new(ResourcePoolManager::new());
        // Workflow-declared pools win; config-level capacities only fill in pools the
        // workflow references (via a step's `pool`) but never declares itself.
        for (name, capacity) in &workflow.pools {
            pools.declare(name, *capacity);
        }
        for (name, capacity) in &config.pool_capacities {
            pools.declare(name, *capacity);
        }
        Ok(Self {
            workflow,
            models: HashMap::new(),
            sub_workflows: HashMap::new(),
            pools,
            dynamic_handlers: DynamicHandlerRegistry::new(),
            memory_backend: Arc::new(InMemoryBackend::new()),
            observer: Arc::new(NoopObserver),
            secrets_for_redaction: Vec::new(),
            config,
            mcp_clients: HashMap::new(),
        })
    }

    pub fn with_model(mut self, name: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        self.models.insert(name.into(), model);
        self
    }

    /// Registers an MCP server under `name`, matching `llm` steps' `mcp_servers`
    /// entries. The client is locked around each `list_tools`/`call_tool` round
    /// trip since `McpClient`'s methods take `&mut self` but several concurrent
    /// steps may reference the same server.
    pub fn with_mcp_client(mut self, name: impl Into<String>, client: Box<dyn McpClient>) -> Self {
        self.mcp_clients.insert(name.into(), Arc::new(tokio::sync::Mutex::new(client)));
        self
    }

    pub fn with_sub_workflow(mut self, name: impl Into<String>, workflow: Workflow) -> Self {
        self.sub_workflows.insert(name.into(), workflow);
        self
    }

    pub fn with_dynamic_handler(mut self, name: impl Into<String>, handler: Arc<dyn DynamicHandler>) -> Self {
        self.dynamic_handlers.register(name, handler);
        self
    }

    pub fn with_memory_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.memory_backend = backend;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Registers every string leaf of `secrets` as a redaction needle for shell-step
    /// output (spec §4.5 "the set of secret values currently in scope").
    pub fn with_secrets(mut self, secrets: &Value) -> Self {
        collect_secret_strings(secrets, &mut self.secrets_for_redaction);
        self
    }

    pub async fn run(self: Arc<Self>, inputs: Value, secrets: Value, env: Value) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        self.run_inner(run_id, inputs, secrets, env, Vec::new()).await
    }

    /// Resumes a previously-started run: `run_id` is the id the caller already
    /// created a durable record under, and `completed` is every step the state
    /// store recorded as having reached [`StepStatus::Completed`] or
    /// [`StepStatus::Failed`] before the crash -- those steps are seeded as already
    /// terminal and never re-dispatched (spec "resumability": "causes no completed
    /// step to re-execute").
    ///
    /// Steps left `Suspended` or mid-flight at crash time are not covered here and
    /// simply re-run from scratch; re-entering a suspended step with its stored
    /// messages is a per-step-executor concern, not the scheduler's.
    pub async fn resume(
        self: Arc<Self>,
        run_id: Uuid,
        inputs: Value,
        secrets: Value,
        env: Value,
        completed: Vec<(String, StepContext, StepStatus)>,
    ) -> Result<RunOutcome> {
        info!(%run_id, workflow = %self.workflow.name, resumed = completed.len(), "resuming run");
        self.run_inner(run_id, inputs, secrets, env, completed).await
    }

    async fn run_inner(
        self: Arc<Self>,
        run_id: Uuid,
        inputs: Value,
        secrets: Value,
        env: Value,
        completed: Vec<(String, StepContext, StepStatus)>,
    ) -> Result<RunOutcome> {
        info!(%run_id, workflow = %self.workflow.name, "starting run");
        let scheduler = Arc::new(Scheduler::new(&self.workflow)?);
        let ctx = ExecutionContext::new(inputs, secrets, env);
        let cancel = CancellationToken::new();

        for (step_id, step_ctx, status) in completed {
            scheduler.seed_terminal(&step_id, status);
            ctx.record_step(step_id, step_ctx);
        }

        let permits = self.workflow.concurrency.unwrap_or(usize::MAX).min(tokio::sync::Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(permits));

        let mut join_set = tokio::task::JoinSet::new();
        let mut in_flight = 0usize;

        loop {
            for step_id in scheduler.take_runnable() {
                let Some(step) = self.workflow.step(&step_id).cloned() else {
                    continue;
                };
                let runner = Arc::clone(&self);
                let ctx = Arc::clone(&ctx);
                let cancel = cancel.clone();
                let semaphore = Arc::clone(&semaphore);
                self.observer.on_step_started(run_id, &step_id, None).await;
                in_flight += 1;
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let result = runner.execute_step(run_id, &ctx, &step, None, None, &cancel).await;
                    (step_id, result)
                });
            }

            if in_flight == 0 {
                break;
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            in_flight -= 1;
            let (step_id, result) = joined.map_err(|e| EngineError::Resource(format!("step task panicked: {e}")))?;

            match result {
                Ok(step_ctx) => {
                    self.observer.on_step_completed(run_id, &step_id, &step_ctx, None).await;
                    // A suspended step is neither complete nor failed: it must keep
                    // blocking its dependents until an external event resumes it, not
                    // release them against a null output.
                    let suspended = step_ctx.status.starts_with("suspended");
                    let failed = step_ctx.status == "failed";
                    ctx.record_step(step_id.clone(), step_ctx);
                    if suspended {
                        scheduler.mark_suspended(&step_id);
                    } else if failed {
                        scheduler.mark_failed(&step_id);
                    } else {
                        scheduler.mark_complete(&step_id);
                    }
                }
                Err(err) => {
                    error!(%run_id, step = %step_id, error = %err, "step failed");
                    ctx.record_step(
                        step_id.clone(),
                        StepContext {
                            output: Value::Null,
                            outputs: Value::Null,
                            status: "failed".to_string(),
                            error: Some(err.to_string()),
                            items: None,
                        },
                    );
                    scheduler.mark_failed(&step_id);
                }
            }
        }

        let outputs = self.evaluate_outputs(&ctx)?;
        let failed_steps = scheduler.failures();
        self.observer
            .on_run_completed(
                run_id,
                &Value::Object(outputs.clone().into_iter().collect()),
                !failed_steps.is_empty(),
            )
            .await;
        if !failed_steps.is_empty() {
            warn!(%run_id, failed = ?failed_steps, "run finished with failures");
        }

        Ok(RunOutcome {
            run_id,
            outputs,
            failed_steps,
        })
    }

    fn evaluate_outputs(&self, ctx: &ExecutionContext) -> Result<HashMap<String, Value>> {
        let eval_ctx = ctx.eval_context(None, None);
        let mut outputs = HashMap::with_capacity(self.workflow.outputs.len());
        for (name, expr_src) in &self.workflow.outputs {
            outputs.insert(name.clone(), expr::evaluate(expr_src, &eval_ctx)?);
        }
        Ok(outputs)
    }

    /// Runs one step (or, recursively, one foreach iteration of it) to a terminal
    /// [`StepContext`]. Boxed because foreach iterations recurse back into this
    /// method.
    fn execute_step<'a>(
        self: &'a Arc<Self>,
        run_id: Uuid,
        ctx: &'a Arc<ExecutionContext>,
        step: &'a Step,
        item: Option<Value>,
        index: Option<i64>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<StepContext>> {
        Box::pin(async move {
            let eval_ctx = ctx.eval_context(item, index);

            if let Some(if_expr) = &step.if_expr {
                let cond = expr::evaluate(if_expr, &eval_ctx)?;
                if !expr::truthy(&cond) {
                    debug!(step = %step.id, "skipped by if condition");
                    return Ok(StepContext {
                        output: Value::Null,
                        outputs: Value::Null,
                        status: "skipped".to_string(),
                        error: None,
                        items: None,
                    });
                }
            }

            if let Some(foreach_expr) = &step.foreach {
                let iterable = expr::evaluate(foreach_expr, &eval_ctx)?;
                let items = iterable.as_array().cloned().ok_or_else(|| EngineError::Schema {
                    step_id: Some(step.id.clone()),
                    message: "foreach expression did not evaluate to an array".to_string(),
                })?;
                self.observer.on_foreach_started(run_id, &step.id, &items).await;
                let child = step.as_iteration();
                let concurrency = step.concurrency.unwrap_or_else(|| items.len().max(1));
                let outcome = foreach::run_foreach(items, concurrency, |i, item_value| {
                    let runner = Arc::clone(self);
                    let ctx = Arc::clone(ctx);
                    let child = child.clone();
                    let cancel = cancel.clone();
                    async move {
                        runner.observer.on_step_started(run_id, &child.id, Some(i as i64)).await;
                        let result = runner
                            .execute_step(run_id, &ctx, &child, Some(item_value), Some(i as i64), &cancel)
                            .await
                            .unwrap_or_else(|e| StepContext {
                                output: Value::Null,
                                outputs: Value::Null,
                                status: "failed".to_string(),
                                error: Some(e.to_string()),
                                items: None,
                            });
                        runner.observer.on_step_completed(run_id, &child.id, &result, Some(i as i64)).await;
                        result
                    }
                })
                .await;
                return Ok(outcome.parent);
            }

            self.run_single(run_id, step, &eval_ctx, cancel).await
        })
    }

    async fn run_single(
        self: &Arc<Self>,
        run_id: Uuid,
        step: &Step,
        eval_ctx: &EvalContext,
        cancel: &CancellationToken,
    ) -> Result<StepContext> {
        let _permit = match &step.pool {
            Some(pool_name) => Some(self.pools.acquire(pool_name, 0, cancel).await?),
            None => None,
        };

        match self.dispatch_with_recovery(run_id, step, eval_ctx, cancel).await {
            Ok(StepExecOutcome::Completed(outcome)) => {
                if let Some(schema) = &step.output_schema {
                    if let Err(err) = crate::schema::validate(&step.id, schema, &outcome.output) {
                        return Ok(StepContext {
                            output: Value::Null,
                            outputs: Value::Null,
                            status: "failed".to_string(),
                            error: Some(err.to_string()),
                            items: None,
                        });
                    }
                }
                Ok(StepContext {
                    output: outcome.output,
                    outputs: outcome.outputs,
                    status: "success".to_string(),
                    error: None,
                    items: None,
                })
            }
            Ok(StepExecOutcome::Suspended { event_name, payload }) => Ok(StepContext {
                output: payload,
                outputs: Value::Null,
                status: format!("suspended:{event_name}"),
                error: None,
                items: None,
            }),
            Err(err) => Ok(StepContext {
                output: Value::Null,
                outputs: Value::Null,
                status: "failed".to_string(),
                error: Some(err.to_string()),
                items: None,
            }),
        }
    }

    /// Applies whichever recovery wrapper the step declares, checked in the same
    /// precedence failures escalate through (`retry` -> `reflexion` -> `auto_heal` ->
    /// `qualityGate`, spec §4.9) rather than composing all four -- a step naming more
    /// than one is an unusual configuration, and nesting all four (with `qualityGate`
    /// also reviewing a successful result from another wrapper) is not implemented; see
    /// DESIGN.md.
    async fn dispatch_with_recovery(
        self: &Arc<Self>,
        run_id: Uuid,
        step: &Step,
        eval_ctx: &EvalContext,
        cancel: &CancellationToken,
    ) -> Result<StepExecOutcome> {
        if let Some(policy) = &step.retry {
            return recovery::run_retry(policy, cancel, |_attempt| self.dispatch_timed(run_id, step, eval_ctx)).await;
        }
        if let Some(policy) = &step.reflexion {
            let model = self.default_model(&step.id)?;
            let config = serde_json::to_value(&step.config)?;
            return recovery::run_reflexion(policy, model.as_ref(), &step.id, config, |patched| {
                self.dispatch_timed_with_patch(run_id, step, eval_ctx, patched)
            })
            .await;
        }
        if let Some(policy) = &step.auto_heal {
            let model = self.agent_model(&policy.agent)?;
            return recovery::run_auto_heal(policy, model.as_ref(), &step.id, || {
                self.dispatch_timed(run_id, step, eval_ctx)
            })
            .await;
        }
        if let Some(policy) = &step.quality_gate {
            let model = self.agent_model(&policy.reviewer_agent)?;
            return recovery::run_quality_gate(policy, model.as_ref(), &step.id, || {
                self.dispatch_timed(run_id, step, eval_ctx)
            })
            .await;
        }
        self.dispatch_timed(run_id, step, eval_ctx).await
    }

    async fn dispatch_timed(self: &Arc<Self>, run_id: Uuid, step: &Step, eval_ctx: &EvalContext) -> Result<StepExecOutcome> {
        let fut = self.dispatch_inner(run_id, step, eval_ctx);
        let timeout = step.timeout_ms.map(Duration::from_millis).or(self.config.default_step_timeout);
        match timeout {
            Some(duration) => with_timeout(Some(&step.id), duration, fut).await,
            None => fut.await,
        }
    }

    /// Re-runs a step with `run`/`prompt`/`inputs` overridden by a reflexion patch
    /// (spec §4.9) -- `config` is the whitelisted-merged `StepConfig` value.
    async fn dispatch_timed_with_patch(
        self: &Arc<Self>,
        run_id: Uuid,
        step: &Step,
        eval_ctx: &EvalContext,
        config: Value,
    ) -> Result<StepExecOutcome> {
        let mut patched = step.clone();
        patched.config = serde_json::from_value(config)?;
        self.dispatch_timed(run_id, &patched, eval_ctx).await
    }

    async fn dispatch_inner(self: &Arc<Self>, run_id: Uuid, step: &Step, eval_ctx: &EvalContext) -> Result<StepExecOutcome> {
        debug!(%run_id, step = %step.id, step_type = ?step.step_type(), "dispatching step");
        let redactor = Redactor::new(self.secrets_for_redaction.clone());
        match &step.config {
            StepConfig::Shell(cfg) => {
                let rendered = expr::evaluate_string(&cfg.run, eval_ctx)?;
                exec::shell::execute(&step.id, cfg, &rendered, &redactor, &self.config.shell_denylist).await
            }
            StepConfig::Sleep(cfg) => exec::sleep::execute(cfg, &CancellationToken::new()).await,
            StepConfig::Human(cfg) => exec::human::execute(&step.id, cfg),
            StepConfig::Memory(cfg) => {
                let model = self.default_model(&step.id)?;
                exec::memory::execute(&step.id, cfg, model.as_ref(), self.memory_backend.as_ref()).await
            }
            StepConfig::Join(_) => exec::join::execute(),
            StepConfig::Dynamic(cfg) => exec::dynamic::execute(&step.id, cfg, &self.dynamic_handlers).await,
            StepConfig::Llm(cfg) => {
                let rendered = expr::evaluate_string(&cfg.prompt, eval_ctx)?;

                // Gather tool schemas from every MCP server this step names, tracking
                // which server owns each tool name so the dispatch closure below can
                // route a call back to the right client.
                let mut tools: Vec<ToolSchema> = Vec::new();
                let mut owners: HashMap<String, Arc<tokio::sync::Mutex<Box<dyn McpClient>>>> = HashMap::new();
                for server_name in &cfg.mcp_servers {
                    let Some(client) = self.mcp_clients.get(server_name) else {
                        return Err(EngineError::Config(format!("unknown mcp server: {server_name}")));
                    };
                    let listed = client
                        .lock()
                        .await
                        .list_tools()
                        .await
                        .map_err(|e| EngineError::step_execution(&step.id, e.to_string()))?;
                    for schema in listed {
                        if !cfg.tools.is_empty() && !cfg.tools.contains(&schema.name) {
                            continue;
                        }
                        owners.insert(schema.name.clone(), Arc::clone(client));
                        tools.push(schema);
                    }
                }

                let dispatch: Box<ToolDispatch<'_>> = Box::new(move |name, args| {
                    let client = owners.get(&name).cloned();
                    Box::pin(async move {
                        let Some(client) = client else {
                            return Err(EngineError::Config(format!("no MCP tool named \"{name}\" is registered")));
                        };
                        client
                            .lock()
                            .await
                            .call_tool(&name, args)
                            .await
                            .map_err(|e| EngineError::step_execution(name.as_str(), e.to_string()))
                    })
                });
                exec::llm::execute(
                    &step.id,
                    cfg,
                    rendered,
                    &self.models,
                    tools,
                    &*dispatch,
                    step.output_schema.as_ref(),
                    None,
                )
                .await
            }
            StepConfig::SubWorkflow(cfg) => {
                let mut rendered_inputs = HashMap::new();
                for (key, expr_src) in &cfg.inputs {
                    rendered_inputs.insert(key.clone(), expr::evaluate(expr_src, eval_ctx)?);
                }
                let child_workflow = self
                    .sub_workflows
                    .get(&cfg.workflow)
                    .cloned()
                    .ok_or_else(|| EngineError::Config(format!("unknown sub-workflow: {}", cfg.workflow)))?;
                let observer = Arc::clone(&self.observer);
                let config = self.config.clone();
                exec::sub_workflow::execute(&step.id, cfg, rendered_inputs, move |_name, inputs| {
                    Box::pin(async move {
                        let child_runner = Arc::new(Runner::with_config(child_workflow, config)?.with_observer(observer));
                        let outcome = child_runner
                            .run(Value::Object(inputs.into_iter().collect()), Value::Null, Value::Null)
                            .await?;
                        if !outcome.failed_steps.is_empty() {
                            return Err(EngineError::step_execution(
                                "sub_workflow",
                                format!("child run {} had failed steps: {:?}", outcome.run_id, outcome.failed_steps),
                            ));
                        }
                        Ok(outcome.outputs)
                    })
                })
                .await
            }
        }
    }

    fn default_model(&self, step_id: &str) -> Result<Arc<dyn LanguageModel>> {
        self.models
            .values()
            .next()
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("no model registered, needed by step {step_id}")))
    }

    fn agent_model(&self, name: &str) -> Result<Arc<dyn LanguageModel>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown agent: {name}")))
    }
}

fn collect_secret_strings(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.len() >= 3 => out.push(s.clone()),
        Value::Object(map) => {
            for v in map.values() {
                collect_secret_strings(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_secret_strings(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{JoinStepConfig, ShellStepConfig, StepConfig};
    use std::collections::HashMap as Map;

    fn shell_step(id: &str, run: &str, needs: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            config: StepConfig::Shell(ShellStepConfig {
                run: run.to_string(),
                env: Map::new(),
                max_output_bytes: None,
            }),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            if_expr: None,
            foreach: None,
            concurrency: None,
            pool: None,
            retry: None,
            reflexion: None,
            auto_heal: None,
            quality_gate: None,
            input_schema: None,
            output_schema: None,
            timeout_ms: None,
        }
    }

    fn join_step(id: &str, needs: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            config: StepConfig::Join(JoinStepConfig::default()),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            if_expr: None,
            foreach: None,
            concurrency: None,
            pool: None,
            retry: None,
            reflexion: None,
            auto_heal: None,
            quality_gate: None,
            input_schema: None,
            output_schema: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn runs_a_linear_workflow_to_completion() {
        let wf = Workflow {
            name: "t".into(),
            steps: vec![shell_step("a", "echo hi", &[]), join_step("b", &["a"])],
            inputs_schema: None,
            outputs: Map::new(),
            concurrency: None,
            pools: Map::new(),
        };
        let runner = Arc::new(Runner::new(wf).unwrap());
        let outcome = runner.run(Value::Null, Value::Null, Value::Null).await.unwrap();
        assert!(outcome.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn a_failing_step_skips_its_dependent() {
        let wf = Workflow {
            name: "t".into(),
            steps: vec![shell_step("a", "exit 1", &[]), join_step("b", &["a"])],
            inputs_schema: None,
            outputs: Map::new(),
            concurrency: None,
            pools: Map::new(),
        };
        let runner = Arc::new(Runner::new(wf).unwrap());
        let outcome = runner.run(Value::Null, Value::Null, Value::Null).await.unwrap();
        assert_eq!(outcome.failed_steps, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn if_condition_skips_a_step() {
        let mut step = shell_step("a", "echo hi", &[]);
        step.if_expr = Some("${{ false }}".to_string());
        let wf = Workflow {
            name: "t".into(),
            steps: vec![step],
            inputs_schema: None,
            outputs: Map::new(),
            concurrency: None,
            pools: Map::new(),
        };
        let runner = Arc::new(Runner::new(wf).unwrap());
        let outcome = runner.run(Value::Null, Value::Null, Value::Null).await.unwrap();
        assert!(outcome.failed_steps.is_empty());
    }

    #[tokio::test]
    async fn evaluates_workflow_level_outputs() {
        let wf = Workflow {
            name: "t".into(),
            steps: vec![shell_step("a", "echo hi", &[])],
            inputs_schema: None,
            outputs: Map::from([("greeting".to_string(), "${{ steps.a.output.stdout }}".to_string())]),
            concurrency: None,
            pools: Map::new(),
        };
        let runner = Arc::new(Runner::new(wf).unwrap());
        let outcome = runner.run(Value::Null, Value::Null, Value::Null).await.unwrap();
        assert_eq!(outcome.outputs["greeting"], Value::String("hi\n".to_string()));
    }

    #[tokio::test]
    async fn resume_skips_already_completed_steps() {
        // "a" would fail if it actually ran again; resume must skip it entirely and
        // only dispatch "b".
        let wf = Workflow {
            name: "t".into(),
            steps: vec![shell_step("a", "exit 1", &[]), join_step("b", &["a"])],
            inputs_schema: None,
            outputs: Map::new(),
            concurrency: None,
            pools: Map::new(),
        };
        let runner = Arc::new(Runner::new(wf).unwrap());
        let run_id = Uuid::new_v4();
        let completed = vec![(
            "a".to_string(),
            StepContext {
                output: Value::Null,
                outputs: Value::Null,
                status: "completed".to_string(),
                error: None,
                items: None,
            },
            crate::scheduler::StepStatus::Completed,
        )];
        let outcome = runner
            .resume(run_id, Value::Null, Value::Null, Value::Null, completed)
            .await
            .unwrap();
        assert_eq!(outcome.run_id, run_id);
        assert!(outcome.failed_steps.is_empty());
    }
}
