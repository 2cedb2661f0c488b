// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The `StateStore` trait: the durable side of a run, abstracted over the backend so
//! tests can swap in an in-memory fake without touching a real database file.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{EventRecord, MemoryRecord, RunStatus, StepExecution, StepStatus, SuspensionRecord, WorkflowRun};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("no run found with id {0}")]
    RunNotFound(Uuid),
    #[error("no pending suspension for step {step_id} in run {run_id}")]
    SuspensionNotFound { run_id: Uuid, step_id: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_run(&self, run_id: Uuid, workflow_name: &str, inputs: Value) -> Result<()>;
    async fn complete_run(&self, run_id: Uuid, status: RunStatus, outputs: Option<Value>) -> Result<()>;
    async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun>;

    /// `iteration_index` is `Some` for a foreach fan-out child, `None` for a
    /// top-level step or the foreach parent row itself. `attempt` starts at 1.
    async fn start_step(&self, run_id: Uuid, step_id: &str, iteration_index: Option<i64>, attempt: i64) -> Result<Uuid>;

    /// Records a step's terminal outcome. Only accepts a terminal [`StepStatus`]
    /// (`Completed`/`Failed`/`Skipped`/`Suspended`) -- call sites that only have a
    /// transient update belong on [`StateStore::mark_transient`] instead, so a
    /// production path can never accidentally persist a non-terminal status here.
    async fn complete_step(
        &self,
        exec_id: Uuid,
        status: StepStatus,
        output: Option<Value>,
        outputs: Option<Value>,
        error: Option<String>,
        iteration_count: Option<i64>,
        usage: Option<Value>,
    ) -> Result<()>;

    /// Accepted pseudo-update used only by crash-simulation tests: records that a
    /// step reached some non-terminal status without closing out its row. Kept
    /// separate from `complete_step` so a real call site can't pass `Running` there.
    async fn mark_transient(&self, exec_id: Uuid, status: StepStatus) -> Result<()>;

    /// Stashes a foreach step's fan-out size as a hydration hint on its parent row,
    /// without touching `status` -- the promotion described in the hydration contract
    /// reads this, but writing it is never itself a status transition.
    async fn record_foreach_items(&self, exec_id: Uuid, items: &Value) -> Result<()>;

    async fn list_step_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>>;

    /// The foreach parent row for `step_id` in `run_id` (`iteration_index IS NULL`),
    /// or `None` if the step hasn't been dispatched yet.
    async fn get_main_step(&self, run_id: Uuid, step_id: &str) -> Result<Option<StepExecution>>;

    /// Every fan-out child row for `step_id`, ordered by `iteration_index`. When
    /// `include_output` is `false`, `output`/`outputs` are stripped from the returned
    /// rows -- callers that only need status (e.g. the >500 large-foreach guard)
    /// shouldn't pay to deserialize potentially large per-iteration payloads.
    async fn get_step_iterations(&self, run_id: Uuid, step_id: &str, include_output: bool) -> Result<Vec<StepExecution>>;

    /// A cheap `COUNT(*)` over `step_id`'s iteration rows, for the large-foreach
    /// threshold check without materializing every row.
    async fn count_step_iterations(&self, run_id: Uuid, step_id: &str) -> Result<i64>;

    async fn record_event(&self, run_id: Uuid, name: &str, data: Value) -> Result<Uuid>;
    async fn list_events(&self, run_id: Uuid) -> Result<Vec<EventRecord>>;

    async fn create_suspension(&self, run_id: Uuid, step_id: &str, event_name: &str) -> Result<Uuid>;
    async fn resolve_suspension(&self, run_id: Uuid, event_name: &str, data: Value) -> Result<SuspensionRecord>;
    async fn pending_suspensions(&self, run_id: Uuid) -> Result<Vec<SuspensionRecord>>;

    async fn upsert_memory(&self, run_id: Uuid, text: &str, embedding: Value, metadata: Value) -> Result<Uuid>;
    async fn list_memory(&self, run_id: Uuid) -> Result<Vec<MemoryRecord>>;
}
