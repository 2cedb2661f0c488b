// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! [`StateStoreObserver`]: the [`RunObserver`] implementation that makes a run
//! durable -- every step start/completion and the final run outcome get written
//! through to a [`StateStore`] as they happen, rather than buffered for a final
//! flush. A crash mid-run leaves the store holding exactly the steps that finished.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use flowengine_core::runner::RunObserver;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use crate::models::{RunStatus, StepStatus};
use crate::store::StateStore;

/// Bridges a live [`flowengine_core::runner::Runner`] to a durable [`StateStore`].
///
/// The `RunObserver` hooks are fire-and-forget from the runner's point of view, so
/// failures here are logged rather than propagated -- a storage hiccup must not take
/// down an in-flight run.
pub struct StateStoreObserver {
    store: Arc<dyn StateStore>,
    workflow_name: String,
    /// `(run_id, step_id, iteration_index) -> exec_id`, so `on_step_completed` can
    /// find the row `on_step_started` opened. The runner gives us no exec id of its
    /// own, and a foreach parent and its children share `step_id`, so the key must
    /// include `iteration_index` to tell them apart.
    open_steps: Mutex<HashMap<(Uuid, String, Option<i64>), Uuid>>,
}

impl StateStoreObserver {
    pub fn new(store: Arc<dyn StateStore>, workflow_name: impl Into<String>) -> Self {
        Self {
            store,
            workflow_name: workflow_name.into(),
            open_steps: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the `runs` row for `run_id` up front. The runner mints `run_id`
    /// itself inside `Runner::run`, so callers that want the very first event
    /// persisted should create it before driving the run and reuse the same id --
    /// see `flowengine-cli`'s `run` command.
    pub async fn record_run_start(&self, run_id: Uuid, inputs: &Value) -> crate::store::Result<()> {
        self.store.create_run(run_id, &self.workflow_name, inputs.clone()).await
    }
}

/// Maps a [`flowengine_core::expr::StepContext`]'s free-form `status` string onto the
/// durable [`StepStatus`] enum. `"suspended:<event>"` carries an event name suffix, so
/// it needs prefix matching rather than a plain parse.
fn map_status(status: &str) -> StepStatus {
    if status.starts_with("suspended") {
        StepStatus::Suspended
    } else if status == "failed" {
        StepStatus::Failed
    } else if status == "skipped" {
        StepStatus::Skipped
    } else {
        StepStatus::Completed
    }
}

#[async_trait]
impl RunObserver for StateStoreObserver {
    async fn on_step_started(&self, run_id: Uuid, step_id: &str, iteration_index: Option<i64>) {
        match self.store.start_step(run_id, step_id, iteration_index, 1).await {
            Ok(exec_id) => {
                self.open_steps.lock().insert((run_id, step_id.to_string(), iteration_index), exec_id);
            }
            Err(err) => error!(%run_id, step_id, %err, "failed to persist step start"),
        }
    }

    async fn on_foreach_started(&self, run_id: Uuid, step_id: &str, items: &[Value]) {
        let exec_id = self.open_steps.lock().get(&(run_id, step_id.to_string(), None)).copied();
        let Some(exec_id) = exec_id else {
            error!(%run_id, step_id, "foreach started with no matching start-step row");
            return;
        };
        if let Err(err) = self.store.record_foreach_items(exec_id, &Value::Array(items.to_vec())).await {
            error!(%run_id, step_id, %err, "failed to persist foreach fan-out size");
        }
    }

    async fn on_step_completed(
        &self,
        run_id: Uuid,
        step_id: &str,
        ctx: &flowengine_core::expr::StepContext,
        iteration_index: Option<i64>,
    ) {
        let exec_id = self.open_steps.lock().remove(&(run_id, step_id.to_string(), iteration_index));
        let Some(exec_id) = exec_id else {
            error!(%run_id, step_id, "step completed with no matching start-step row");
            return;
        };
        let status = map_status(&ctx.status);
        let iteration_count = ctx.items.as_ref().map(|items| items.len() as i64);
        let usage = ctx.output.get("tokens_used").map(|tokens| serde_json::json!({"tokens_used": tokens}));
        let result = self
            .store
            .complete_step(
                exec_id,
                status,
                Some(ctx.output.clone()),
                Some(ctx.outputs.clone()),
                ctx.error.clone(),
                iteration_count,
                usage,
            )
            .await;
        if let Err(err) = result {
            error!(%run_id, step_id, %err, "failed to persist step completion");
        }
    }

    async fn on_run_completed(&self, run_id: Uuid, outputs: &Value, failed: bool) {
        let status = if failed { RunStatus::Failed } else { RunStatus::Completed };
        if let Err(err) = self.store.complete_run(run_id, status, Some(outputs.clone())).await {
            error!(%run_id, %err, "failed to persist run completion");
        }
    }
}
