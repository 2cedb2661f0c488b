// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `sub_workflow` step execution: delegates to a nested run and remaps its outputs
//! into this step's output (spec §4.7).
//!
//! This module never calls [`crate::runner::Runner`] directly -- that would make
//! `exec` and `runner` mutually dependent on each other's concrete types. Instead the
//! caller (the runner, which already knows how to launch a run) passes in a `run_child`
//! callback.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;

use super::{StepExecOutcome, StepOutcome};
use crate::error::EngineError;
use crate::workflow::SubWorkflowStepConfig;

pub async fn execute<'a>(
    step_id: &str,
    config: &SubWorkflowStepConfig,
    rendered_inputs: HashMap<String, Value>,
    run_child: impl FnOnce(String, HashMap<String, Value>) -> BoxFuture<'a, Result<HashMap<String, Value>, EngineError>>,
) -> Result<StepExecOutcome, EngineError> {
    let child_outputs = run_child(config.workflow.clone(), rendered_inputs).await?;

    let mut mapped = serde_json::Map::new();
    for (parent_key, mapping) in &config.output_mapping {
        let value = child_outputs
            .get(&mapping.from)
            .cloned()
            .or_else(|| mapping.default.clone())
            .ok_or_else(|| {
                EngineError::step_execution(
                    step_id,
                    format!("sub-workflow output \"{}\" missing and no default given", mapping.from),
                )
            })?;
        mapped.insert(parent_key.clone(), value);
    }
    Ok(StepExecOutcome::Completed(StepOutcome::simple(Value::Object(mapped))))
}
