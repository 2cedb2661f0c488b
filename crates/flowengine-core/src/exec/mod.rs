// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-step-type executors (spec §4.7). Each submodule implements the single-iteration
//! "inner" behavior for one [`crate::workflow::StepType`]; the `if`/`foreach`/pool/
//! timeout/recovery preamble around them lives in [`crate::runner`], which is the only
//! caller that has all of the run-scoped machinery (context, pools, providers, MCP
//! clients, state store) in hand at once.

pub mod dynamic;
pub mod human;
pub mod join;
pub mod llm;
pub mod memory;
pub mod shell;
pub mod sleep;
pub mod sub_workflow;

use serde::Serialize;
use serde_json::Value;

/// What a step produced, in the shape recorded into [`crate::expr::StepContext`].
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub output: Value,
    pub outputs: Value,
}

impl StepOutcome {
    pub fn simple(output: Value) -> Self {
        Self {
            output,
            outputs: Value::Object(Default::default()),
        }
    }
}

/// A step either completes in one pass, or suspends waiting for an external event
/// (human-in-the-loop steps, spec §4.7). The quality-gate recovery wrapper reviews
/// whichever variant a step produces, so this needs to serialize too.
#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepExecOutcome {
    Completed(StepOutcome),
    /// `payload` carries whatever the suspending step wants back on resume -- a
    /// `human` step leaves it `null`; an `llm` step's `ask` built-in stores
    /// `{question, messages}` so resuming can re-inject the answer (spec §4.7).
    Suspended { event_name: String, payload: Value },
}
