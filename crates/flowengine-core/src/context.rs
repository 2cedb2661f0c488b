// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared run-scoped state that feeds the expression evaluator (spec §4.1).
//!
//! One [`ExecutionContext`] is built per run and handed to every step as it executes.
//! Step results are written in as steps complete, so later steps in the DAG see earlier
//! ones; concurrent writers are safe via [`DashMap`].

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::expr::{EvalContext, StepContext};

/// Run-scoped state: the fixed `inputs`/`secrets`/`env`, plus the growing `steps` map
/// and optional `memory` snapshot.
#[derive(Debug)]
pub struct ExecutionContext {
    inputs: Value,
    secrets: Value,
    env: Value,
    steps: DashMap<String, StepContext>,
    memory: parking_lot::RwLock<Value>,
}

impl ExecutionContext {
    pub fn new(inputs: Value, secrets: Value, env: Value) -> Arc<Self> {
        Arc::new(Self {
            inputs,
            secrets,
            env,
            steps: DashMap::new(),
            memory: parking_lot::RwLock::new(Value::Null),
        })
    }

    /// Records (or overwrites) a step's result. Called once a step (or foreach parent)
    /// reaches a terminal status.
    pub fn record_step(&self, step_id: impl Into<String>, ctx: StepContext) {
        self.steps.insert(step_id.into(), ctx);
    }

    pub fn step(&self, step_id: &str) -> Option<StepContext> {
        self.steps.get(step_id).map(|r| r.clone())
    }

    pub fn set_memory(&self, value: Value) {
        *self.memory.write() = value;
    }

    pub fn memory(&self) -> Value {
        self.memory.read().clone()
    }

    /// Builds the [`EvalContext`] a given step (or foreach iteration) evaluates
    /// its expressions against. `item`/`index` are only `Some` inside a foreach
    /// iteration (spec §4.8).
    pub fn eval_context(&self, item: Option<Value>, index: Option<i64>) -> EvalContext {
        let mut steps = std::collections::HashMap::with_capacity(self.steps.len());
        for entry in self.steps.iter() {
            steps.insert(entry.key().clone(), entry.value().clone());
        }
        EvalContext {
            inputs: self.inputs.clone(),
            secrets: self.secrets.clone(),
            env: self.env.clone(),
            steps,
            item,
            index,
            memory: self.memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_and_reads_back_step_results() {
        let ctx = ExecutionContext::new(json!({"a": 1}), json!({}), json!({}));
        ctx.record_step(
            "s1",
            StepContext {
                output: json!("ok"),
                outputs: json!({}),
                status: "success".into(),
                error: None,
                items: None,
            },
        );
        let eval = ctx.eval_context(None, None);
        assert_eq!(eval.steps["s1"].output, json!("ok"));
        assert_eq!(eval.inputs, json!({"a": 1}));
    }

    #[test]
    fn eval_context_carries_item_and_index_for_foreach() {
        let ctx = ExecutionContext::new(json!({}), json!({}), json!({}));
        let eval = ctx.eval_context(Some(json!("x")), Some(2));
        assert_eq!(eval.item, Some(json!("x")));
        assert_eq!(eval.index, Some(2));
    }
}
