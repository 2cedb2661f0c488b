// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `dynamic` step execution: dispatches to a user-registered [`DynamicHandler`] by
//! name, resolving the "what does `StepType::Dynamic` actually run?" open question
//! (spec §3) as a small plugin registry rather than a built-in behavior.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{StepExecOutcome, StepOutcome};
use crate::error::EngineError;
use crate::workflow::DynamicStepConfig;

#[async_trait]
pub trait DynamicHandler: Send + Sync {
    async fn handle(&self, step_id: &str, params: Value) -> Result<Value, EngineError>;
}

#[derive(Default, Clone)]
pub struct DynamicHandlerRegistry {
    handlers: HashMap<String, Arc<dyn DynamicHandler>>,
}

impl DynamicHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn DynamicHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynamicHandler>> {
        self.handlers.get(name).cloned()
    }
}

pub async fn execute(
    step_id: &str,
    config: &DynamicStepConfig,
    registry: &DynamicHandlerRegistry,
) -> Result<StepExecOutcome, EngineError> {
    let handler = registry
        .get(&config.handler)
        .ok_or_else(|| EngineError::Config(format!("no dynamic handler registered for \"{}\"", config.handler)))?;
    let output = handler.handle(step_id, config.params.clone()).await?;
    Ok(StepExecOutcome::Completed(StepOutcome::simple(output)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl DynamicHandler for Echo {
        async fn handle(&self, _step_id: &str, params: Value) -> Result<Value, EngineError> {
            Ok(params)
        }
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut registry = DynamicHandlerRegistry::new();
        registry.register("echo", Arc::new(Echo));
        let config = DynamicStepConfig {
            handler: "echo".into(),
            params: json!({"a": 1}),
        };
        let outcome = execute("s1", &config, &registry).await.unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output, json!({"a": 1}));
    }

    #[tokio::test]
    async fn unregistered_handler_errors() {
        let registry = DynamicHandlerRegistry::new();
        let config = DynamicStepConfig {
            handler: "missing".into(),
            params: Value::Null,
        };
        assert!(execute("s1", &config, &registry).await.is_err());
    }
}
