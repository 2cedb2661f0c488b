// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reflexion: on failure, asks a model for a whitelisted patch to the step's own
//! config and re-runs with the patch applied (spec §4.9).

use serde_json::Value;
use std::future::Future;

use super::apply_patch_whitelisted;
use crate::error::EngineError;
use crate::providers::{CompletionRequest, LanguageModel};
use crate::workflow::ReflexionPolicy;

fn build_prompt(step_id: &str, config: &Value, error: &EngineError, hint: Option<&str>) -> String {
    let mut prompt = format!(
        "Step \"{step_id}\" failed with: {error}\n\n\
         Current step config:\n{config}\n\n\
         Reply with a JSON object containing only the fields that should change \
         (only \"run\", \"prompt\", and \"inputs\" may be modified)."
    );
    if let Some(hint) = hint {
        prompt.push_str(&format!("\n\nHint: {hint}"));
    }
    prompt
}

/// Runs `op` against `config`, and on failure asks `model` for a patch to retry with,
/// up to `policy.limit` attempts total.
pub async fn run_reflexion<F, Fut, T>(
    policy: &ReflexionPolicy,
    model: &dyn LanguageModel,
    step_id: &str,
    mut config: Value,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(config.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.limit => return Err(err),
            Err(err) => {
                let prompt = build_prompt(step_id, &config, &err, policy.hint.as_deref());
                let response = model
                    .complete(CompletionRequest {
                        model: "reflexion".to_string(),
                        prompt,
                        system: None,
                        temperature: None,
                        max_tokens: None,
                        tools: Vec::new(),
                        extra: Default::default(),
                    })
                    .await
                    .map_err(|e| EngineError::step_execution(step_id, e.to_string()))?;
                let patch: Value = serde_json::from_str(response.text.trim()).unwrap_or(Value::Null);
                config = apply_patch_whitelisted(&config, &patch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionResponse, ProviderError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeModel {
        patch: Value,
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: self.patch.to_string(),
                model: "fake".into(),
                tokens_used: None,
                tool_calls: Vec::new(),
                metadata: Default::default(),
            })
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    #[tokio::test]
    async fn applies_model_patch_and_retries() {
        let model = FakeModel {
            patch: json!({"run": "echo fixed"}),
        };
        let policy = ReflexionPolicy { limit: 2, hint: None };
        let calls = AtomicU32::new(0);
        let result = run_reflexion(&policy, &model, "s1", json!({"id": "s1", "run": "echo broken"}), |config| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if config["run"] == json!("echo fixed") {
                    Ok(config)
                } else {
                    Err(EngineError::step_execution("s1", "broken"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap()["run"], json!("echo fixed"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
