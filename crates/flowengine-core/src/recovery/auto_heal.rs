// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Auto-heal: on failure, hands the error to a sibling "healer" agent to resolve
//! whatever external condition is blocking the step, then retries unchanged
//! (spec §4.9).

use std::future::Future;

use crate::error::EngineError;
use crate::providers::{CompletionRequest, LanguageModel};
use crate::workflow::AutoHealPolicy;

pub async fn run_auto_heal<F, Fut, T>(
    policy: &AutoHealPolicy,
    model: &dyn LanguageModel,
    step_id: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(err) => {
                let prompt = format!(
                    "Step \"{step_id}\" failed: {err}\n\n\
                     Diagnose and resolve any external blocking condition (missing \
                     resource, stale credential, unavailable dependency) so the step \
                     can be retried unchanged."
                );
                let _ = model
                    .complete(CompletionRequest {
                        model: policy.agent.clone(),
                        prompt,
                        system: None,
                        temperature: None,
                        max_tokens: None,
                        tools: Vec::new(),
                        extra: Default::default(),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionResponse, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeHealer;

    #[async_trait]
    impl LanguageModel for FakeHealer {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                text: "resolved".into(),
                model: "fake".into(),
                tokens_used: None,
                tool_calls: Vec::new(),
                metadata: Default::default(),
            })
        }

        fn name(&self) -> &str {
            "fake-healer"
        }
    }

    #[tokio::test]
    async fn retries_after_invoking_healer() {
        let policy = AutoHealPolicy {
            agent: "healer".into(),
            max_attempts: 3,
        };
        let calls = AtomicU32::new(0);
        let result: Result<&str, EngineError> = run_auto_heal(&policy, &FakeHealer, "s1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(EngineError::step_execution("s1", "disk full"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
