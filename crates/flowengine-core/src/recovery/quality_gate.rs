// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Quality gate: after a step succeeds, a reviewer agent inspects the output and may
//! force a re-drive before the result is accepted (spec §4.9).

use serde::Serialize;
use std::future::Future;

use crate::error::EngineError;
use crate::providers::{CompletionRequest, LanguageModel};
use crate::workflow::QualityGatePolicy;

fn approved(review_text: &str) -> bool {
    review_text.trim_start().to_ascii_uppercase().starts_with("APPROVE")
}

async fn review<T: Serialize>(
    model: &dyn LanguageModel,
    policy: &QualityGatePolicy,
    step_id: &str,
    output: &T,
) -> Result<bool, EngineError> {
    let serialized = serde_json::to_string_pretty(output).unwrap_or_default();
    let prompt = format!(
        "Review the output of step \"{step_id}\":\n{serialized}\n\n\
         Reply with \"APPROVE\" if it satisfies the step's intent, or \"REJECT\" \
         followed by the reason."
    );
    let response = model
        .complete(CompletionRequest {
            model: policy.reviewer_agent.clone(),
            prompt,
            system: None,
            temperature: None,
            max_tokens: None,
            tools: Vec::new(),
            extra: Default::default(),
        })
        .await
        .map_err(|e| EngineError::step_execution(step_id, e.to_string()))?;
    Ok(approved(&response.text))
}

/// Runs `op`, submits its output to the reviewer agent, and re-runs `op` (discarding
/// the rejected output) until the reviewer approves or `policy.max_attempts` is spent
/// -- whichever comes first. The last produced output is always what's returned.
pub async fn run_quality_gate<F, Fut, T>(
    policy: &QualityGatePolicy,
    model: &dyn LanguageModel,
    step_id: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
    T: Serialize,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = op().await?;
        if attempt >= policy.max_attempts || review(model, policy, step_id, &result).await? {
            return Ok(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionResponse, ProviderError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct ScriptedReviewer {
        replies: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedReviewer {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            let mut replies = self.replies.lock().unwrap();
            let text = if replies.is_empty() { "APPROVE" } else { replies.remove(0) };
            Ok(CompletionResponse {
                text: text.to_string(),
                model: "fake".into(),
                tokens_used: None,
                tool_calls: Vec::new(),
                metadata: Default::default(),
            })
        }

        fn name(&self) -> &str {
            "fake-reviewer"
        }
    }

    #[tokio::test]
    async fn redrives_until_approved() {
        let reviewer = ScriptedReviewer {
            replies: Mutex::new(vec!["REJECT needs more detail"]),
        };
        let policy = QualityGatePolicy {
            reviewer_agent: "reviewer".into(),
            max_attempts: 3,
        };
        let calls = AtomicU32::new(0);
        let result = run_quality_gate(&policy, &reviewer, "s1", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, EngineError>(format!("draft-{n}")) }
        })
        .await;
        assert_eq!(result.unwrap(), "draft-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_at_max_attempts_even_if_rejected() {
        let reviewer = ScriptedReviewer {
            replies: Mutex::new(vec!["REJECT", "REJECT"]),
        };
        let policy = QualityGatePolicy {
            reviewer_agent: "reviewer".into(),
            max_attempts: 1,
        };
        let result = run_quality_gate(&policy, &reviewer, "s1", || async { Ok::<_, EngineError>("only-try") }).await;
        assert_eq!(result.unwrap(), "only-try");
    }
}
