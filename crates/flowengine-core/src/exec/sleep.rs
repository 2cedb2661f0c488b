// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `sleep` step execution: waits out a fixed duration, cancellable.

use std::time::Duration;

use super::{StepExecOutcome, StepOutcome};
use crate::cancel::CancellationToken;
use crate::error::EngineError;
use crate::workflow::SleepStepConfig;

pub async fn execute(config: &SleepStepConfig, cancel: &CancellationToken) -> Result<StepExecOutcome, EngineError> {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(config.duration_ms)) => {
            Ok(StepExecOutcome::Completed(StepOutcome::simple(serde_json::json!({
                "slept_ms": config.duration_ms,
            }))))
        }
        _ = cancel.cancelled() => Err(EngineError::Cancelled { step_id: None }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleeps_for_the_configured_duration() {
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        let outcome = execute(&SleepStepConfig { duration_ms: 20 }, &cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(15));
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output["slept_ms"], serde_json::json!(20));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = execute(&SleepStepConfig { duration_ms: 5_000 }, &cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    }
}
