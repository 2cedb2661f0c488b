// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mechanical retry with a configurable backoff curve.

use std::future::Future;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::error::EngineError;
use crate::workflow::{BackoffStrategy, RetryPolicy};

fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.initial_delay_ms as f64;
    let computed = match policy.backoff {
        BackoffStrategy::Constant => base,
        BackoffStrategy::Linear => base * attempt as f64,
        BackoffStrategy::Exponential => base * 2f64.powi(attempt as i32 - 1),
    };
    Duration::from_millis(computed.min(policy.max_delay_ms as f64) as u64)
}

/// Runs `op` up to `policy.max_attempts` times, sleeping between attempts per
/// `policy.backoff`. `op` receives the 1-based attempt number. A cancellation during
/// the inter-attempt sleep short-circuits immediately.
pub async fn run_retry<F, Fut, T>(policy: &RetryPolicy, cancel: &CancellationToken, mut op: F) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if matches!(err, EngineError::Cancelled { .. }) => return Err(err),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(_) => {
                let delay = backoff_delay(policy, attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled { step_id: None }),
                }
            }
        }
    }
}
