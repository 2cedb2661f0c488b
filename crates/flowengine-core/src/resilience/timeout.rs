// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Wraps a future with a wall-clock deadline, mapping expiry to [`EngineError::Timeout`].

use std::future::Future;
use std::time::Duration;

use crate::error::EngineError;

pub async fn with_timeout<F, T>(step_id: Option<&str>, duration: Duration, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            step_id: step_id.map(String::from),
            duration,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_inner_result_when_fast_enough() {
        let result = with_timeout(Some("s1"), Duration::from_millis(50), async { Ok::<_, EngineError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn times_out_on_slow_future() {
        let result = with_timeout(Some("s1"), Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, EngineError>(())
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
    }
}
