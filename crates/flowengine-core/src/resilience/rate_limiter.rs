// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Token-bucket rate limiter with a FIFO waiter queue and cancellation support.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::error::EngineError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    fn try_take(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Waits (FIFO by arrival order of the underlying poll loop, bounded by a
    /// short fixed sleep) for a token, honoring `cancel`.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        loop {
            if self.try_take() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled { step_id: None });
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled { step_id: None }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_immediately_when_tokens_available() {
        let limiter = RateLimiter::new(2.0, 10.0);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        limiter.acquire(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_refill_once_exhausted() {
        let limiter = RateLimiter::new(1.0, 50.0);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_respects_cancellation() {
        let limiter = RateLimiter::new(0.0, 0.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = limiter.acquire(&cancel).await;
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
    }
}
