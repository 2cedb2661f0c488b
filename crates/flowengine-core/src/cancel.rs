// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! A minimal cooperative cancellation signal, shared by the rate limiter, the
//! resource pool, and the runner's step-abort path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`Self::cancel`] has been (or is) called.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        // Re-check after subscribing to close the race between the flag check
        // above and `notify_waiters` firing concurrently.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let tok = CancellationToken::new();
        tok.cancel();
        tok.cancelled().await;
    }

    #[tokio::test]
    async fn cancelled_resolves_once_cancel_is_called() {
        let tok = CancellationToken::new();
        let tok2 = tok.clone();
        let handle = tokio::spawn(async move {
            tok2.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        tok.cancel();
        handle.await.unwrap();
    }
}
