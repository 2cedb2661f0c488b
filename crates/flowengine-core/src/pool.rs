// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Named resource pools (spec §4.4): bounded concurrency per pool name, priority-ordered
//! admission, and cancellable waits.
//!
//! Waiters are kept in a `BTreeMap<(priority, seq), Sender<()>>` rather than a bare
//! `BinaryHeap` so that a cancelled wait can remove its own entry in `O(log n)` instead
//! of requiring a full heap rebuild.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::cancel::CancellationToken;
use crate::error::EngineError;

struct PoolState {
    capacity: usize,
    in_use: usize,
    waiters: BTreeMap<(i64, u64), oneshot::Sender<()>>,
    /// Lifetime count of successful `acquire` calls, for [`PoolMetrics`].
    total_acquired: u64,
    /// Lifetime sum of time spent queued before admission (zero wait for an
    /// immediate acquire), for [`PoolMetrics`].
    total_wait: Duration,
}

/// Aggregate, point-in-time counters for one named pool (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics {
    pub capacity: usize,
    pub total_acquired: u64,
    pub total_wait_ms: u64,
}

struct Pool {
    name: String,
    state: Mutex<PoolState>,
}

/// Holds an admitted slot in a pool; releasing (on drop) wakes the next-highest-priority
/// waiter, or frees the slot if none are queued.
pub struct PoolPermit {
    pool: Arc<Pool>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        if let Some((_, tx)) = pop_highest_priority(&mut state.waiters) {
            // Ownership of the slot transfers directly to the woken waiter.
            let _ = tx.send(());
        } else {
            state.in_use = state.in_use.saturating_sub(1);
        }
    }
}

fn pop_highest_priority(
    waiters: &mut BTreeMap<(i64, u64), oneshot::Sender<()>>,
) -> Option<((i64, u64), oneshot::Sender<()>)> {
    let key = *waiters.keys().next()?;
    waiters.remove(&key).map(|tx| (key, tx))
}

/// Manages the set of named pools declared by a workflow (`Workflow::pools`).
pub struct ResourcePoolManager {
    pools: DashMap<String, Arc<Pool>>,
    seq: AtomicU64,
}

impl Default for ResourcePoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourcePoolManager {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Declares a pool's capacity. Idempotent: re-declaring an existing pool is a no-op.
    pub fn declare(&self, name: &str, capacity: usize) {
        self.pools.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Pool {
                name: name.to_string(),
                state: Mutex::new(PoolState {
                    capacity,
                    in_use: 0,
                    waiters: BTreeMap::new(),
                    total_acquired: 0,
                    total_wait: Duration::ZERO,
                }),
            })
        });
    }

    /// Acquires one slot from `pool_name`, queued by `priority` (higher runs first,
    /// ties broken FIFO). Errors if the pool was never declared, or if `cancel` fires
    /// while waiting.
    pub async fn acquire(
        &self,
        pool_name: &str,
        priority: i64,
        cancel: &CancellationToken,
    ) -> Result<PoolPermit, EngineError> {
        let pool = self
            .pools
            .get(pool_name)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| EngineError::Config(format!("undeclared resource pool: {pool_name}")))?;

        let start = Instant::now();
        let rx = {
            let mut state = pool.state.lock();
            if state.in_use < state.capacity {
                state.in_use += 1;
                state.total_acquired += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                state.waiters.insert((-priority, seq), tx);
                Some((rx, (-priority, seq)))
            }
        };

        let Some((rx, key)) = rx else {
            return Ok(PoolPermit { pool });
        };

        tokio::select! {
            res = rx => {
                res.map_err(|_| EngineError::Resource(format!("pool {} dropped waiter", pool.name)))?;
                let mut state = pool.state.lock();
                state.total_acquired += 1;
                state.total_wait += start.elapsed();
                Ok(PoolPermit { pool })
            }
            _ = cancel.cancelled() => {
                let mut state = pool.state.lock();
                state.waiters.remove(&key);
                Err(EngineError::Cancelled { step_id: None })
            }
        }
    }

    pub fn in_use(&self, pool_name: &str) -> Option<usize> {
        self.pools.get(pool_name).map(|p| p.state.lock().in_use)
    }

    pub fn waiting(&self, pool_name: &str) -> Option<usize> {
        self.pools.get(pool_name).map(|p| p.state.lock().waiters.len())
    }

    /// Aggregate counters for `pool_name` (spec §4.4: `{capacity, totalAcquired,
    /// totalWaitMs}`), or `None` if the pool was never declared.
    pub fn metrics(&self, pool_name: &str) -> Option<PoolMetrics> {
        self.pools.get(pool_name).map(|p| {
            let state = p.state.lock();
            PoolMetrics {
                capacity: state.capacity,
                total_acquired: state.total_acquired,
                total_wait_ms: state.total_wait.as_millis() as u64,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquires_immediately_under_capacity() {
        let mgr = ResourcePoolManager::new();
        mgr.declare("default", 2);
        let cancel = CancellationToken::new();
        let _p1 = mgr.acquire("default", 0, &cancel).await.unwrap();
        let _p2 = mgr.acquire("default", 0, &cancel).await.unwrap();
        assert_eq!(mgr.in_use("default"), Some(2));
    }

    #[tokio::test]
    async fn blocks_then_admits_on_release() {
        let mgr = Arc::new(ResourcePoolManager::new());
        mgr.declare("default", 1);
        let cancel = CancellationToken::new();
        let permit = mgr.acquire("default", 0, &cancel).await.unwrap();

        let mgr2 = Arc::clone(&mgr);
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            mgr2.acquire("default", 0, &cancel).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(permit);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn higher_priority_waiter_admitted_first() {
        let mgr = Arc::new(ResourcePoolManager::new());
        mgr.declare("default", 1);
        let cancel = CancellationToken::new();
        let permit = mgr.acquire("default", 0, &cancel).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let mgr1 = Arc::clone(&mgr);
        let low = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let _p = mgr1.acquire("default", 1, &cancel).await.unwrap();
            o1.lock().push("low");
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let o2 = Arc::clone(&order);
        let mgr2 = Arc::clone(&mgr);
        let high = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let _p = mgr2.acquire("default", 10, &cancel).await.unwrap();
            o2.lock().push("high");
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(permit);
        low.await.unwrap();
        high.await.unwrap();
        assert_eq!(*order.lock(), vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn metrics_track_capacity_and_acquisitions() {
        let mgr = ResourcePoolManager::new();
        mgr.declare("default", 2);
        let cancel = CancellationToken::new();
        let _p1 = mgr.acquire("default", 0, &cancel).await.unwrap();
        let _p2 = mgr.acquire("default", 0, &cancel).await.unwrap();
        let metrics = mgr.metrics("default").unwrap();
        assert_eq!(metrics.capacity, 2);
        assert_eq!(metrics.total_acquired, 2);
        assert_eq!(metrics.total_wait_ms, 0);
    }

    #[tokio::test]
    async fn cancellation_removes_waiter() {
        let mgr = ResourcePoolManager::new();
        mgr.declare("default", 1);
        let cancel = CancellationToken::new();
        let _permit = mgr.acquire("default", 0, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let mgr_ref = &mgr;
        let wait_fut = mgr_ref.acquire("default", 0, &waiter_cancel);
        tokio::pin!(wait_fut);
        tokio::select! {
            _ = &mut wait_fut => panic!("should not admit"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        waiter_cancel.cancel();
        let result = wait_fut.await;
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
        assert_eq!(mgr.waiting("default"), Some(0));
    }
}
