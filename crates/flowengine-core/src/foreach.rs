// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Foreach fan-out (spec §4.8): runs one iteration per item of an evaluated iterable,
//! bounded by the step's declared concurrency, and aggregates the per-iteration
//! results into the parent step's recorded output.

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::expr::StepContext;

/// Iterables larger than this are still executed in full, but the per-item detail
/// folded into the parent's `items` is dropped in favor of a bare count -- keeping a
/// full `StepContext` per item for a several-thousand-element fan-out would otherwise
/// make the run's context balloon unboundedly (spec §4.8 edge case).
pub const LARGE_FANOUT_THRESHOLD: usize = 500;

pub struct ForeachOutcome {
    pub parent: StepContext,
    pub failed_count: usize,
}

/// Drives `run_iteration` once per item, honoring `concurrency`, and folds the results
/// into a single parent [`StepContext`]. `run_iteration` receives the item's index and
/// value and returns its resulting context; it is responsible for its own cancellation
/// and error handling (a failed iteration should still return a context with
/// `status = "failed"`, not panic).
pub async fn run_foreach<F, Fut>(items: Vec<Value>, concurrency: usize, run_iteration: F) -> ForeachOutcome
where
    F: Fn(usize, Value) -> Fut,
    Fut: std::future::Future<Output = StepContext>,
{
    let item_count = items.len();
    let large_fanout = item_count > LARGE_FANOUT_THRESHOLD;
    let bound = concurrency.max(1);

    let results: Vec<StepContext> = stream::iter(items.into_iter().enumerate())
        .map(|(i, item)| run_iteration(i, item))
        .buffered(bound)
        .collect()
        .await;

    let failed_count = results.iter().filter(|r| r.status == "failed").count();
    let outputs: Vec<Value> = results.iter().map(|r| r.output.clone()).collect();
    let status = if failed_count > 0 { "failed" } else { "success" };

    let parent = StepContext {
        output: Value::Array(outputs),
        outputs: serde_json::json!({ "item_count": item_count, "failed_count": failed_count }),
        status: status.to_string(),
        error: if failed_count > 0 {
            Some(format!("{failed_count} of {item_count} iteration(s) failed"))
        } else {
            None
        },
        items: if large_fanout { None } else { Some(results) },
    };

    ForeachOutcome { parent, failed_count }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(output: Value, status: &str) -> StepContext {
        StepContext {
            output,
            outputs: json!({}),
            status: status.to_string(),
            error: None,
            items: None,
        }
    }

    #[tokio::test]
    async fn aggregates_outputs_in_order() {
        let items = vec![json!(1), json!(2), json!(3)];
        let outcome = run_foreach(items, 2, |i, item| async move {
            ctx(json!(item.as_i64().unwrap() * 10), "success")
        })
        .await;
        assert_eq!(outcome.parent.output, json!([10, 20, 30]));
        assert_eq!(outcome.parent.status, "success");
        assert_eq!(outcome.failed_count, 0);
        assert_eq!(outcome.parent.items.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn a_failed_iteration_marks_the_parent_failed() {
        let items = vec![json!("a"), json!("b")];
        let outcome = run_foreach(items, 2, |i, _item| async move {
            if i == 1 {
                ctx(Value::Null, "failed")
            } else {
                ctx(json!("ok"), "success")
            }
        })
        .await;
        assert_eq!(outcome.parent.status, "failed");
        assert_eq!(outcome.failed_count, 1);
    }

    #[tokio::test]
    async fn large_fanout_drops_per_item_detail() {
        let items: Vec<Value> = (0..600).map(Value::from).collect();
        let outcome = run_foreach(items, 50, |_i, item| async move { ctx(item, "success") }).await;
        assert!(outcome.parent.items.is_none());
        assert_eq!(outcome.parent.output.as_array().unwrap().len(), 600);
    }
}
