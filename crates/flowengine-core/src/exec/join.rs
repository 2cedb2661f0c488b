// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `join` step execution: a pure synchronization point. The scheduler already
//! guarantees a join step only becomes runnable once every step it `needs` has
//! reached a terminal status (spec §4.7); there is nothing left for it to do.

use super::{StepExecOutcome, StepOutcome};
use crate::error::EngineError;

pub fn execute() -> Result<StepExecOutcome, EngineError> {
    Ok(StepExecOutcome::Completed(StepOutcome::simple(serde_json::Value::Null)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_completes_with_no_output() {
        let StepExecOutcome::Completed(outcome) = execute().unwrap() else {
            panic!("expected completion")
        };
        assert!(outcome.output.is_null());
    }
}
