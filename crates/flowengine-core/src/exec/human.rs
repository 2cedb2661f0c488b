// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `human` step execution: always suspends the step, waiting for an external event
//! (spec §4.7) carrying the resume payload.

use serde_json::Value;

use super::StepExecOutcome;
use crate::error::EngineError;
use crate::workflow::HumanStepConfig;

pub fn execute(step_id: &str, config: &HumanStepConfig) -> Result<StepExecOutcome, EngineError> {
    let event_name = config
        .event_name
        .clone()
        .unwrap_or_else(|| format!("human:{step_id}"));
    Ok(StepExecOutcome::Suspended {
        event_name,
        payload: Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_event_name_to_step_id() {
        let outcome = execute(
            "approve",
            &HumanStepConfig {
                prompt: "approve?".into(),
                event_name: None,
            },
        )
        .unwrap();
        let StepExecOutcome::Suspended { event_name, .. } = outcome else {
            panic!("expected suspension")
        };
        assert_eq!(event_name, "human:approve");
    }

    #[test]
    fn honors_explicit_event_name() {
        let outcome = execute(
            "approve",
            &HumanStepConfig {
                prompt: "approve?".into(),
                event_name: Some("release-signoff".into()),
            },
        )
        .unwrap();
        let StepExecOutcome::Suspended { event_name, .. } = outcome else {
            panic!("expected suspension")
        };
        assert_eq!(event_name, "release-signoff");
    }
}
