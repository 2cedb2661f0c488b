// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the workflow engine.
//!
//! Executors return [`StepOutcome`] rather than throwing; only [`EngineError::Config`]
//! and [`EngineError::Resource`] are meant to propagate to the [`crate::runner::Runner`]
//! as a hard failure of the whole run. Every other variant is surfaced through a step's
//! recorded `error` field so recovery wrappers can inspect it.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// The full error taxonomy (spec §7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("expression error in step {step_id:?}: {kind}")]
    Expression {
        step_id: Option<String>,
        kind: ExpressionErrorKind,
    },

    #[error("schema error in step {step_id:?}: {message}")]
    Schema {
        step_id: Option<String>,
        message: String,
    },

    #[error("security error: {0}")]
    Security(String),

    #[error("step execution error in {step_id}: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("timeout after {duration:?} in step {step_id:?}")]
    Timeout {
        step_id: Option<String>,
        duration: Duration,
    },

    #[error("cancelled{}", step_id.as_ref().map(|s| format!(" (step {s})")).unwrap_or_default())]
    Cancelled { step_id: Option<String> },

    #[error("resource error: {0}")]
    Resource(String),

    #[error("aggregate workflow error: {} iteration(s) failed", .0.len())]
    Aggregate(Vec<EngineError>),
}

#[derive(Debug, Error)]
pub enum ExpressionErrorKind {
    #[error("undefined variable: {0}")]
    UndefinedVariable(String),
    #[error("type error: {0}")]
    TypeError(String),
    #[error("evaluation timed out")]
    EvaluationTimeout,
    #[error("banned identifier: {0}")]
    BannedIdentifier(String),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("nesting depth exceeded")]
    NestingDepthExceeded,
}

impl EngineError {
    pub fn step_id(&self) -> Option<&str> {
        match self {
            EngineError::Expression { step_id, .. } => step_id.as_deref(),
            EngineError::Schema { step_id, .. } => step_id.as_deref(),
            EngineError::StepExecution { step_id, .. } => Some(step_id),
            EngineError::Timeout { step_id, .. } => step_id.as_deref(),
            EngineError::Cancelled { step_id } => step_id.as_deref(),
            _ => None,
        }
    }

    pub fn cancelled(step_id: impl Into<String>) -> Self {
        EngineError::Cancelled {
            step_id: Some(step_id.into()),
        }
    }

    pub fn step_execution(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::StepExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Schema {
            step_id: None,
            message: err.to_string(),
        }
    }
}
