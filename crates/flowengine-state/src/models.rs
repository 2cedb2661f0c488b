// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Row shapes for the five logical tables a state store persists: runs,
//! step executions, events, suspensions, and memory.
//!
//! Status enums are stored as plain TEXT columns (`as_str`/`parse`) rather than
//! through `sqlx::Type`'s enum derive, which maps awkwardly onto SQLite's lack of a
//! native enum/custom type -- a backend-agnostic `StateStore` impl needs a
//! representation that means the same thing on both SQLite and Postgres.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Suspended,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Suspended)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub exec_id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<Value>,
    pub outputs: Option<Value>,
    pub error: Option<String>,
    /// One row per foreach parent; `None` for a non-foreach step or a plain iteration.
    /// Kept as a dedicated column rather than folded into `output` (open question,
    /// resolved: a dedicated `iteration_count` column is permitted by name).
    pub iteration_count: Option<i64>,
    /// `None` for a non-foreach step or the foreach parent row itself; `0..N-1` for a
    /// fan-out child, identifying which element of the iterable it ran.
    pub iteration_index: Option<i64>,
    /// Retry attempt number, starting at 1. Not yet incremented by the retry wrapper
    /// internally -- recorded here for forward compatibility with that wiring.
    pub attempt: i64,
    /// Token usage the executor reported, if any (e.g. an `llm` step's `tokens_used`).
    pub usage: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub data: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionRecord {
    pub suspension_id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub event_name: String,
    pub resolved: bool,
    pub resolved_data: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: Uuid,
    pub run_id: Uuid,
    pub text: String,
    pub embedding: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_str() {
        for status in [RunStatus::Running, RunStatus::Completed, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }

    #[test]
    fn step_status_terminal_classification() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Suspended.is_terminal());
    }
}
