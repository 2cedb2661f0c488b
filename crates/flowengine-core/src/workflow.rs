// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The workflow/step data model (spec §3).
//!
//! A [`Workflow`] is an immutable, declarative DAG of [`Step`]s. Steps are a tagged
//! union over step kinds (`StepConfig`); the executor dispatcher (`crate::exec`) is a
//! pattern-match over this enum, never virtual dispatch, per the "dynamic dispatch"
//! design note.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Immutable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub inputs_schema: Option<Value>,
    /// Map of output name -> expression, evaluated after the DAG drains.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Workflow-level cap on concurrently in-flight steps (0/None = unbounded,
    /// bounded only by pool caps).
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Named pool capacities declared by this workflow.
    #[serde(default)]
    pub pools: HashMap<String, usize>,
}

impl Workflow {
    /// Structural validation: unique step ids, `needs` reference existing steps.
    /// Does not check for cycles -- that's `crate::dag::WorkflowDag::build`'s job.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Config("workflow name must not be empty".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        for step in &self.steps {
            for dep in &step.needs {
                if !self.steps.iter().any(|s| &s.id == dep) {
                    return Err(EngineError::Config(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// One DAG node. Shared fields plus a type-tagged `config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub config: StepConfig,
    #[serde(default)]
    pub needs: Vec<String>,
    /// Gate expression; a falsy result skips the step (spec §4.7 preamble step 1).
    #[serde(rename = "if", default)]
    pub if_expr: Option<String>,
    /// Iterable expression; presence triggers foreach fan-out (§4.8).
    #[serde(default)]
    pub foreach: Option<String>,
    /// Per-step fan-out concurrency cap.
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub reflexion: Option<ReflexionPolicy>,
    #[serde(default)]
    pub auto_heal: Option<AutoHealPolicy>,
    #[serde(default)]
    pub quality_gate: Option<QualityGatePolicy>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        self.config.step_type()
    }

    /// A copy of this step with `foreach`/`concurrency` stripped and `needs` kept,
    /// used to drive one foreach iteration (§4.8: "a copy of the step with foreach
    /// and concurrency removed").
    pub fn as_iteration(&self) -> Step {
        let mut clone = self.clone();
        clone.foreach = None;
        clone.concurrency = None;
        clone
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Shell,
    Llm,
    Sleep,
    Human,
    Memory,
    SubWorkflow,
    Join,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Shell(ShellStepConfig),
    Llm(LlmStepConfig),
    Sleep(SleepStepConfig),
    Human(HumanStepConfig),
    Memory(MemoryStepConfig),
    SubWorkflow(SubWorkflowStepConfig),
    Join(JoinStepConfig),
    Dynamic(DynamicStepConfig),
}

impl StepConfig {
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Shell(_) => StepType::Shell,
            StepConfig::Llm(_) => StepType::Llm,
            StepConfig::Sleep(_) => StepType::Sleep,
            StepConfig::Human(_) => StepType::Human,
            StepConfig::Memory(_) => StepType::Memory,
            StepConfig::SubWorkflow(_) => StepType::SubWorkflow,
            StepConfig::Join(_) => StepType::Join,
            StepConfig::Dynamic(_) => StepType::Dynamic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellStepConfig {
    pub run: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Output cap in bytes; defaults to 1 MiB per spec §4.7.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmStepConfig {
    pub agent: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_handoffs")]
    pub max_agent_handoffs: u32,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_max_handoffs() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepStepConfig {
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanStepConfig {
    pub prompt: String,
    #[serde(default)]
    pub event_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOp {
    Store,
    Search,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStepConfig {
    pub op: MemoryOp,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowStepConfig {
    pub workflow: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    /// Renames child output keys -> parent output keys, with defaults.
    #[serde(default)]
    pub output_mapping: HashMap<String, OutputMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMapping {
    pub from: String,
    #[serde(default)]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JoinStepConfig {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicStepConfig {
    pub handler: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    200
}
fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexionPolicy {
    #[serde(default = "default_reflexion_limit")]
    pub limit: u32,
    #[serde(default)]
    pub hint: Option<String>,
}

fn default_reflexion_limit() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoHealPolicy {
    pub agent: String,
    #[serde(default = "default_auto_heal_attempts")]
    pub max_attempts: u32,
}

fn default_auto_heal_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGatePolicy {
    pub reviewer_agent: String,
    #[serde(default = "default_quality_gate_attempts")]
    pub max_attempts: u32,
}

fn default_quality_gate_attempts() -> u32 {
    2
}

/// Fields a recovery wrapper's LLM-produced patch is permitted to touch.
/// `id` and `type` are frozen -- the security invariant of spec §4.9.
pub const RECOVERY_PATCH_WHITELIST: &[&str] = &["run", "prompt", "inputs"];
