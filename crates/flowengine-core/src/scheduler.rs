// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The ready-set scheduler (spec §4.6 / §5): tracks which steps have had all their
//! `needs` satisfied and are runnable right now.
//!
//! This replaces a busy-poll "recheck every N ms" approach with maintained in-degree
//! counters: completing a step decrements its dependents' counters directly, and a
//! counter hitting zero is what makes a step runnable. The [`crate::runner::Runner`]
//! drives this from a single task; no locking is required internally beyond what
//! [`dashmap`] already gives the status map for read access from elsewhere (e.g. the
//! CLI's progress reporting).

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::dag::WorkflowDag;
use crate::error::EngineError;
use crate::workflow::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    /// Waiting on an external event (human/`ask` suspension). Deliberately not
    /// terminal: a suspended step must keep blocking its dependents.
    Suspended,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

pub struct Scheduler {
    dag: WorkflowDag,
    status: DashMap<String, StepStatus>,
    remaining_deps: DashMap<String, usize>,
    ready: std::sync::Mutex<VecDeque<String>>,
}

impl Scheduler {
    pub fn new(workflow: &Workflow) -> Result<Self, EngineError> {
        workflow.validate()?;
        let dag = WorkflowDag::build(workflow)?;
        let status = DashMap::new();
        let remaining_deps = DashMap::new();
        let mut ready = VecDeque::new();

        for step in &workflow.steps {
            status.insert(step.id.clone(), StepStatus::Pending);
            let deps = dag.depends_on(&step.id).len();
            remaining_deps.insert(step.id.clone(), deps);
            if deps == 0 {
                ready.push_back(step.id.clone());
            }
        }

        Ok(Self {
            dag,
            status,
            remaining_deps,
            ready: std::sync::Mutex::new(ready),
        })
    }

    pub fn dag(&self) -> &WorkflowDag {
        &self.dag
    }

    pub fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.status.get(step_id).map(|r| *r)
    }

    /// Drains every currently-runnable step id. Each returned step transitions to
    /// [`StepStatus::Running`] before being handed back, so a second call never
    /// returns the same id twice.
    pub fn take_runnable(&self) -> Vec<String> {
        let mut ready = self.ready.lock().unwrap();
        let mut out = Vec::with_capacity(ready.len());
        while let Some(id) = ready.pop_front() {
            self.status.insert(id.clone(), StepStatus::Running);
            out.push(id);
        }
        out
    }

    fn release_dependents(&self, step_id: &str, propagate_skip: bool) {
        let mut queue: VecDeque<String> = self.dag.dependents_of(step_id).into_iter().collect();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(dependent) = queue.pop_front() {
            if !visited.insert(dependent.clone()) {
                continue;
            }
            if propagate_skip {
                // A failed ancestor skips everything downstream of it, recursively.
                if self
                    .status
                    .get(&dependent)
                    .map(|s| !s.is_terminal())
                    .unwrap_or(false)
                {
                    self.status.insert(dependent.clone(), StepStatus::Skipped);
                    for next in self.dag.dependents_of(&dependent) {
                        queue.push_back(next);
                    }
                }
                continue;
            }
            let Some(mut remaining) = self.remaining_deps.get_mut(&dependent) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                drop(remaining);
                if self.status.get(&dependent).map(|s| *s == StepStatus::Pending).unwrap_or(false) {
                    self.ready.lock().unwrap().push_back(dependent);
                }
            }
        }
    }

    pub fn mark_complete(&self, step_id: &str) {
        self.status.insert(step_id.to_string(), StepStatus::Completed);
        self.release_dependents(step_id, false);
    }

    /// Seeds `step_id` as already-terminal from a prior run, without ever handing it
    /// back from [`Scheduler::take_runnable`] -- the hydration path for resuming a
    /// crashed run onto steps the state store already recorded as finished.
    ///
    /// Must be called before the first `take_runnable()`, since a zero-dependency
    /// step starts life sitting in the ready queue; this removes it from there first.
    pub fn seed_terminal(&self, step_id: &str, status: StepStatus) {
        self.ready.lock().unwrap().retain(|id| id != step_id);
        self.status.insert(step_id.to_string(), status);
        match status {
            StepStatus::Failed => self.release_dependents(step_id, true),
            _ => self.release_dependents(step_id, false),
        }
    }

    /// Marks `step_id` suspended: it is neither complete nor failed, so its
    /// dependents stay blocked until the run is resumed past this point.
    pub fn mark_suspended(&self, step_id: &str) {
        self.status.insert(step_id.to_string(), StepStatus::Suspended);
    }

    pub fn mark_skipped(&self, step_id: &str) {
        self.status.insert(step_id.to_string(), StepStatus::Skipped);
        self.release_dependents(step_id, false);
    }

    /// Marks `step_id` failed and cascades a skip to every step downstream of it.
    pub fn mark_failed(&self, step_id: &str) {
        self.status.insert(step_id.to_string(), StepStatus::Failed);
        self.release_dependents(step_id, true);
    }

    pub fn is_complete(&self) -> bool {
        self.status.iter().all(|r| r.is_terminal())
    }

    pub fn failures(&self) -> Vec<String> {
        self.status
            .iter()
            .filter(|r| *r.value() == StepStatus::Failed)
            .map(|r| r.key().clone())
            .collect()
    }
}
