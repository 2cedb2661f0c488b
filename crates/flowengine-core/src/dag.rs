// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! DAG construction and topological ordering over a [`Workflow`] (spec §4.6 step 1).

use crate::error::EngineError;
use crate::workflow::Workflow;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A stable topological view of a workflow's step graph.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl WorkflowDag {
    /// Builds the DAG and computes a stable topological order.
    ///
    /// Fails with [`EngineError::Config`] ("CycleDetected" per spec terminology) on a cycle.
    pub fn build(workflow: &Workflow) -> Result<Self, EngineError> {
        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();

        // Insert nodes in declaration order so that toposort ties break stably.
        for step in &workflow.steps {
            let idx = graph.add_node(step.id.clone());
            index_of.insert(step.id.clone(), idx);
        }
        for step in &workflow.steps {
            let to = index_of[&step.id];
            for dep in &step.needs {
                let from = index_of[dep];
                graph.add_edge(from, to, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| {
                let node = &graph[cycle.node_id()];
                EngineError::Config(format!("CycleDetected: step {node} participates in a cycle"))
            })?
            .into_iter()
            .map(|idx| graph[idx].clone())
            .collect();

        Ok(Self {
            graph,
            index_of,
            order,
        })
    }

    /// Step ids in a topological order consistent with the workflow's declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn depends_on(&self, step_id: &str) -> Vec<String> {
        let Some(&idx) = self.index_of.get(step_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect()
    }

    /// Direct dependents of `step_id` -- the steps whose `needs` names it.
    pub fn dependents_of(&self, step_id: &str) -> Vec<String> {
        let Some(&idx) = self.index_of.get(step_id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, petgraph::Direction::Outgoing)
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ShellStepConfig, Step, StepConfig};
    use std::collections::HashMap;

    fn step(id: &str, needs: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            config: StepConfig::Shell(ShellStepConfig {
                run: "true".into(),
                env: HashMap::new(),
                max_output_bytes: None,
            }),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            if_expr: None,
            foreach: None,
            concurrency: None,
            pool: None,
            retry: None,
            reflexion: None,
            auto_heal: None,
            quality_gate: None,
            input_schema: None,
            output_schema: None,
            timeout_ms: None,
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "t".into(),
            steps,
            inputs_schema: None,
            outputs: HashMap::new(),
            concurrency: None,
            pools: HashMap::new(),
        }
    }

    #[test]
    fn linear_chain_orders_by_dependency() {
        let wf = workflow(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let dag = WorkflowDag::build(&wf).unwrap();
        assert_eq!(dag.order(), &["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn cycle_is_detected() {
        let wf = workflow(vec![step("a", &["b"]), step("b", &["a"])]);
        let err = WorkflowDag::build(&wf).unwrap_err();
        assert!(matches!(err, EngineError::Config(msg) if msg.contains("CycleDetected")));
    }

    #[test]
    fn depends_on_returns_direct_predecessors() {
        let wf = workflow(vec![step("a", &[]), step("b", &[]), step("c", &["a", "b"])]);
        let dag = WorkflowDag::build(&wf).unwrap();
        let mut deps = dag.depends_on("c");
        deps.sort();
        assert_eq!(deps, vec!["a".to_string(), "b".to_string()]);
    }
}
