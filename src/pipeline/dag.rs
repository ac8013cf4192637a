// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Dependency graph over the `follows` edges
//!
//! Links each stage to its predecessors and followers and keeps a petgraph
//! view of the result for queries and rendering.

use petgraph::algo::{astar, has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

use crate::errors::MetricflowError;
use crate::pipeline::{PipelineEdge, StageNode};

/// Graph of stage dependencies
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<usize, ()>,
    name_to_index: HashMap<String, NodeIndex>,
    names: Vec<String>,
}

impl DependencyGraph {
    /// Link `follows` and `followers` of `stages` from the declared edges
    pub fn link(stages: &mut [StageNode], edges: &[PipelineEdge]) -> Result<Self, MetricflowError> {
        let mut dag = Self::default();

        for (idx, stage) in stages.iter().enumerate() {
            let node = dag.graph.add_node(idx);
            dag.name_to_index.insert(stage.name().to_string(), node);
            dag.names.push(stage.name().to_string());
        }

        for edge in edges {
            let stage_node = dag.node(&edge.stage)?;
            let stage_idx = dag.graph[stage_node];

            for dependency in &edge.follows {
                let dep_node = dag.name_to_index.get(dependency).copied().ok_or_else(|| {
                    MetricflowError::UndeclaredStage {
                        stage: edge.stage.clone(),
                        dependency: dependency.clone(),
                    }
                })?;
                let dep_idx = dag.graph[dep_node];

                stages[stage_idx].follows.push(dependency.clone());
                stages[dep_idx].followers.push(stage_idx);
                dag.graph.update_edge(dep_node, stage_node, ());
            }
        }

        dag.validate_acyclic()?;
        Ok(dag)
    }

    fn node(&self, name: &str) -> Result<NodeIndex, MetricflowError> {
        self.name_to_index
            .get(name)
            .copied()
            .ok_or_else(|| MetricflowError::UnknownStage {
                stage: name.to_string(),
            })
    }

    fn name(&self, node: NodeIndex) -> &str {
        &self.names[self.graph[node]]
    }

    /// Validate that the graph is acyclic
    fn validate_acyclic(&self) -> Result<(), MetricflowError> {
        match toposort(&self.graph, None) {
            Ok(_) => Ok(()),
            Err(cycle) => Err(MetricflowError::CircularDependency {
                stages: self.cycle_through(cycle.node_id()),
            }),
        }
    }

    /// Names along one cycle through `start`, ending back at `start`
    fn cycle_through(&self, start: NodeIndex) -> Vec<String> {
        let mut cycle = vec![self.name(start).to_string()];

        let back = self
            .graph
            .neighbors_directed(start, Direction::Outgoing)
            .find_map(|next| astar(&self.graph, next, |n| n == start, |_| 1, |_| 0));

        if let Some((_, path)) = back {
            cycle.extend(path.into_iter().map(|n| self.name(n).to_string()));
        }

        cycle
    }

    /// Stages that `stage_name` follows
    pub fn dependencies(&self, stage_name: &str) -> Option<Vec<String>> {
        self.neighbors(stage_name, Direction::Incoming)
    }

    /// Stages that follow `stage_name`
    pub fn dependents(&self, stage_name: &str) -> Option<Vec<String>> {
        self.neighbors(stage_name, Direction::Outgoing)
    }

    fn neighbors(&self, stage_name: &str, direction: Direction) -> Option<Vec<String>> {
        let node = self.name_to_index.get(stage_name)?;
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(*node, direction).collect();
        nodes.sort();
        Some(nodes.into_iter().map(|n| self.name(n).to_string()).collect())
    }

    /// Check if stage A depends (directly or transitively) on stage B
    pub fn depends_on(&self, stage_a: &str, stage_b: &str) -> bool {
        let (Some(node_a), Some(node_b)) =
            (self.name_to_index.get(stage_a), self.name_to_index.get(stage_b))
        else {
            return false;
        };

        stage_a != stage_b && has_path_connecting(&self.graph, *node_b, *node_a, None)
    }

    fn names_in_order(&self) -> Vec<&str> {
        self.graph.node_indices().map(|n| self.name(n)).collect()
    }

    fn edge_names(&self) -> Vec<(&str, &str)> {
        self.graph
            .edge_references()
            .map(|e| (self.name(e.source()), self.name(e.target())))
            .collect()
    }

    /// Generate Mermaid diagram of the graph
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");

        for name in self.names_in_order() {
            out.push_str(&format!("    {}[{}]\n", name, name));
        }

        for (from, to) in self.edge_names() {
            out.push_str(&format!("    {} --> {}\n", from, to));
        }

        out
    }

    /// Generate DOT diagram of the graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph pipeline {\n");
        out.push_str("    rankdir=TB;\n");
        out.push_str("    node [shape=box, style=rounded];\n\n");

        for (from, to) in self.edge_names() {
            out.push_str(&format!("    \"{}\" -> \"{}\";\n", from, to));
        }

        for node in self.graph.node_indices() {
            if self.graph.neighbors_undirected(node).next().is_none() {
                out.push_str(&format!("    \"{}\";\n", self.name(node)));
            }
        }

        out.push_str("}\n");
        out
    }

    /// Text listing of the execution order
    pub fn to_text(&self, stages: &[StageNode], order: &[usize]) -> String {
        let mut out = String::new();

        for (i, &idx) in order.iter().enumerate() {
            let stage = &stages[idx];
            out.push_str(&format!("{}. {} ({})", i + 1, stage.name(), stage.descriptor.kind()));

            if stage.descriptor.multi_stage {
                out.push_str(" [multi-stage]");
            }
            if !stage.follows.is_empty() {
                out.push_str(&format!(" [follows: {}]", stage.follows.join(", ")));
            }

            out.push('\n');
        }

        out
    }
}
