// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Pipeline validation
//!
//! [`PipelineDefinition::parse`] applies the structural rules and stops at
//! the first violation. [`PipelineValidator`] is the lint pass behind
//! `metricflow validate`: it reports that violation together with warnings
//! about suspicious but legal pipelines.

use petgraph::unionfind::UnionFind;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::errors::MetricflowError;
use crate::pipeline::{
    schedule, DependencyGraph, MapReduceParameters, PipelineConfig, PipelineDefinition,
    PipelineEdge, StageDescriptor, StageNode, WorkerMode, MAP_REDUCE_TYPE, MAP_TYPE,
};
use crate::registry::StageRegistry;

impl PipelineDefinition {
    /// Validate raw configuration into a pipeline definition
    pub fn parse(config: &PipelineConfig) -> Result<Self, MetricflowError> {
        // Parameter records, rejecting the first duplicate
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (idx, params) in config.parameters.iter().enumerate() {
            if by_name.insert(params.name.as_str(), idx).is_some() {
                return Err(MetricflowError::DuplicateStageParameters {
                    stage: params.name.clone(),
                });
            }
        }

        let stages: Vec<StageDescriptor> = config
            .parameters
            .iter()
            .cloned()
            .map(StageDescriptor::from)
            .collect();

        // Pipeline section
        let mut declared: HashSet<&str> = HashSet::new();
        let mut output_registry: HashMap<String, usize> = HashMap::new();
        let mut edges = Vec::with_capacity(config.pipeline.len());

        for entry in &config.pipeline {
            if !declared.insert(entry.name.as_str()) {
                return Err(MetricflowError::DuplicatePipelineStage {
                    stage: entry.name.clone(),
                });
            }

            let idx = *by_name
                .get(entry.name.as_str())
                .ok_or_else(|| MetricflowError::UnknownStage {
                    stage: entry.name.clone(),
                })?;
            let stage = &stages[idx];

            for dependency in &entry.follows {
                if !by_name.contains_key(dependency.as_str()) {
                    return Err(MetricflowError::UnknownStage {
                        stage: dependency.clone(),
                    });
                }
            }

            if entry.follows.is_empty() && !stage.is_source() {
                return Err(MetricflowError::FirstStageWithInput {
                    stage: stage.name.clone(),
                });
            }

            for field in &stage.output_fields {
                if let Some(&first) = output_registry.get(field) {
                    return Err(MetricflowError::DuplicateOutputField {
                        field: field.clone(),
                        first: stages[first].name.clone(),
                        second: stage.name.clone(),
                    });
                }
                output_registry.insert(field.clone(), idx);
            }

            edges.push(PipelineEdge {
                stage: entry.name.clone(),
                follows: entry.follows.clone(),
            });
        }

        for edge in &edges {
            for dependency in &edge.follows {
                if !declared.contains(dependency.as_str()) {
                    return Err(MetricflowError::UndeclaredStage {
                        stage: edge.stage.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        if let Some(stage) = stages.iter().find(|s| !declared.contains(s.name.as_str())) {
            return Err(MetricflowError::StageNotInPipeline {
                stage: stage.name.clone(),
            });
        }

        for stage in &stages {
            if let Some(field) = stage
                .input_fields
                .iter()
                .find(|f| !output_registry.contains_key(*f))
            {
                return Err(MetricflowError::UnproducedInputField {
                    stage: stage.name.clone(),
                    field: field.clone(),
                });
            }
        }

        let follows_of: HashMap<&str, &[String]> = edges
            .iter()
            .map(|e| (e.stage.as_str(), e.follows.as_slice()))
            .collect();

        for stage in &stages {
            let follows = follows_of.get(stage.name.as_str()).copied().unwrap_or(&[]);
            if stage.multi_stage {
                check_multi_stage(stage, follows, &stages, &by_name, &output_registry)?;
            }
            if stage.stage_type == MAP_REDUCE_TYPE {
                check_map_reduce(stage)?;
            }
        }

        check_single_initial_stage(&stages, &edges, &by_name)?;

        Ok(Self {
            stages,
            edges,
            output_registry,
            global_settings: config.global_settings.clone(),
        })
    }
}

fn check_multi_stage(
    stage: &StageDescriptor,
    follows: &[String],
    stages: &[StageDescriptor],
    by_name: &HashMap<&str, usize>,
    output_registry: &HashMap<String, usize>,
) -> Result<(), MetricflowError> {
    let invalid = |reason: String| MetricflowError::InvalidMultiStage {
        stage: stage.name.clone(),
        reason,
    };

    if follows.len() != 1 {
        return Err(invalid(format!(
            "must follow exactly one stage, follows {}",
            follows.len()
        )));
    }
    if stage.input_fields.len() != 1 {
        return Err(invalid(format!(
            "must have exactly one input field, has {}",
            stage.input_fields.len()
        )));
    }
    if stage.output_fields.len() != 1 {
        return Err(invalid(format!(
            "must have exactly one output field, has {}",
            stage.output_fields.len()
        )));
    }
    if stage.stage_type == MAP_REDUCE_TYPE {
        return Err(invalid("a map_reduce stage cannot be a replica template".into()));
    }

    let predecessor_idx = by_name[follows[0].as_str()];
    let predecessor = &stages[predecessor_idx];
    if predecessor.stage_type != MAP_TYPE && !predecessor.multi_stage {
        return Err(invalid(format!(
            "predecessor '{}' is neither a map stage nor a multi-stage",
            predecessor.name
        )));
    }
    if output_registry.get(&stage.input_fields[0]) != Some(&predecessor_idx) {
        return Err(invalid(format!(
            "input '{}' is not produced by predecessor '{}'",
            stage.input_fields[0], predecessor.name
        )));
    }

    Ok(())
}

fn check_map_reduce(stage: &StageDescriptor) -> Result<(), MetricflowError> {
    MapReduceParameters::from_stage(stage)?;

    if stage.input_fields.len() != 1 || stage.output_fields.len() != 1 {
        return Err(MetricflowError::InvalidMapReduce {
            stage: stage.name.clone(),
            reason: format!(
                "needs exactly one input and one output field, has {} and {}",
                stage.input_fields.len(),
                stage.output_fields.len()
            ),
        });
    }

    Ok(())
}

/// At most one stage without predecessors per connected pipeline section
fn check_single_initial_stage(
    stages: &[StageDescriptor],
    edges: &[PipelineEdge],
    by_name: &HashMap<&str, usize>,
) -> Result<(), MetricflowError> {
    let mut sections = UnionFind::new(stages.len());
    for edge in edges {
        let idx = by_name[edge.stage.as_str()];
        for dependency in &edge.follows {
            sections.union(idx, by_name[dependency.as_str()]);
        }
    }

    let mut initial: HashMap<usize, Vec<usize>> = HashMap::new();
    for edge in edges.iter().filter(|e| e.follows.is_empty()) {
        let idx = by_name[edge.stage.as_str()];
        initial.entry(sections.find(idx)).or_default().push(idx);
    }

    let mut offending: Vec<Vec<usize>> = initial.into_values().filter(|v| v.len() > 1).collect();
    offending.sort();

    match offending.into_iter().next() {
        Some(group) => Err(MetricflowError::MultipleInitialStages {
            stages: group.into_iter().map(|i| stages[i].name.clone()).collect(),
        }),
        None => Ok(()),
    }
}

/// Pipeline validator
pub struct PipelineValidator;

impl PipelineValidator {
    /// Lint a pipeline configuration
    ///
    /// With a registry, also reports stages whose compute function is not
    /// registered.
    pub fn validate(config: &PipelineConfig, registry: Option<&StageRegistry>) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.parameters.is_empty() {
            result.add_error("Pipeline has no stages defined");
            return result;
        }

        let definition = match PipelineDefinition::parse(config) {
            Ok(definition) => definition,
            Err(e) => {
                result.add_error(&e.to_string());
                return result;
            }
        };

        let mut nodes: Vec<StageNode> = definition
            .stages
            .iter()
            .cloned()
            .map(StageNode::new)
            .collect();

        if let Err(e) = DependencyGraph::link(&mut nodes, &definition.edges)
            .and_then(|_| schedule(&mut nodes, &definition.output_registry))
        {
            result.add_error(&e.to_string());
            return result;
        }

        let settings = &definition.global_settings;
        let on_processes =
            settings.number_of_workers > 0 && settings.worker_mode == WorkerMode::Processes;
        let builtins = on_processes.then(StageRegistry::with_builtins);

        for node in &nodes {
            Self::lint_stage(node, &nodes, &definition, &mut result);
            if let Some(builtins) = &builtins {
                Self::lint_process_replicas(&node.descriptor, builtins, &mut result);
            }
            if let Some(registry) = registry {
                Self::check_registered(&node.descriptor, registry, &mut result);
            }
        }

        Self::lint_reachability(&nodes, &mut result);

        result
    }

    fn lint_stage(
        node: &StageNode,
        nodes: &[StageNode],
        definition: &PipelineDefinition,
        result: &mut ValidationResult,
    ) {
        let stage = &node.descriptor;

        for field in &stage.input_fields {
            if let Some(&producer) = definition.output_registry.get(field) {
                let producer = nodes[producer].name();
                if !node.follows.iter().any(|f| f == producer) {
                    result.add_warning(&format!(
                        "Stage '{}': consumes '{}' from '{}' but does not follow it",
                        stage.name, field, producer
                    ));
                }
            }
        }

        if stage.is_cached() && stage.input_fields.len() != 1 {
            result.add_warning(&format!(
                "Stage '{}': cache_directory is set but the stage has {} inputs, caching will be skipped",
                stage.name,
                stage.input_fields.len()
            ));
        }

        if stage.is_cached() && stage.multi_stage {
            result.add_warning(&format!(
                "Stage '{}': multi-stages are never cached",
                stage.name
            ));
        }
    }

    fn check_registered(stage: &StageDescriptor, registry: &StageRegistry, result: &mut ValidationResult) {
        if stage.stage_type == MAP_REDUCE_TYPE {
            if let Ok(params) = MapReduceParameters::from_stage(stage) {
                for function in params.functions() {
                    if !registry.contains(&function.stage_type, Some(&function.subtype)) {
                        result.add_error(&format!(
                            "Stage '{}': no compute function registered for {}/{}",
                            stage.name, function.stage_type, function.subtype
                        ));
                    }
                }
            }
        } else if !registry.contains(&stage.stage_type, stage.subtype.as_deref()) {
            result.add_error(&format!(
                "Stage '{}': no compute function registered for {}",
                stage.name,
                stage.kind()
            ));
        }
    }

    /// Process workers only know the builtin functions
    fn lint_process_replicas(stage: &StageDescriptor, builtins: &StageRegistry, result: &mut ValidationResult) {
        let replica = if stage.multi_stage {
            Some((stage.stage_type.clone(), stage.subtype.clone()))
        } else if stage.stage_type == MAP_REDUCE_TYPE {
            MapReduceParameters::from_stage(stage)
                .ok()
                .map(|p| (p.compute_function.stage_type, Some(p.compute_function.subtype)))
        } else {
            None
        };

        if let Some((stage_type, subtype)) = replica {
            if !builtins.contains(&stage_type, subtype.as_deref()) {
                result.add_warning(&format!(
                    "Stage '{}': replicas of {}/{} run on process workers, which only resolve builtin functions",
                    stage.name,
                    stage_type,
                    subtype.as_deref().unwrap_or("-")
                ));
            }
        }
    }

    fn lint_reachability(nodes: &[StageNode], result: &mut ValidationResult) {
        let mut reached = vec![false; nodes.len()];
        let mut queue: VecDeque<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.follows.is_empty())
            .map(|(i, _)| i)
            .collect();

        while let Some(idx) = queue.pop_front() {
            if std::mem::replace(&mut reached[idx], true) {
                continue;
            }
            queue.extend(nodes[idx].followers.iter().copied());
        }

        for (node, reached) in nodes.iter().zip(reached) {
            if !reached {
                result.add_warning(&format!(
                    "Stage '{}': not reachable from any initial stage",
                    node.name()
                ));
            }
        }
    }
}

/// Result of pipeline validation
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }

    pub fn add_warning(&mut self, message: &str) {
        self.warnings.push(message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}
