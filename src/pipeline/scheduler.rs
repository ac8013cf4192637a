// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Execution order
//!
//! Depth-first post-order over producer links: every stage is placed after
//! the producers of all its input fields. Roots are visited in parameter
//! order, which makes the result stable for a given configuration.

use std::collections::HashMap;

use crate::errors::MetricflowError;
use crate::pipeline::{StageNode, VisitMark};

/// Compute the execution order of `stages`
///
/// Resets every visit mark first, so a pipeline can be rescheduled.
/// Reaching a stage that is still in progress means the data links form a
/// cycle, reported with the path that closes it.
pub fn schedule(
    stages: &mut [StageNode],
    output_registry: &HashMap<String, usize>,
) -> Result<Vec<usize>, MetricflowError> {
    for stage in stages.iter_mut() {
        stage.mark = VisitMark::Unvisited;
    }

    let mut order = Vec::with_capacity(stages.len());
    let mut path = Vec::new();

    for idx in 0..stages.len() {
        visit(idx, stages, output_registry, &mut path, &mut order)?;
    }

    Ok(order)
}

fn visit(
    idx: usize,
    stages: &mut [StageNode],
    output_registry: &HashMap<String, usize>,
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> Result<(), MetricflowError> {
    match stages[idx].mark {
        VisitMark::Scheduled => return Ok(()),
        VisitMark::InProgress => {
            let start = path.iter().position(|&i| i == idx).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..]
                .iter()
                .map(|&i| stages[i].name().to_string())
                .collect();
            cycle.push(stages[idx].name().to_string());
            return Err(MetricflowError::CircularDependency { stages: cycle });
        }
        VisitMark::Unvisited => {}
    }

    stages[idx].mark = VisitMark::InProgress;
    path.push(idx);

    for field_idx in 0..stages[idx].descriptor.input_fields.len() {
        let field = &stages[idx].descriptor.input_fields[field_idx];
        let producer = *output_registry.get(field).ok_or_else(|| {
            MetricflowError::UnproducedInputField {
                stage: stages[idx].name().to_string(),
                field: field.clone(),
            }
        })?;
        visit(producer, stages, output_registry, path, order)?;
    }

    path.pop();
    stages[idx].mark = VisitMark::Scheduled;
    order.push(idx);

    Ok(())
}
