// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Pipeline definitions and execution
//!
//! A YAML document is parsed into a [`PipelineConfig`], validated into a
//! [`PipelineDefinition`], linked into a [`DependencyGraph`], scheduled, and
//! finally run by a [`Pipeline`].

mod dag;
mod definition;
mod executor;
mod map_reduce;
mod scheduler;
mod stage;
mod validation;

pub use dag::DependencyGraph;
pub use definition::*;
pub use executor::{Pipeline, RunOptions, RunReport, StageOutcome, StageReport};
pub use map_reduce::{
    partitions_of, replica_lists, MapReduce, MapReduceParameters, MapReduceSubsection,
    MAP_REDUCE_TYPE, MAP_TYPE,
};
pub use scheduler::schedule;
pub use stage::{ComputeTemplate, StageDescriptor, StageNode, VisitMark};
pub use validation::{PipelineValidator, ValidationResult};
