// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! # metricflow - declarative metric analysis pipelines
//!
//! `metricflow` runs YAML-described pipelines of compute stages over
//! observability metrics.
//!
//! ## Features
//!
//! - **Dependency scheduling** - Stages run after the producers of their inputs
//! - **Stage registry** - Compute functions selected by `(type, subtype)`
//! - **Content-addressed caching** - Skip stages whose input metadata was seen
//! - **Map-reduce** - Fan a stage out over partitions on threads or processes
//!
//! ## Quick Start
//!
//! ```bash
//! # Check a pipeline file
//! metricflow validate pipeline.yaml
//!
//! # Run it once
//! metricflow run -p pipeline.yaml
//!
//! # Re-run on every change
//! metricflow watch -p pipeline.yaml
//! ```

pub mod cache;
pub mod cli;
pub mod errors;
pub mod pipeline;
pub mod registry;
pub mod workers;

// Re-export commonly used types
pub use errors::{MetricflowError, MetricflowResult};
pub use pipeline::{Pipeline, PipelineConfig, RunOptions, RunReport};
pub use registry::{ComputeError, ComputeFunction, StageRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
