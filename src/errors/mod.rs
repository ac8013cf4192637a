// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Error types
//!
//! Configuration errors are raised while a pipeline is built and never after
//! a stage has started. Dispatch errors abort the current run. Cache read
//! problems never show up here: they are treated as misses by the cache layer.

use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for metricflow operations
pub type MetricflowResult<T> = Result<T, MetricflowError>;

/// Main error type for metricflow
#[derive(Error, Debug, Diagnostic)]
pub enum MetricflowError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Pipeline file not found: {path}")]
    #[diagnostic(
        code(metricflow::pipeline_not_found),
        help("Pass the pipeline file with '--pipeline <FILE>'")
    )]
    PipelineNotFound { path: PathBuf },

    #[error("Invalid pipeline configuration: {reason}")]
    #[diagnostic(code(metricflow::invalid_pipeline))]
    InvalidPipeline {
        reason: String,
        #[help]
        help: Option<String>,
    },

    #[error("duplicate stage parameters defined: '{stage}'")]
    #[diagnostic(code(metricflow::duplicate_stage_parameters))]
    DuplicateStageParameters { stage: String },

    #[error("stage '{stage}' specified more than once in pipeline section")]
    #[diagnostic(code(metricflow::duplicate_pipeline_stage))]
    DuplicatePipelineStage { stage: String },

    #[error("unknown stage referenced: '{stage}' is not defined in parameters section")]
    #[diagnostic(
        code(metricflow::unknown_stage),
        help("Add a parameters entry named '{stage}'")
    )]
    UnknownStage { stage: String },

    #[error("stage '{dependency}' used but not declared in pipeline section (followed by '{stage}')")]
    #[diagnostic(
        code(metricflow::undeclared_stage),
        help("Check that '{dependency}' is listed in the pipeline section")
    )]
    UndeclaredStage { stage: String, dependency: String },

    #[error("stage '{stage}' defined in parameters section but not declared in pipeline section")]
    #[diagnostic(code(metricflow::stage_not_in_pipeline))]
    StageNotInPipeline { stage: String },

    #[error("stage '{stage}' is a first stage so it should not have input data")]
    #[diagnostic(
        code(metricflow::first_stage_with_input),
        help("Either remove 'input_data' or add a 'follows' entry for '{stage}'")
    )]
    FirstStageWithInput { stage: String },

    #[error("output field must be unique to a single stage: '{field}' is produced by '{first}' and '{second}'")]
    #[diagnostic(code(metricflow::duplicate_output_field))]
    DuplicateOutputField {
        field: String,
        first: String,
        second: String,
    },

    #[error("input field '{field}' of stage '{stage}' is not produced by any stage")]
    #[diagnostic(code(metricflow::unproduced_input_field))]
    UnproducedInputField { stage: String, field: String },

    #[error("multiple initial stages in one pipeline section: {}", .stages.join(", "))]
    #[diagnostic(
        code(metricflow::multiple_initial_stages),
        help("Only one stage without 'follows' may start a connected pipeline section")
    )]
    MultipleInitialStages { stages: Vec<String> },

    #[error("multi-stage '{stage}' is invalid: {reason}")]
    #[diagnostic(code(metricflow::invalid_multi_stage))]
    InvalidMultiStage { stage: String, reason: String },

    #[error("map-reduce stage '{stage}' is invalid: {reason}")]
    #[diagnostic(code(metricflow::invalid_map_reduce))]
    InvalidMapReduce { stage: String, reason: String },

    #[error("cyclic dependency detected: {}", .stages.join(" -> "))]
    #[diagnostic(
        code(metricflow::cyclic_dependency),
        help("Review input_data/output_data of these stages to remove the cycle")
    )]
    CircularDependency { stages: Vec<String> },

    // ─────────────────────────────────────────────────────────────────────────
    // Dispatch Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("stage '{stage}': no compute function registered for type '{stage_type}' subtype '{}'", .subtype.as_deref().unwrap_or("-"))]
    #[diagnostic(
        code(metricflow::compute_function_not_found),
        help("Register the function or fix type/subtype of this stage")
    )]
    ComputeFunctionNotFound {
        stage: String,
        stage_type: String,
        subtype: Option<String>,
    },

    #[error("stage '{stage}' ({stage_type}/{}) has an invalid config: {reason}", .subtype.as_deref().unwrap_or("-"))]
    #[diagnostic(code(metricflow::invalid_stage_config))]
    InvalidStageConfig {
        stage: String,
        stage_type: String,
        subtype: Option<String>,
        reason: String,
    },

    #[error("stage '{stage}' ({stage_type}/{}) failed: {message}", .subtype.as_deref().unwrap_or("-"))]
    #[diagnostic(code(metricflow::compute_failed))]
    ComputeFailed {
        stage: String,
        stage_type: String,
        subtype: Option<String>,
        message: String,
    },

    #[error("missing output field '{field}' required by stage '{stage}'")]
    #[diagnostic(code(metricflow::missing_output_field))]
    MissingOutputField { stage: String, field: String },

    #[error("stage '{stage}' returned {actual} output(s) but declares {expected}")]
    #[diagnostic(code(metricflow::output_arity_mismatch))]
    OutputArityMismatch {
        stage: String,
        expected: usize,
        actual: usize,
    },

    #[error("worker error: {message}")]
    #[diagnostic(code(metricflow::worker_error))]
    WorkerError { message: String },

    #[error("run cancelled: {reason}")]
    #[diagnostic(code(metricflow::cancelled))]
    Cancelled { reason: String },

    #[error("run exceeded deadline of {deadline_ms}ms")]
    #[diagnostic(code(metricflow::deadline_exceeded))]
    DeadlineExceeded { deadline_ms: u128 },

    // ─────────────────────────────────────────────────────────────────────────
    // Cache Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Cache error: {message}")]
    #[diagnostic(code(metricflow::cache_error))]
    CacheError { message: String },

    // ─────────────────────────────────────────────────────────────────────────
    // IO/System Errors
    // ─────────────────────────────────────────────────────────────────────────
    #[error("Failed to read file '{path}': {error}")]
    #[diagnostic(code(metricflow::file_read_error))]
    FileReadError { path: PathBuf, error: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(metricflow::io_error))]
    Io { message: String },

    #[error("YAML parsing error: {message}")]
    #[diagnostic(code(metricflow::yaml_error))]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    #[diagnostic(code(metricflow::json_error))]
    Json { message: String },

    #[error("Regex error: {message}")]
    #[diagnostic(code(metricflow::regex_error))]
    Regex { message: String },
}

impl From<std::io::Error> for MetricflowError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}

impl From<serde_yaml::Error> for MetricflowError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Yaml { message: e.to_string() }
    }
}

impl From<serde_json::Error> for MetricflowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json { message: e.to_string() }
    }
}

impl From<regex::Error> for MetricflowError {
    fn from(e: regex::Error) -> Self {
        Self::Regex { message: e.to_string() }
    }
}

impl MetricflowError {
    /// Whether this error was raised while building the pipeline
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidPipeline { .. }
                | Self::DuplicateStageParameters { .. }
                | Self::DuplicatePipelineStage { .. }
                | Self::UnknownStage { .. }
                | Self::UndeclaredStage { .. }
                | Self::StageNotInPipeline { .. }
                | Self::FirstStageWithInput { .. }
                | Self::DuplicateOutputField { .. }
                | Self::UnproducedInputField { .. }
                | Self::MultipleInitialStages { .. }
                | Self::InvalidMultiStage { .. }
                | Self::InvalidMapReduce { .. }
                | Self::CircularDependency { .. }
        )
    }

    /// Create a cache error from any displayable cause
    pub fn cache(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::CacheError {
            message: format!("{}: {}", context, cause),
        }
    }
}
