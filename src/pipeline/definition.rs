// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Pipeline definition structures
//!
//! Defines the schema of pipeline configuration files: a `pipeline` section
//! with the `follows` edges, a `parameters` section with one record per
//! stage, and `global_settings`.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::MetricflowError;
use crate::pipeline::StageDescriptor;

/// Raw pipeline configuration, as read from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline topology
    #[serde(default, deserialize_with = "null_as_default")]
    pub pipeline: Vec<PipelineEntry>,

    /// Stage parameter records
    #[serde(default, deserialize_with = "null_as_default")]
    pub parameters: Vec<StageParameters>,

    /// Settings shared by every stage
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, MetricflowError> {
        if !path.exists() {
            return Err(MetricflowError::PipelineNotFound {
                path: path.to_path_buf(),
            });
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| MetricflowError::FileReadError {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self, MetricflowError> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    /// Serialize configuration to YAML
    pub fn to_yaml(&self) -> Result<String, MetricflowError> {
        serde_yaml::to_string(self).map_err(Into::into)
    }

    /// Get the parameter record of a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageParameters> {
        self.parameters.iter().find(|s| s.name == name)
    }

    /// All stage names in parameter order
    pub fn stage_names(&self) -> Vec<&str> {
        self.parameters.iter().map(|s| s.name.as_str()).collect()
    }

    /// Distinct cache directories used by the stages, in parameter order
    pub fn cache_directories(&self) -> Vec<&Path> {
        let mut dirs: Vec<&Path> = Vec::new();
        for dir in self.parameters.iter().filter_map(|s| s.cache_directory.as_deref()) {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }
}

/// One entry of the `pipeline` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineEntry {
    /// Stage name
    pub name: String,

    /// Predecessor stage names
    #[serde(default, deserialize_with = "null_as_default")]
    pub follows: Vec<String>,
}

/// One record of the `parameters` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageParameters {
    /// Stage name (must be unique within the pipeline)
    pub name: String,

    /// Compute function type
    #[serde(rename = "type")]
    pub stage_type: String,

    /// Compute function subtype
    #[serde(default)]
    pub subtype: Option<String>,

    /// Consumed fields
    #[serde(default, deserialize_with = "null_as_default")]
    pub input_data: Vec<String>,

    /// Produced fields
    #[serde(default, deserialize_with = "null_as_default")]
    pub output_data: Vec<String>,

    /// Enables caching when set
    #[serde(default)]
    pub cache_directory: Option<PathBuf>,

    /// Fan-out replica template
    #[serde(default)]
    pub multi_stage: bool,

    /// Opaque compute function configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

/// How map-reduce replicas are executed when `number_of_workers > 0`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Bounded pool of OS threads
    #[default]
    Threads,
    /// Pool of long-lived `metricflow worker` processes
    Processes,
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threads => write!(f, "threads"),
            Self::Processes => write!(f, "processes"),
        }
    }
}

/// Global settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Map-reduce pool size; 0 runs replicas sequentially
    #[serde(default)]
    pub number_of_workers: usize,

    /// Pool flavour used when `number_of_workers > 0`
    #[serde(default)]
    pub worker_mode: WorkerMode,

    /// Executable started for process workers (defaults to the current one)
    #[serde(default)]
    pub worker_executable: Option<PathBuf>,
}

/// A `follows` relationship declared in the pipeline section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEdge {
    pub stage: String,
    pub follows: Vec<String>,
}

/// Validated pipeline definition
///
/// Produced by [`PipelineDefinition::parse`]; every structural rule has been
/// checked once this value exists.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Stages in parameter order
    pub stages: Vec<StageDescriptor>,

    /// Declared edges in pipeline order
    pub edges: Vec<PipelineEdge>,

    /// Output field name to index of the producing stage
    pub output_registry: HashMap<String, usize>,

    pub global_settings: GlobalSettings,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
