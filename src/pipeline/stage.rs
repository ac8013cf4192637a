// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Stage descriptors and their per-pipeline runtime state

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::pipeline::StageParameters;

/// Immutable contract of one pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub name: String,
    pub stage_type: String,
    pub subtype: Option<String>,
    pub input_fields: Vec<String>,
    pub output_fields: Vec<String>,
    pub config: Value,
    pub cache_directory: Option<PathBuf>,
    pub multi_stage: bool,
}

impl StageDescriptor {
    /// Whether this stage starts the pipeline
    pub fn is_source(&self) -> bool {
        self.input_fields.is_empty()
    }

    /// Whether caching was requested for this stage
    pub fn is_cached(&self) -> bool {
        self.cache_directory.is_some()
    }

    /// Position of `field` in the output list
    pub fn output_slot(&self, field: &str) -> Option<usize> {
        self.output_fields.iter().position(|f| f == field)
    }

    /// `type/subtype` label used in logs and reports
    pub fn kind(&self) -> String {
        match &self.subtype {
            Some(subtype) => format!("{}/{}", self.stage_type, subtype),
            None => self.stage_type.clone(),
        }
    }

    /// The compute part of this stage, used to spawn replicas
    pub fn template(&self) -> ComputeTemplate {
        ComputeTemplate {
            name: self.name.clone(),
            stage_type: self.stage_type.clone(),
            subtype: self.subtype.clone(),
            config: self.config.clone(),
        }
    }
}

impl From<StageParameters> for StageDescriptor {
    fn from(params: StageParameters) -> Self {
        Self {
            name: params.name,
            stage_type: params.stage_type,
            subtype: params.subtype,
            input_fields: params.input_data,
            output_fields: params.output_data,
            config: params.config,
            cache_directory: params.cache_directory,
            multi_stage: params.multi_stage,
        }
    }
}

/// Everything needed to invoke a compute function, without pipeline wiring
///
/// Replicas share one template and differ only by their suffixed name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub config: Value,
}

impl ComputeTemplate {
    /// Name of the replica running partition `index`
    pub fn replica_name(&self, index: usize) -> String {
        format!("{}-{}", self.name, index)
    }
}

/// DFS marker used by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisitMark {
    #[default]
    Unvisited,
    InProgress,
    Scheduled,
}

/// A stage inside a built pipeline: descriptor plus runtime state
#[derive(Debug, Clone)]
pub struct StageNode {
    pub descriptor: StageDescriptor,
    /// Names of predecessor stages
    pub follows: Vec<String>,
    /// Indices of successor stages
    pub followers: Vec<usize>,
    /// Outputs of the last successful run, one slot per output field
    pub latest_output_data: Option<Vec<Value>>,
    pub(crate) mark: VisitMark,
}

impl StageNode {
    pub fn new(descriptor: StageDescriptor) -> Self {
        Self {
            descriptor,
            follows: Vec::new(),
            followers: Vec::new(),
            latest_output_data: None,
            mark: VisitMark::Unvisited,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_scheduled(&self) -> bool {
        self.mark == VisitMark::Scheduled
    }

    /// Latest value of one output field
    pub fn output(&self, field: &str) -> Option<&Value> {
        let slot = self.descriptor.output_slot(field)?;
        self.latest_output_data.as_ref()?.get(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor() -> StageDescriptor {
        StageDescriptor {
            name: "insights".into(),
            stage_type: "insights".into(),
            subtype: Some("pearson".into()),
            input_fields: vec!["extracted".into()],
            output_fields: vec!["keep".into(), "reduce".into(), "text".into()],
            config: json!({"threshold": 0.95}),
            cache_directory: None,
            multi_stage: false,
        }
    }

    #[test]
    fn test_output_slot_lookup() {
        let mut node = StageNode::new(descriptor());
        assert_eq!(node.descriptor.output_slot("reduce"), Some(1));
        assert!(node.output("reduce").is_none());

        node.latest_output_data = Some(vec![json!(1), json!(2), json!(3)]);
        assert_eq!(node.output("text"), Some(&json!(3)));
        assert!(node.output("missing").is_none());
    }

    #[test]
    fn test_template_and_replica_names() {
        let template = descriptor().template();
        assert_eq!(template.replica_name(0), "insights-0");
        assert_eq!(template.replica_name(12), "insights-12");
        assert_eq!(template.config["threshold"], 0.95);
    }

    #[test]
    fn test_kind_label() {
        let mut d = descriptor();
        assert_eq!(d.kind(), "insights/pearson");
        d.subtype = None;
        assert_eq!(d.kind(), "insights");
        assert!(!d.is_source());
        assert!(!d.is_cached());
    }
}
