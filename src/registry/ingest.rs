// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Ingest functions: source stages that produce a signals document

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;

use super::{join_signals, split_signals, typed_config, ComputeError, StageRegistry};

/// Config of `ingest/file`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngestFile {
    /// JSON document with `metadata` and `signals`
    file_name: PathBuf,

    /// Keep only signals whose `__name__` matches
    #[serde(default)]
    name_filter: Option<String>,
}

/// Config of `ingest/dummy`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IngestDummy {
    #[serde(default = "default_count")]
    count: usize,

    #[serde(default = "default_name_prefix")]
    name_prefix: String,

    #[serde(default = "default_points")]
    points: usize,
}

fn default_count() -> usize {
    10
}

fn default_name_prefix() -> String {
    "dummy_metric".to_string()
}

fn default_points() -> usize {
    5
}

pub(super) fn register(registry: &mut StageRegistry) {
    registry.register_fn("ingest", Some("file"), |_, config, _| {
        let config: IngestFile = typed_config(config)?;
        Ok(vec![load_file(&config)?])
    });

    registry.register_fn("ingest", Some("dummy"), |_, config, _| {
        let config: IngestDummy = typed_config(config)?;
        Ok(vec![dummy_signals(&config)])
    });
}

fn load_file(config: &IngestFile) -> Result<Value, ComputeError> {
    let content = std::fs::read_to_string(&config.file_name).map_err(|e| {
        ComputeError::Failed(format!(
            "cannot read '{}': {}",
            config.file_name.display(),
            e
        ))
    })?;

    let document: Value = serde_json::from_str(&content).map_err(|e| {
        ComputeError::InvalidInput(format!(
            "'{}' is not valid JSON: {}",
            config.file_name.display(),
            e
        ))
    })?;

    // Always hand a metadata-carrying document downstream so caching works
    let (metadata, items) = split_signals(document)?;
    let metadata = metadata.unwrap_or_else(|| json!({ "source": config.file_name }));

    let items = match &config.name_filter {
        Some(pattern) => {
            let regex = Regex::new(pattern)
                .map_err(|e| ComputeError::InvalidConfig(format!("bad name_filter: {}", e)))?;
            items
                .into_iter()
                .filter(|item| {
                    item.pointer("/metadata/__name__")
                        .and_then(Value::as_str)
                        .is_some_and(|name| regex.is_match(name))
                })
                .collect()
        }
        None => items,
    };

    Ok(join_signals(Some(metadata), items))
}

/// Deterministic synthetic signals; the same config always yields the same data
fn dummy_signals(config: &IngestDummy) -> Value {
    let signals = (0..config.count)
        .map(|i| {
            let values: Vec<f64> = (0..config.points)
                .map(|p| ((i + 1) * (p + 1)) as f64)
                .collect();
            json!({
                "metadata": { "__name__": format!("{}_{}", config.name_prefix, i) },
                "values": values,
            })
        })
        .collect();

    let metadata = json!({
        "source": "dummy",
        "count": config.count,
        "points": config.points,
        "name_prefix": config.name_prefix,
    });

    join_signals(Some(metadata), signals)
}
