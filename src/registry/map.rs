// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Map functions
//!
//! A map function turns one input into an ordered list of partitions. Its
//! single output is that list.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{join_signals, single_input, split_signals, typed_config, ComputeError, StageRegistry};

/// Config of `map/simple`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MapSimple {
    /// Number of partitions
    number: i64,
}

/// Config of `map/by_name`
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MapByName {
    /// Regex matched against `metadata.__name__`; empty keeps one partition
    #[serde(default)]
    name_pattern: String,
}

pub(super) fn register(registry: &mut StageRegistry) {
    registry.register_fn("map", Some("simple"), |_, config, inputs| {
        let config: MapSimple = typed_config(config)?;
        let partitions = split_evenly(single_input(inputs)?, config.number)?;
        Ok(vec![Value::Array(partitions)])
    });

    registry.register_fn("map", Some("by_name"), |_, config, inputs| {
        let config: MapByName = typed_config(config)?;
        let partitions = cluster_by_name(single_input(inputs)?, &config.name_pattern)?;
        Ok(vec![Value::Array(partitions)])
    });
}

/// Split into `number` partitions of equal size; the remainder goes last
fn split_evenly(input: Value, number: i64) -> Result<Vec<Value>, ComputeError> {
    if number <= 0 {
        return Err(ComputeError::InvalidConfig(format!(
            "illegal number of output lists for split: {}",
            number
        )));
    }

    let number = number as usize;
    let (metadata, mut items) = split_signals(input)?;
    let size = items.len() / number;

    let mut partitions = Vec::with_capacity(number);
    for _ in 0..number - 1 {
        let rest = items.split_off(size);
        partitions.push(join_signals(metadata.clone(), items));
        items = rest;
    }
    partitions.push(join_signals(metadata, items));

    Ok(partitions)
}

/// Group items by the part of their name matched by `pattern`
///
/// Groups keep first-seen order; items whose name does not match are dropped.
fn cluster_by_name(input: Value, pattern: &str) -> Result<Vec<Value>, ComputeError> {
    if pattern.is_empty() {
        return Ok(vec![input]);
    }

    let regex = Regex::new(pattern)
        .map_err(|e| ComputeError::InvalidConfig(format!("bad name_pattern: {}", e)))?;
    let (metadata, items) = split_signals(input)?;

    let mut groups: Vec<Vec<Value>> = Vec::new();
    let mut group_of: HashMap<String, usize> = HashMap::new();

    for item in items {
        let key = match item
            .pointer("/metadata/__name__")
            .and_then(Value::as_str)
            .and_then(|name| regex.find(name))
        {
            Some(m) => m.as_str().to_string(),
            None => continue,
        };

        let index = *group_of.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[index].push(item);
    }

    Ok(groups
        .into_iter()
        .map(|group| join_signals(metadata.clone(), group))
        .collect())
}
