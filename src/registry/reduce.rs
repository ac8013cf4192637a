// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Reduce functions
//!
//! A reduce function receives one input: the ordered list of per-partition
//! output lists produced by the replicas.

use serde::Deserialize;
use serde_json::Value;

use super::{join_signals, single_input, split_signals, typed_config, ComputeError, StageRegistry};

/// Config of `reduce/simple` (no options)
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReduceSimple {}

pub(super) fn register(registry: &mut StageRegistry) {
    registry.register_fn("reduce", Some("simple"), |_, config, inputs| {
        let _: ReduceSimple = typed_config(config)?;
        Ok(vec![concatenate(single_input(inputs)?)?])
    });
}

/// Concatenate the first output of every partition, in order
///
/// The combined value keeps the metadata of the first partition.
fn concatenate(partitions: Value) -> Result<Value, ComputeError> {
    let Value::Array(partitions) = partitions else {
        return Err(ComputeError::InvalidInput(
            "reduce expects a list of partition outputs".to_string(),
        ));
    };

    let mut combined_metadata = None;
    let mut combined = Vec::new();

    for (index, outputs) in partitions.into_iter().enumerate() {
        let first = match outputs {
            Value::Array(outputs) => outputs.into_iter().next(),
            _ => None,
        }
        .ok_or_else(|| {
            ComputeError::InvalidInput(format!("partition {} produced no output", index))
        })?;

        let (metadata, items) = split_signals(first)?;
        if index == 0 {
            combined_metadata = metadata;
        }
        combined.extend(items);
    }

    Ok(join_signals(combined_metadata, combined))
}
