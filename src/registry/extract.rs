// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Feature extraction

use serde::Deserialize;
use serde_json::{json, Value};

use super::{join_signals, single_input, split_signals, typed_config, ComputeError, StageRegistry};

/// Config of `extract/basic_stats`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BasicStats {
    /// Field of each signal holding its samples
    #[serde(default = "default_values_field")]
    values_field: String,
}

fn default_values_field() -> String {
    "values".to_string()
}

pub(super) fn register(registry: &mut StageRegistry) {
    registry.register_fn("extract", Some("basic_stats"), |_, config, inputs| {
        let config: BasicStats = typed_config(config)?;
        let (metadata, items) = split_signals(single_input(inputs)?)?;

        let extracted = items
            .into_iter()
            .map(|signal| with_features(signal, &config.values_field))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(vec![join_signals(metadata, extracted)])
    });
}

/// Attach `features {count, min, max, mean}` to one signal
fn with_features(mut signal: Value, values_field: &str) -> Result<Value, ComputeError> {
    let values: Vec<f64> = match signal.get(values_field) {
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_f64).collect(),
        Some(_) => {
            return Err(ComputeError::InvalidInput(format!(
                "'{}' must be a list of numbers",
                values_field
            )))
        }
        None => Vec::new(),
    };

    let features = if values.is_empty() {
        json!({ "count": 0, "min": null, "max": null, "mean": null })
    } else {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        json!({ "count": values.len(), "min": min, "max": max, "mean": mean })
    };

    match signal.as_object_mut() {
        Some(object) => {
            object.insert("features".to_string(), features);
            Ok(signal)
        }
        None => Err(ComputeError::InvalidInput(
            "each signal must be an object".to_string(),
        )),
    }
}
