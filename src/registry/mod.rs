// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Stage type registry
//!
//! Maps `(type, subtype)` to a compute function. The registry is populated
//! once, before any pipeline runs, and is only consulted at execution time.
//! Compute functions are opaque to the engine: they receive the stage config
//! verbatim plus an ordered list of inputs, and return an ordered list of
//! outputs.

mod extract;
mod ingest;
mod map;
mod reduce;

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::errors::MetricflowError;
use crate::pipeline::ComputeTemplate;

/// Failure reported by a compute function
///
/// The engine wraps it with the stage name and `type/subtype`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),
}

/// A compute function selected by `(type, subtype)`
pub trait ComputeFunction: Send + Sync {
    /// Run the function
    ///
    /// # Arguments
    /// * `subtype` - The stage subtype, for functions registered per type
    /// * `config` - The stage config, passed through unchanged
    /// * `inputs` - One value per declared input field, in order
    fn compute(
        &self,
        subtype: Option<&str>,
        config: &Value,
        inputs: Vec<Value>,
    ) -> Result<Vec<Value>, ComputeError>;
}

struct FnCompute<F>(F);

impl<F> ComputeFunction for FnCompute<F>
where
    F: Fn(Option<&str>, &Value, Vec<Value>) -> Result<Vec<Value>, ComputeError> + Send + Sync,
{
    fn compute(
        &self,
        subtype: Option<&str>,
        config: &Value,
        inputs: Vec<Value>,
    ) -> Result<Vec<Value>, ComputeError> {
        (self.0)(subtype, config, inputs)
    }
}

type RegistryKey = (String, Option<String>);

/// Dispatch table of compute functions
#[derive(Default, Clone)]
pub struct StageRegistry {
    functions: HashMap<RegistryKey, Arc<dyn ComputeFunction>>,
}

impl StageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in compute functions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        ingest::register(&mut registry);
        extract::register(&mut registry);
        map::register(&mut registry);
        reduce::register(&mut registry);
        registry
    }

    /// Register a compute function
    ///
    /// A `None` subtype registers the function for every subtype of
    /// `stage_type` that has no exact registration.
    pub fn register(
        &mut self,
        stage_type: &str,
        subtype: Option<&str>,
        function: Arc<dyn ComputeFunction>,
    ) {
        self.functions
            .insert((stage_type.to_string(), subtype.map(String::from)), function);
    }

    /// Register a closure as a compute function
    pub fn register_fn<F>(&mut self, stage_type: &str, subtype: Option<&str>, function: F)
    where
        F: Fn(Option<&str>, &Value, Vec<Value>) -> Result<Vec<Value>, ComputeError>
            + Send
            + Sync
            + 'static,
    {
        self.register(stage_type, subtype, Arc::new(FnCompute(function)));
    }

    /// Resolve the function for `(type, subtype)`, falling back to the type alone
    pub fn resolve(&self, stage_type: &str, subtype: Option<&str>) -> Option<Arc<dyn ComputeFunction>> {
        let exact = (stage_type.to_string(), subtype.map(String::from));
        let any = (stage_type.to_string(), None);

        self.functions
            .get(&exact)
            .or_else(|| self.functions.get(&any))
            .cloned()
    }

    /// Whether `(type, subtype)` can be resolved
    pub fn contains(&self, stage_type: &str, subtype: Option<&str>) -> bool {
        self.resolve(stage_type, subtype).is_some()
    }

    /// Registered keys as `type/subtype` labels, sorted
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self
            .functions
            .keys()
            .map(|(t, s)| match s {
                Some(s) => format!("{}/{}", t, s),
                None => format!("{}/*", t),
            })
            .collect();
        labels.sort();
        labels
    }

    /// Resolve and run the function of `template` under the name `stage`
    pub fn invoke(
        &self,
        stage: &str,
        template: &ComputeTemplate,
        inputs: Vec<Value>,
    ) -> Result<Vec<Value>, MetricflowError> {
        let function = self
            .resolve(&template.stage_type, template.subtype.as_deref())
            .ok_or_else(|| MetricflowError::ComputeFunctionNotFound {
                stage: stage.to_string(),
                stage_type: template.stage_type.clone(),
                subtype: template.subtype.clone(),
            })?;

        function
            .compute(template.subtype.as_deref(), &template.config, inputs)
            .map_err(|e| match e {
                ComputeError::InvalidConfig(reason) => MetricflowError::InvalidStageConfig {
                    stage: stage.to_string(),
                    stage_type: template.stage_type.clone(),
                    subtype: template.subtype.clone(),
                    reason,
                },
                other => MetricflowError::ComputeFailed {
                    stage: stage.to_string(),
                    stage_type: template.stage_type.clone(),
                    subtype: template.subtype.clone(),
                    message: other.to_string(),
                },
            })
    }

    /// Same as [`invoke`](Self::invoke), on the blocking thread pool
    pub async fn invoke_blocking(
        self: &Arc<Self>,
        stage: String,
        template: ComputeTemplate,
        inputs: Vec<Value>,
    ) -> Result<Vec<Value>, MetricflowError> {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || registry.invoke(&stage, &template, inputs))
            .await
            .map_err(|e| MetricflowError::WorkerError {
                message: format!("compute task did not complete: {}", e),
            })?
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("functions", &self.labels())
            .finish()
    }
}

/// Deserialize a stage config into its typed form; `null` reads as `{}`
pub fn typed_config<T: DeserializeOwned>(config: &Value) -> Result<T, ComputeError> {
    let config = if config.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };

    serde_json::from_value(config).map_err(|e| ComputeError::InvalidConfig(e.to_string()))
}

/// Take the only input of a single-input function
pub fn single_input(inputs: Vec<Value>) -> Result<Value, ComputeError> {
    let count = inputs.len();
    let mut inputs = inputs.into_iter();
    match (inputs.next(), inputs.next()) {
        (Some(input), None) => Ok(input),
        _ => Err(ComputeError::InvalidInput(format!(
            "expected exactly one input, got {}",
            count
        ))),
    }
}

/// Split a signals value into its metadata and items
///
/// Accepts either a bare list of items or a `{metadata, signals}` document.
pub fn split_signals(value: Value) -> Result<(Option<Value>, Vec<Value>), ComputeError> {
    match value {
        Value::Array(items) => Ok((None, items)),
        Value::Object(mut doc) => match doc.remove("signals") {
            Some(Value::Array(items)) => {
                let metadata = doc.remove("metadata").unwrap_or(Value::Null);
                Ok((Some(metadata), items))
            }
            _ => Err(ComputeError::InvalidInput(
                "expected a 'signals' list".to_string(),
            )),
        },
        other => Err(ComputeError::InvalidInput(format!(
            "expected a list or a signals document, got {}",
            json_kind(&other)
        ))),
    }
}

/// Inverse of [`split_signals`]
pub fn join_signals(metadata: Option<Value>, items: Vec<Value>) -> Value {
    match metadata {
        Some(metadata) => serde_json::json!({ "metadata": metadata, "signals": items }),
        None => Value::Array(items),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
