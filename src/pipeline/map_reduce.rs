// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Stage-local map-reduce
//!
//! Map splits one input into ordered partitions, a compute template is run
//! once per partition by the worker pool, and reduce combines the replica
//! outputs in partition order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::errors::MetricflowError;
use crate::pipeline::{ComputeTemplate, StageDescriptor};
use crate::registry::StageRegistry;
use crate::workers::WorkerPool;

/// Stage type running a whole map → compute → reduce chain
pub const MAP_REDUCE_TYPE: &str = "map_reduce";

/// Stage type whose output is a list of partitions
pub const MAP_TYPE: &str = "map";

/// One function of a map-reduce config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapReduceSubsection {
    pub name: String,
    #[serde(rename = "type")]
    pub stage_type: String,
    pub subtype: String,
    #[serde(default)]
    pub config: Value,
}

impl MapReduceSubsection {
    pub fn template(&self) -> ComputeTemplate {
        ComputeTemplate {
            name: self.name.clone(),
            stage_type: self.stage_type.clone(),
            subtype: Some(self.subtype.clone()),
            config: self.config.clone(),
        }
    }
}

/// Config of a `map_reduce` stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapReduceParameters {
    pub map_function: MapReduceSubsection,
    pub compute_function: MapReduceSubsection,
    pub reduce_function: MapReduceSubsection,
}

impl MapReduceParameters {
    /// Parse the config of a `map_reduce` stage
    pub fn from_stage(stage: &StageDescriptor) -> Result<Self, MetricflowError> {
        serde_json::from_value(stage.config.clone()).map_err(|e| MetricflowError::InvalidMapReduce {
            stage: stage.name.clone(),
            reason: e.to_string(),
        })
    }

    pub fn functions(&self) -> [&MapReduceSubsection; 3] {
        [&self.map_function, &self.compute_function, &self.reduce_function]
    }
}

/// Map-reduce runner bound to a registry and a worker pool
pub struct MapReduce<'a> {
    registry: &'a Arc<StageRegistry>,
    workers: &'a WorkerPool,
}

impl<'a> MapReduce<'a> {
    pub fn new(registry: &'a Arc<StageRegistry>, workers: &'a WorkerPool) -> Self {
        Self { registry, workers }
    }

    /// Run map, fan-out and reduce over `input`
    pub async fn run(
        &self,
        stage: &str,
        params: &MapReduceParameters,
        input: Value,
    ) -> Result<Vec<Value>, MetricflowError> {
        let map = params.map_function.template();
        let mapped = self
            .registry
            .invoke_blocking(map.name.clone(), map, vec![input])
            .await?;
        let partitions = partitions_of(stage, mapped)?;

        let replica_outputs = self
            .fan_out(&params.compute_function.template(), partitions)
            .await?;

        let reduce = params.reduce_function.template();
        self.registry
            .invoke_blocking(reduce.name.clone(), reduce, vec![replica_lists(replica_outputs)])
            .await
    }

    /// Run one replica of `template` per partition, results in partition order
    pub async fn fan_out(
        &self,
        template: &ComputeTemplate,
        partitions: Vec<Value>,
    ) -> Result<Vec<Vec<Value>>, MetricflowError> {
        debug!(
            "Fanning out '{}' over {} partition(s) on {}",
            template.name,
            partitions.len(),
            self.workers
        );
        self.workers
            .run_replicas(self.registry, template, partitions)
            .await
    }
}

/// Partitions returned by a map function: its first output, a list
pub fn partitions_of(stage: &str, map_outputs: Vec<Value>) -> Result<Vec<Value>, MetricflowError> {
    match map_outputs.into_iter().next() {
        Some(Value::Array(partitions)) => Ok(partitions),
        _ => Err(MetricflowError::InvalidMapReduce {
            stage: stage.to_string(),
            reason: "map function did not return a list of partitions".to_string(),
        }),
    }
}

/// Ordered replica output lists as one value, the input of reduce
pub fn replica_lists(outputs: Vec<Vec<Value>>) -> Value {
    Value::Array(outputs.into_iter().map(Value::Array).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{GlobalSettings, WorkerMode};
    use crate::registry::ComputeError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params(number: usize) -> MapReduceParameters {
        serde_json::from_value(json!({
            "map_function": {"name": "split", "type": "map", "subtype": "simple", "config": {"number": number}},
            "compute_function": {"name": "tag", "type": "tag", "subtype": "size"},
            "reduce_function": {"name": "join", "type": "reduce", "subtype": "simple"},
        }))
        .unwrap()
    }

    fn registry(sizes: Arc<std::sync::Mutex<Vec<usize>>>) -> Arc<StageRegistry> {
        let mut registry = StageRegistry::with_builtins();
        registry.register_fn("tag", Some("size"), move |_, _, inputs| {
            let items = inputs[0]
                .as_array()
                .cloned()
                .ok_or_else(|| ComputeError::InvalidInput("list expected".into()))?;
            sizes.lock().unwrap().push(items.len());
            Ok(vec![Value::Array(items)])
        });
        Arc::new(registry)
    }

    fn pool(workers: usize) -> WorkerPool {
        WorkerPool::from_settings(&GlobalSettings {
            number_of_workers: workers,
            worker_mode: WorkerMode::Threads,
            worker_executable: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_nine_items_three_partitions() {
        let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = registry(sizes.clone());
        let workers = pool(0);
        let input: Value = (1..=9).collect::<Vec<i32>>().into();

        let out = MapReduce::new(&registry, &workers)
            .run("mr", &params(3), input)
            .await
            .unwrap();

        assert_eq!(out, vec![json!([1, 2, 3, 4, 5, 6, 7, 8, 9])]);
        assert_eq!(*sizes.lock().unwrap(), vec![3, 3, 3]);
    }

    #[tokio::test]
    async fn test_same_result_for_any_worker_count() {
        let input: Value = (0..23).collect::<Vec<i32>>().into();
        let mut results = Vec::new();

        for workers in [0, 1, 4] {
            let registry = registry(Arc::new(std::sync::Mutex::new(Vec::new())));
            let pool = pool(workers);
            let out = MapReduce::new(&registry, &pool)
                .run("mr", &params(5), input.clone())
                .await
                .unwrap();
            results.push(out);
        }

        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
    }

    #[tokio::test]
    async fn test_replica_failure_fails_the_stage() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut registry = StageRegistry::with_builtins();
        registry.register_fn("tag", Some("size"), move |_, _, inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            if inputs[0] == json!([3, 4]) {
                return Err(ComputeError::Failed("bad partition".into()));
            }
            Ok(inputs)
        });
        let registry = Arc::new(registry);
        let workers = pool(0);

        let err = MapReduce::new(&registry, &workers)
            .run("mr", &params(3), json!([1, 2, 3, 4, 5, 6]))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("tag-1"));
        assert!(err.to_string().contains("bad partition"));
        // Sequential pool stops at the failing replica
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_partitions_of_rejects_non_list() {
        assert!(partitions_of("mr", vec![json!({"not": "a list"})]).is_err());
        assert!(partitions_of("mr", vec![]).is_err());
        assert_eq!(partitions_of("mr", vec![json!([1, 2])]).unwrap().len(), 2);
    }

    #[test]
    fn test_parameters_reject_unknown_keys() {
        let stage = StageDescriptor {
            name: "mr".into(),
            stage_type: MAP_REDUCE_TYPE.into(),
            subtype: None,
            input_fields: vec!["x".into()],
            output_fields: vec!["y".into()],
            config: json!({
                "map_function": {"name": "m", "type": "map", "subtype": "simple"},
                "compute_function": {"name": "c", "type": "extract", "subtype": "basic_stats"},
                "reduce_function": {"name": "r", "type": "reduce", "subtype": "simple"},
                "shuffle": true,
            }),
            cache_directory: None,
            multi_stage: false,
        };

        let err = MapReduceParameters::from_stage(&stage).unwrap_err();
        assert!(err.to_string().contains("shuffle"));
    }
}
