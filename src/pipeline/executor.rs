// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Pipeline executor
//!
//! A [`Pipeline`] owns everything a run touches: stage nodes, the output
//! registry, the execution order, the worker pool and the caches. Building a
//! new one is the only way to change the configuration, so nothing leaks from
//! one build into the next.

use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, Cache, FilesystemCache};
use crate::errors::MetricflowError;
use crate::pipeline::{
    schedule, DependencyGraph, GlobalSettings, MapReduce, MapReduceParameters, PipelineConfig,
    PipelineDefinition, StageNode, MAP_REDUCE_TYPE,
};
use crate::registry::StageRegistry;
use crate::workers::WorkerPool;

/// Pipeline run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip cache lookups and stores
    pub no_cache: bool,
    /// Aborts the run when cancelled
    pub cancel: CancellationToken,
    /// Maximum wall time of the run
    pub deadline: Option<Duration>,
}

/// How a stage obtained its outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Computed,
    Cached,
    /// Fanned out over this many replicas
    Replicated(usize),
}

/// Result of running one stage
#[derive(Debug, Clone)]
pub struct StageReport {
    pub name: String,
    pub kind: String,
    pub outcome: StageOutcome,
    pub duration: Duration,
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub duration: Duration,
}

impl RunReport {
    pub fn cache_hits(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.outcome == StageOutcome::Cached)
            .count()
    }
}

/// A built, runnable pipeline
pub struct Pipeline {
    stages: Vec<StageNode>,
    output_registry: HashMap<String, usize>,
    execution_order: Vec<usize>,
    graph: DependencyGraph,
    settings: GlobalSettings,
    registry: Arc<StageRegistry>,
    workers: WorkerPool,
    caches: HashMap<usize, Arc<dyn Cache>>,
    map_reduce: HashMap<usize, MapReduceParameters>,
}

impl Pipeline {
    /// Validate `config`, link the graph and compute the execution order
    pub fn build(config: &PipelineConfig, registry: Arc<StageRegistry>) -> Result<Self, MetricflowError> {
        let definition = PipelineDefinition::parse(config)?;

        let mut stages: Vec<StageNode> = definition
            .stages
            .into_iter()
            .map(StageNode::new)
            .collect();
        let graph = DependencyGraph::link(&mut stages, &definition.edges)?;
        let execution_order = schedule(&mut stages, &definition.output_registry)?;
        let workers = WorkerPool::from_settings(&definition.global_settings)?;

        let mut caches: HashMap<usize, Arc<dyn Cache>> = HashMap::new();
        let mut map_reduce = HashMap::new();
        for (idx, stage) in stages.iter().enumerate() {
            if let Some(dir) = &stage.descriptor.cache_directory {
                caches.insert(idx, Arc::new(FilesystemCache::new(dir.clone())));
            }
            if stage.descriptor.stage_type == MAP_REDUCE_TYPE {
                map_reduce.insert(idx, MapReduceParameters::from_stage(&stage.descriptor)?);
            }
        }

        info!(
            "Built pipeline with {} stage(s), workers: {}",
            stages.len(),
            workers
        );

        Ok(Self {
            stages,
            output_registry: definition.output_registry,
            execution_order,
            graph,
            settings: definition.global_settings,
            registry,
            workers,
            caches,
            map_reduce,
        })
    }

    /// Replace the cache of a stage
    pub fn with_cache(mut self, stage: &str, cache: Arc<dyn Cache>) -> Self {
        if let Some(idx) = self.index_of(stage) {
            self.caches.insert(idx, cache);
        }
        self
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    /// Stage names in execution order
    pub fn execution_order(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .map(|&idx| self.stages[idx].name())
            .collect()
    }

    pub fn stages(&self) -> &[StageNode] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageNode> {
        self.index_of(name).map(|idx| &self.stages[idx])
    }

    /// Latest committed value of an output field
    pub fn output(&self, field: &str) -> Option<&Value> {
        let producer = self.output_registry.get(field)?;
        self.stages[*producer].output(field)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Text listing of the execution order
    pub fn plan(&self) -> String {
        self.graph.to_text(&self.stages, &self.execution_order)
    }

    /// Run every stage once with default options
    pub async fn run_iteration(&mut self) -> Result<RunReport, MetricflowError> {
        self.run_with(&RunOptions::default()).await
    }

    /// Run every stage once
    ///
    /// Outputs are committed only if every stage succeeds; after a failure
    /// the outputs of the previous successful run stay in place.
    pub async fn run_with(&mut self, options: &RunOptions) -> Result<RunReport, MetricflowError> {
        let started = Instant::now();
        let deadline = options.deadline.map(|d| started + d);

        let mut produced: Vec<Option<Vec<Value>>> = vec![None; self.stages.len()];
        let mut reports = Vec::with_capacity(self.execution_order.len());

        for &idx in &self.execution_order {
            check_interrupt(options, deadline)?;

            let stage = &self.stages[idx];
            let stage_started = Instant::now();
            debug!("Running stage '{}' ({})", stage.name(), stage.descriptor.kind());

            let inputs = self.gather_inputs(idx, &produced)?;
            let (outputs, outcome) =
                guard(self.dispatch(idx, inputs, options), options, deadline).await?;

            let duration = stage_started.elapsed();
            info!(
                "Stage '{}' done in {:.2}s ({:?})",
                stage.name(),
                duration.as_secs_f64(),
                outcome
            );

            produced[idx] = Some(outputs);
            reports.push(StageReport {
                name: stage.name().to_string(),
                kind: stage.descriptor.kind(),
                outcome,
                duration,
            });
        }

        for (stage, outputs) in self.stages.iter_mut().zip(produced) {
            if outputs.is_some() {
                stage.latest_output_data = outputs;
            }
        }

        Ok(RunReport {
            stages: reports,
            duration: started.elapsed(),
        })
    }

    /// Inputs of stage `idx`, read from this run's outputs
    fn gather_inputs(
        &self,
        idx: usize,
        produced: &[Option<Vec<Value>>],
    ) -> Result<Vec<Value>, MetricflowError> {
        let stage = &self.stages[idx];

        stage
            .descriptor
            .input_fields
            .iter()
            .map(|field| {
                let missing = || MetricflowError::MissingOutputField {
                    stage: stage.name().to_string(),
                    field: field.clone(),
                };

                let producer = *self.output_registry.get(field).ok_or_else(missing)?;
                let slot = self.stages[producer]
                    .descriptor
                    .output_slot(field)
                    .ok_or_else(missing)?;

                produced[producer]
                    .as_ref()
                    .and_then(|outputs| outputs.get(slot))
                    .cloned()
                    .ok_or_else(missing)
            })
            .collect()
    }

    async fn dispatch(
        &self,
        idx: usize,
        inputs: Vec<Value>,
        options: &RunOptions,
    ) -> Result<(Vec<Value>, StageOutcome), MetricflowError> {
        let stage = &self.stages[idx];

        if stage.descriptor.multi_stage {
            let partitions = self.partitions_for(idx, inputs)?;
            let replicas = partitions.len();
            let outputs = MapReduce::new(&self.registry, &self.workers)
                .fan_out(&stage.descriptor.template(), partitions)
                .await?;
            let outputs = vec![crate::pipeline::replica_lists(outputs)];
            return Ok((outputs, StageOutcome::Replicated(replicas)));
        }

        let cache = match (options.no_cache, self.caches.get(&idx)) {
            (false, Some(cache)) if inputs.len() == 1 => {
                if cache_key(&inputs[0]).is_some() {
                    Some(cache)
                } else {
                    warn!(
                        "Stage '{}': input has no metadata, caching skipped",
                        stage.name()
                    );
                    None
                }
            }
            _ => None,
        };

        if let Some(cache) = cache {
            if let Some(outputs) = cache.lookup(&inputs[0]).await {
                if outputs.len() == stage.descriptor.output_fields.len() {
                    debug!("Cache hit for stage '{}'", stage.name());
                    return Ok((outputs, StageOutcome::Cached));
                }
                warn!(
                    "Stage '{}': cached entry has {} output(s), recomputing",
                    stage.name(),
                    outputs.len()
                );
            }
        }

        let cache_input = cache.map(|_| inputs[0].clone());
        let outputs = self.compute(idx, inputs).await?;

        if outputs.len() != stage.descriptor.output_fields.len() {
            return Err(MetricflowError::OutputArityMismatch {
                stage: stage.name().to_string(),
                expected: stage.descriptor.output_fields.len(),
                actual: outputs.len(),
            });
        }

        if let (Some(cache), Some(input)) = (cache, cache_input) {
            cache.store(stage.name(), &input, &outputs).await?;
        }

        Ok((outputs, StageOutcome::Computed))
    }

    async fn compute(&self, idx: usize, inputs: Vec<Value>) -> Result<Vec<Value>, MetricflowError> {
        let stage = &self.stages[idx];

        match self.map_reduce.get(&idx) {
            Some(params) => {
                let input = inputs.into_iter().next().ok_or_else(|| {
                    MetricflowError::MissingOutputField {
                        stage: stage.name().to_string(),
                        field: stage.descriptor.input_fields.join(", "),
                    }
                })?;
                MapReduce::new(&self.registry, &self.workers)
                    .run(stage.name(), params, input)
                    .await
            }
            None => {
                self.registry
                    .invoke_blocking(stage.name().to_string(), stage.descriptor.template(), inputs)
                    .await
            }
        }
    }

    /// Partitions of a multi-stage's single input
    ///
    /// After a map stage the input is the partition list itself. After another
    /// multi-stage it is a list of replica output lists, whose first outputs
    /// are the partitions.
    fn partitions_for(&self, idx: usize, inputs: Vec<Value>) -> Result<Vec<Value>, MetricflowError> {
        let stage = &self.stages[idx];
        let invalid = |reason: &str| MetricflowError::InvalidMultiStage {
            stage: stage.name().to_string(),
            reason: reason.to_string(),
        };

        let Some(Value::Array(items)) = inputs.into_iter().next() else {
            return Err(invalid("input is not a list of partitions"));
        };

        let after_multi_stage = stage
            .descriptor
            .input_fields
            .first()
            .and_then(|field| self.output_registry.get(field))
            .is_some_and(|&producer| self.stages[producer].descriptor.multi_stage);

        if !after_multi_stage {
            return Ok(items);
        }

        items
            .into_iter()
            .map(|outputs| match outputs {
                Value::Array(outputs) => outputs
                    .into_iter()
                    .next()
                    .ok_or_else(|| invalid("a replica produced no output")),
                _ => Err(invalid("replica outputs are not a list")),
            })
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("execution_order", &self.execution_order())
            .field("workers", &self.workers)
            .finish()
    }
}

fn check_interrupt(options: &RunOptions, deadline: Option<Instant>) -> Result<(), MetricflowError> {
    if options.cancel.is_cancelled() {
        return Err(MetricflowError::Cancelled {
            reason: "cancellation requested".to_string(),
        });
    }
    if let Some(deadline) = deadline {
        if Instant::now() >= deadline {
            return Err(deadline_exceeded(options));
        }
    }
    Ok(())
}

fn deadline_exceeded(options: &RunOptions) -> MetricflowError {
    MetricflowError::DeadlineExceeded {
        deadline_ms: options.deadline.unwrap_or_default().as_millis(),
    }
}

/// Race `work` against cancellation and the deadline
async fn guard<T>(
    work: impl Future<Output = Result<T, MetricflowError>>,
    options: &RunOptions,
    deadline: Option<Instant>,
) -> Result<T, MetricflowError> {
    let expired = async {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = options.cancel.cancelled() => Err(MetricflowError::Cancelled {
            reason: "cancellation requested".to_string(),
        }),
        _ = expired => Err(deadline_exceeded(options)),
        result = work => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComputeError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const AB: &str = r#"
pipeline:
- name: A
- name: B
  follows: [A]
parameters:
- name: A
  type: stub
  subtype: source
  output_data: [x]
- name: B
  type: stub
  subtype: append
  input_data: [x]
  output_data: [y]
"#;

    fn stub_registry() -> StageRegistry {
        let mut registry = StageRegistry::with_builtins();
        registry.register_fn("stub", Some("source"), |_, _, _| Ok(vec![json!("1")]));
        registry.register_fn("stub", Some("append"), |_, _, inputs| {
            let x = inputs[0].as_str().unwrap_or_default();
            Ok(vec![json!(format!("{}1", x))])
        });
        registry
    }

    fn build(yaml: &str, registry: StageRegistry) -> Result<Pipeline, MetricflowError> {
        Pipeline::build(&PipelineConfig::from_yaml(yaml).unwrap(), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_a_then_b() {
        let mut pipeline = build(AB, stub_registry()).unwrap();
        assert_eq!(pipeline.execution_order(), vec!["A", "B"]);

        let report = pipeline.run_iteration().await.unwrap();
        assert_eq!(report.stages.len(), 2);

        let b = pipeline.stage("B").unwrap();
        assert_eq!(b.latest_output_data, Some(vec![json!("11")]));
        assert_eq!(pipeline.output("x"), Some(&json!("1")));
    }

    #[tokio::test]
    async fn test_duplicate_output_field_rejected() {
        let yaml = AB.replace("output_data: [y]", "output_data: [x]");
        let err = build(&yaml, stub_registry()).unwrap_err();
        assert!(err.to_string().contains("unique"));
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_outputs() {
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fail.clone();

        let mut registry = stub_registry();
        registry.register_fn("stub", Some("append"), move |_, _, inputs| {
            if flag.load(Ordering::SeqCst) {
                return Err(ComputeError::Failed("boom".into()));
            }
            Ok(vec![json!(format!("{}1", inputs[0].as_str().unwrap_or_default()))])
        });

        let mut pipeline = build(AB, registry).unwrap();
        pipeline.run_iteration().await.unwrap();

        fail.store(true, Ordering::SeqCst);
        let err = pipeline.run_iteration().await.unwrap_err();

        assert_eq!(err.to_string(), "stage 'B' (stub/append) failed: boom");
        assert_eq!(pipeline.output("y"), Some(&json!("11")));
    }

    #[tokio::test]
    async fn test_rebuild_starts_clean() {
        let mut first = build(AB, stub_registry()).unwrap();
        first.run_iteration().await.unwrap();
        assert!(first.output("y").is_some());

        let second = build(AB, stub_registry()).unwrap();
        assert!(second.output("y").is_none());
        assert!(second.stages().iter().all(|s| s.latest_output_data.is_none()));
        assert_eq!(second.execution_order(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_unknown_function_fails_at_dispatch() {
        let mut pipeline = build(AB, StageRegistry::with_builtins()).unwrap();
        let err = pipeline.run_iteration().await.unwrap_err();
        assert!(matches!(err, MetricflowError::ComputeFunctionNotFound { .. }));
        assert!(err.to_string().contains("'A'"));
    }

    #[tokio::test]
    async fn test_output_arity_checked() {
        let mut registry = stub_registry();
        registry.register_fn("stub", Some("source"), |_, _, _| Ok(vec![json!(1), json!(2)]));

        let mut pipeline = build(AB, registry).unwrap();
        let err = pipeline.run_iteration().await.unwrap_err();
        assert!(matches!(
            err,
            MetricflowError::OutputArityMismatch { expected: 1, actual: 2, .. }
        ));
    }

    fn cached_pipeline(dir: &TempDir, calls: Arc<AtomicUsize>) -> Pipeline {
        let yaml = format!(
            r#"
pipeline:
- name: source
- name: extract
  follows: [source]
parameters:
- name: source
  type: ingest
  subtype: dummy
  output_data: [signals]
  config: {{count: 3}}
- name: extract
  type: counted
  input_data: [signals]
  output_data: [extracted]
  cache_directory: {}
"#,
            dir.path().display()
        );

        let mut registry = StageRegistry::with_builtins();
        registry.register_fn("counted", None, move |_, _, inputs| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![json!({
                "signals": inputs[0]["signals"].as_array().map(Vec::len),
                "means": drifting_means(),
            })])
        });
        build(&yaml, registry).unwrap()
    }

    fn drifting_means() -> Vec<f64> {
        (0..5000)
            .map(|i| (i as f64).sqrt() / 7.3 + 1e-7 * i as f64)
            .collect()
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut first = cached_pipeline(&dir, calls.clone());
        first.run_iteration().await.unwrap();
        let mut second = cached_pipeline(&dir, calls.clone());
        let report = second.run_iteration().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.cache_hits(), 1);
        assert_eq!(first.output("extracted"), second.output("extracted"));
        assert_eq!(
            serde_json::to_vec(first.output("extracted").unwrap()).unwrap(),
            serde_json::to_vec(second.output("extracted").unwrap()).unwrap()
        );

        let means: Vec<f64> = second.output("extracted").unwrap()["means"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        assert_eq!(means, drifting_means());
    }

    #[tokio::test]
    async fn test_no_cache_option_recomputes() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = cached_pipeline(&dir, calls.clone());

        let options = RunOptions {
            no_cache: true,
            ..Default::default()
        };
        pipeline.run_with(&options).await.unwrap();
        pipeline.run_with(&options).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_input_without_metadata_skips_cache() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            "{}\n  cache_directory: {}\n",
            AB.trim_end(),
            dir.path().display()
        );

        let mut pipeline = build(&yaml, stub_registry()).unwrap();
        pipeline.run_iteration().await.unwrap();
        pipeline.run_iteration().await.unwrap();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut pipeline = build(AB, stub_registry()).unwrap();
        let options = RunOptions::default();
        options.cancel.cancel();

        let err = pipeline.run_with(&options).await.unwrap_err();
        assert!(matches!(err, MetricflowError::Cancelled { .. }));
        assert!(pipeline.output("x").is_none());
    }

    #[tokio::test]
    async fn test_deadline_interrupts_slow_stage() {
        let mut registry = stub_registry();
        registry.register_fn("stub", Some("append"), |_, _, inputs| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(inputs)
        });

        let mut pipeline = build(AB, registry).unwrap();
        let options = RunOptions {
            deadline: Some(Duration::from_millis(30)),
            ..Default::default()
        };

        let err = pipeline.run_with(&options).await.unwrap_err();
        assert!(matches!(err, MetricflowError::DeadlineExceeded { deadline_ms: 30 }));
        assert!(pipeline.output("x").is_none());
    }

    const MAP_REDUCE_CHAIN: &str = r#"
pipeline:
- name: source
- name: split
  follows: [source]
- name: replicas
  follows: [split]
- name: combine
  follows: [replicas]
parameters:
- name: source
  type: numbers
  output_data: [items]
- name: split
  type: map
  subtype: simple
  input_data: [items]
  output_data: [partitions]
  config: {number: 3}
- name: replicas
  type: square
  input_data: [partitions]
  output_data: [squared_partitions]
  multi_stage: true
- name: combine
  type: reduce
  subtype: simple
  input_data: [squared_partitions]
  output_data: [squared]
global_settings:
  number_of_workers: WORKERS
"#;

    fn numbers_registry(sizes: Arc<std::sync::Mutex<Vec<usize>>>) -> StageRegistry {
        let mut registry = StageRegistry::with_builtins();
        registry.register_fn("numbers", None, |_, _, _| {
            Ok(vec![Value::from((1..=9).collect::<Vec<i64>>())])
        });
        registry.register_fn("square", None, move |_, _, inputs| {
            let items = inputs[0].as_array().cloned().unwrap_or_default();
            sizes.lock().unwrap().push(items.len());
            let squared: Vec<i64> = items
                .iter()
                .filter_map(Value::as_i64)
                .map(|n| n * n)
                .collect();
            Ok(vec![Value::from(squared)])
        });
        registry
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_stage_equivalent_for_any_worker_count() {
        let mut results = Vec::new();

        for workers in [0, 1, 4] {
            let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
            let yaml = MAP_REDUCE_CHAIN.replace("WORKERS", &workers.to_string());
            let mut pipeline = build(&yaml, numbers_registry(sizes.clone())).unwrap();

            let report = pipeline.run_iteration().await.unwrap();
            assert_eq!(report.stages[2].outcome, StageOutcome::Replicated(3));

            let mut sizes = sizes.lock().unwrap().clone();
            sizes.sort();
            assert_eq!(sizes, vec![3, 3, 3]);

            results.push(pipeline.output("squared").cloned().unwrap());
        }

        assert_eq!(results[0], json!([1, 4, 9, 16, 25, 36, 49, 64, 81]));
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
    }

    #[tokio::test]
    async fn test_map_reduce_stage() {
        let yaml = r#"
pipeline:
- name: source
- name: squares
  follows: [source]
parameters:
- name: source
  type: numbers
  output_data: [items]
- name: squares
  type: map_reduce
  input_data: [items]
  output_data: [squared]
  config:
    map_function: {name: split, type: map, subtype: simple, config: {number: 4}}
    compute_function: {name: square, type: square, subtype: any}
    reduce_function: {name: combine, type: reduce, subtype: simple}
"#;
        let sizes = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pipeline = build(yaml, numbers_registry(sizes.clone())).unwrap();
        pipeline.run_iteration().await.unwrap();

        assert_eq!(
            pipeline.output("squared"),
            Some(&json!([1, 4, 9, 16, 25, 36, 49, 64, 81]))
        );
        assert_eq!(*sizes.lock().unwrap(), vec![2, 2, 2, 3]);
    }
}
