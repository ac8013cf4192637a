// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Worker pools for map-reduce fan-out
//!
//! `number_of_workers: 0` runs replicas one after another. Otherwise replicas
//! run on a bounded pool of threads or of `metricflow worker` processes.
//! Results always come back in partition order, and the first failure aborts
//! the replicas still pending.

mod process;

pub use process::{serve, ProcessPool, WorkerReply, WorkerRequest};

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::MetricflowError;
use crate::pipeline::{ComputeTemplate, GlobalSettings, WorkerMode};
use crate::registry::StageRegistry;

/// Executes compute replicas
#[derive(Debug)]
pub enum WorkerPool {
    /// In the calling task, one replica at a time
    Sequential,
    /// Up to `workers` replicas at once on the blocking thread pool
    Threads { workers: usize },
    /// Long-lived worker processes
    Processes(ProcessPool),
}

impl WorkerPool {
    /// Select the pool described by `global_settings`
    pub fn from_settings(settings: &GlobalSettings) -> Result<Self, MetricflowError> {
        Ok(match (settings.number_of_workers, settings.worker_mode) {
            (0, _) => Self::Sequential,
            (workers, WorkerMode::Threads) => Self::Threads { workers },
            (workers, WorkerMode::Processes) => {
                let executable = match &settings.worker_executable {
                    Some(path) => which::which(path).map_err(|e| MetricflowError::WorkerError {
                        message: format!("worker executable '{}' not found: {}", path.display(), e),
                    })?,
                    None => std::env::current_exe()?,
                };
                Self::Processes(ProcessPool::new(executable, workers))
            }
        })
    }

    /// Number of replicas that may run at once
    pub fn size(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Threads { workers } => *workers,
            Self::Processes(pool) => pool.size(),
        }
    }

    /// Run one replica of `template` per partition
    ///
    /// Replica `i` is named `<template>-<i>` and receives partition `i` as its
    /// only input. Output `i` belongs to partition `i`.
    pub async fn run_replicas(
        &self,
        registry: &Arc<StageRegistry>,
        template: &ComputeTemplate,
        partitions: Vec<Value>,
    ) -> Result<Vec<Vec<Value>>, MetricflowError> {
        match self {
            Self::Sequential => {
                let mut outputs = Vec::with_capacity(partitions.len());
                for (i, partition) in partitions.into_iter().enumerate() {
                    let output = registry
                        .invoke_blocking(template.replica_name(i), template.clone(), vec![partition])
                        .await?;
                    outputs.push(output);
                }
                Ok(outputs)
            }
            Self::Threads { workers } => {
                run_on_threads(registry, template, partitions, *workers).await
            }
            Self::Processes(pool) => pool.run(template, partitions).await,
        }
    }
}

impl std::fmt::Display for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Threads { workers } => write!(f, "{} thread(s)", workers),
            Self::Processes(pool) => write!(f, "{} process(es)", pool.size()),
        }
    }
}

async fn run_on_threads(
    registry: &Arc<StageRegistry>,
    template: &ComputeTemplate,
    partitions: Vec<Value>,
    workers: usize,
) -> Result<Vec<Vec<Value>>, MetricflowError> {
    let permits = Arc::new(Semaphore::new(workers));
    let count = partitions.len();
    let mut tasks = JoinSet::new();

    for (i, partition) in partitions.into_iter().enumerate() {
        let permits = Arc::clone(&permits);
        let registry = Arc::clone(registry);
        let template = template.clone();

        tasks.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| MetricflowError::WorkerError {
                    message: e.to_string(),
                })?;
            let output = registry
                .invoke_blocking(template.replica_name(i), template, vec![partition])
                .await?;
            Ok::<_, MetricflowError>((i, output))
        });
    }

    let mut outputs: Vec<Option<Vec<Value>>> = vec![None; count];
    while let Some(joined) = tasks.join_next().await {
        let (i, output) = joined.map_err(|e| MetricflowError::WorkerError {
            message: format!("replica task did not complete: {}", e),
        })??;
        outputs[i] = Some(output);
    }

    outputs
        .into_iter()
        .enumerate()
        .map(|(i, output)| {
            output.ok_or_else(|| MetricflowError::WorkerError {
                message: format!("replica {} produced no result", i),
            })
        })
        .collect()
}
