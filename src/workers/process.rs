// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Process workers
//!
//! Each worker is a `metricflow worker` child process reading one JSON
//! request per line on stdin and answering with one JSON reply per line on
//! stdout. Workers are started on first use and reused across stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::errors::MetricflowError;
use crate::pipeline::ComputeTemplate;
use crate::registry::StageRegistry;

/// One replica to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    /// Replica name used in error messages
    pub stage: String,
    pub template: ComputeTemplate,
    pub inputs: Vec<Value>,
}

/// Answer to a [`WorkerRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerReply {
    Ok { id: u64, outputs: Vec<Value> },
    Error { id: u64, message: String },
}

/// Answer requests from `reader` until it is exhausted
pub async fn serve<R, W>(registry: &StageRegistry, reader: R, mut writer: W) -> Result<(), MetricflowError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => {
                debug!("Worker running '{}'", request.stage);
                match registry.invoke(&request.stage, &request.template, request.inputs) {
                    Ok(outputs) => WorkerReply::Ok {
                        id: request.id,
                        outputs,
                    },
                    Err(e) => WorkerReply::Error {
                        id: request.id,
                        message: e.to_string(),
                    },
                }
            }
            Err(e) => WorkerReply::Error {
                id: 0,
                message: format!("malformed request: {}", e),
            },
        };

        let mut out = serde_json::to_string(&reply)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }

    Ok(())
}

struct WorkerProcess {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    async fn spawn(executable: &Path) -> Result<Self, MetricflowError> {
        let mut child = Command::new(executable)
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MetricflowError::WorkerError {
                message: format!("cannot start worker '{}': {}", executable.display(), e),
            })?;

        let pipes_missing = || MetricflowError::WorkerError {
            message: "worker started without stdio pipes".to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(pipes_missing)?;
        let stdout = child.stdout.take().ok_or_else(pipes_missing)?;

        Ok(Self {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn call(&mut self, request: &WorkerRequest) -> Result<Vec<Value>, MetricflowError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let reply = self
            .stdout
            .next_line()
            .await?
            .ok_or_else(|| MetricflowError::WorkerError {
                message: format!("worker exited while running '{}'", request.stage),
            })?;

        match serde_json::from_str::<WorkerReply>(&reply)? {
            WorkerReply::Ok { id, outputs } if id == request.id => Ok(outputs),
            WorkerReply::Error { message, .. } => Err(MetricflowError::WorkerError { message }),
            WorkerReply::Ok { id, .. } => Err(MetricflowError::WorkerError {
                message: format!("reply {} does not match request {}", id, request.id),
            }),
        }
    }
}

/// Bounded pool of worker processes
pub struct ProcessPool {
    executable: PathBuf,
    size: usize,
    idle: Mutex<Vec<WorkerProcess>>,
    next_id: AtomicU64,
}

impl ProcessPool {
    pub fn new(executable: PathBuf, size: usize) -> Self {
        Self {
            executable,
            size: size.max(1),
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run one replica per partition; partitions are dealt round-robin
    pub async fn run(
        &self,
        template: &ComputeTemplate,
        partitions: Vec<Value>,
    ) -> Result<Vec<Vec<Value>>, MetricflowError> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }

        let mut idle = self.idle.lock().await;
        let mut workers = std::mem::take(&mut *idle);
        let lanes = self.size.min(partitions.len());

        while workers.len() < lanes {
            workers.push(WorkerProcess::spawn(&self.executable).await?);
            info!("Started worker process {}/{}", workers.len(), self.size);
        }
        let spare = workers.split_off(lanes);

        let count = partitions.len();
        let mut queues: Vec<Vec<(usize, WorkerRequest)>> = vec![Vec::new(); lanes];
        for (i, partition) in partitions.into_iter().enumerate() {
            queues[i % lanes].push((
                i,
                WorkerRequest {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    stage: template.replica_name(i),
                    template: template.clone(),
                    inputs: vec![partition],
                },
            ));
        }

        let mut tasks = JoinSet::new();
        for (mut worker, queue) in workers.into_iter().zip(queues) {
            tasks.spawn(async move {
                let mut results = Vec::with_capacity(queue.len());
                for (i, request) in queue {
                    results.push((i, worker.call(&request).await?));
                }
                Ok::<_, MetricflowError>((worker, results))
            });
        }

        let mut outputs: Vec<Option<Vec<Value>>> = vec![None; count];
        let mut returned = spare;

        while let Some(joined) = tasks.join_next().await {
            let joined = joined.map_err(|e| MetricflowError::WorkerError {
                message: format!("worker task did not complete: {}", e),
            });

            match joined {
                Ok(Ok((worker, results))) => {
                    returned.push(worker);
                    for (i, output) in results {
                        outputs[i] = Some(output);
                    }
                }
                Ok(Err(e)) | Err(e) => {
                    // Lanes still running are aborted and their processes killed
                    *idle = returned;
                    return Err(e);
                }
            }
        }

        *idle = returned;

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
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("executable", &self.executable)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: u64, subtype: &str, inputs: Vec<Value>) -> WorkerRequest {
        WorkerRequest {
            id,
            stage: format!("split-{}", id),
            template: ComputeTemplate {
                name: "split".into(),
                stage_type: "map".into(),
                subtype: Some(subtype.into()),
                config: json!({"number": 2}),
            },
            inputs,
        }
    }

    async fn exchange(input: String) -> Vec<WorkerReply> {
        let registry = StageRegistry::with_builtins();
        let mut output = Vec::new();
        serve(&registry, BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_serve_answers_in_order() {
        let input = [
            serde_json::to_string(&request(7, "simple", vec![json!([1, 2, 3, 4])])).unwrap(),
            String::new(),
            serde_json::to_string(&request(8, "unknown", vec![json!([1])])).unwrap(),
            "not json".to_string(),
        ]
        .join("\n");

        let replies = exchange(input).await;
        assert_eq!(replies.len(), 3);
        assert_eq!(
            replies[0],
            WorkerReply::Ok {
                id: 7,
                outputs: vec![json!([[1, 2], [3, 4]])]
            }
        );
        assert!(
            matches!(&replies[1], WorkerReply::Error { id: 8, message } if message.contains("no compute function"))
        );
        assert!(
            matches!(&replies[2], WorkerReply::Error { id: 0, message } if message.contains("malformed"))
        );
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = WorkerReply::Ok {
            id: 3,
            outputs: vec![json!(1)],
        };
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"status":"ok","id":3,"outputs":[1]}"#
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_worker_error() {
        let pool = ProcessPool::new(PathBuf::from("/nonexistent/metricflow"), 2);
        let template = request(1, "simple", vec![]).template;

        let err = pool.run(&template, vec![json!([1])]).await.unwrap_err();
        assert!(matches!(err, MetricflowError::WorkerError { .. }));
        assert!(pool.run(&template, vec![]).await.unwrap().is_empty());
    }
}
