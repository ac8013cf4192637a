// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! End-to-end tests of the metricflow binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const PIPELINE: &str = r#"
pipeline:
- name: source
- name: split
  follows: [source]
- name: stats
  follows: [split]
- name: combine
  follows: [stats]
parameters:
- name: source
  type: ingest
  subtype: dummy
  output_data: [signals]
  config:
    count: 6
- name: split
  type: map
  subtype: simple
  input_data: [signals]
  output_data: [partitions]
  config:
    number: 3
- name: stats
  type: extract
  subtype: basic_stats
  input_data: [partitions]
  output_data: [partition_features]
  multi_stage: true
- name: combine
  type: reduce
  subtype: simple
  input_data: [partition_features]
  output_data: [features]
global_settings:
  number_of_workers: 2
"#;

const CACHED: &str = r#"
pipeline:
- name: source
- name: extract
  follows: [source]
parameters:
- name: source
  type: ingest
  subtype: dummy
  output_data: [signals]
- name: extract
  type: extract
  subtype: basic_stats
  input_data: [signals]
  output_data: [extracted]
  cache_directory: cache
"#;

fn metricflow() -> Command {
    let mut cmd = Command::cargo_bin("metricflow").unwrap();
    cmd.env("NO_COLOR", "1");
    cmd
}

fn project(yaml: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("metricflow.yaml"), yaml).unwrap();
    dir
}

fn in_dir(dir: &Path) -> Command {
    let mut cmd = metricflow();
    cmd.arg("-C").arg(dir);
    cmd
}

#[test]
fn test_validate_accepts_pipeline() {
    let dir = project(PIPELINE);

    in_dir(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pipeline is valid!"));
}

#[test]
fn test_validate_rejects_duplicate_output() {
    let dir = project(&CACHED.replace("output_data: [extracted]", "output_data: [signals]"));

    in_dir(dir.path())
        .arg("validate")
        .assert()
        .failure()
        .stdout(predicate::str::contains("unique"));
}

#[test]
fn test_missing_pipeline_file() {
    let dir = TempDir::new().unwrap();

    in_dir(dir.path())
        .args(["run", "-p", "absent.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Pipeline file not found"));
}

#[test]
fn test_graph_mermaid() {
    let dir = project(PIPELINE);

    let output = in_dir(dir.path())
        .args(["graph", "-f", "mermaid"])
        .output()
        .unwrap();
    assert!(output.status.success());

    insta::assert_snapshot!(String::from_utf8_lossy(&output.stdout), @r###"
    graph TD
        source[source]
        split[split]
        stats[stats]
        combine[combine]
        source --> split
        split --> stats
        stats --> combine
    "###);
}

#[test]
fn test_graph_text_lists_execution_order() {
    let dir = project(PIPELINE);

    in_dir(dir.path())
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("1. source (ingest/dummy)"))
        .stdout(predicate::str::contains("3. stats (extract/basic_stats) [multi-stage] [follows: split]"));
}

#[test]
fn test_run_map_reduce_on_threads() {
    let dir = project(PIPELINE);

    in_dir(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("(3 replicas)"))
        .stdout(predicate::str::contains("features: 6 signal(s)"))
        .stdout(predicate::str::contains("Pipeline completed successfully"));
}

#[test]
fn test_run_map_reduce_on_processes() {
    let dir = project(&PIPELINE.replace(
        "number_of_workers: 2",
        "number_of_workers: 2\n  worker_mode: processes",
    ));

    in_dir(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 process(es)"))
        .stdout(predicate::str::contains("features: 6 signal(s)"));
}

#[test]
fn test_cache_hit_on_second_run_then_clear() {
    let dir = project(CACHED);

    in_dir(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 cache hit(s)"));

    in_dir(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("(cached)"))
        .stdout(predicate::str::contains("1 cache hit(s)"));

    in_dir(dir.path())
        .args(["cache", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Entries:  1"));

    in_dir(dir.path())
        .args(["cache", "clear", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 entries removed"));

    in_dir(dir.path())
        .arg("run")
        .arg("--no-cache")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 cache hit(s)"));
}

#[test]
fn test_run_reports_compute_failure() {
    let dir = project(&CACHED.replace("subtype: dummy", "subtype: file\n  config: {file_name: nope.json}"));

    in_dir(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("stage 'source' (ingest/file) failed"));
}

#[test]
fn test_worker_answers_requests() {
    let request = r#"{"id":1,"stage":"split-0","template":{"name":"split","type":"map","subtype":"simple","config":{"number":2}},"inputs":[[1,2,3]]}"#;

    metricflow()
        .arg("worker")
        .write_stdin(format!("{}\n", request))
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"status":"ok","id":1,"outputs":[[[1],[2,3]]]}"#));
}
