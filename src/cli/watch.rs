// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Watch command - re-run pipeline on file changes
//!
//! A change to the pipeline file rebuilds the pipeline from scratch; any other
//! change reruns the current one. A failed rerun keeps the outputs of the last
//! successful run.

use colored::Colorize;
use miette::Result;
use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEventKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{load_config, print_problems};
use crate::pipeline::{Pipeline, PipelineValidator};
use crate::registry::StageRegistry;

/// Run the watch command
pub async fn run(pipeline_path: PathBuf, debounce_ms: u64, verbose: bool) -> Result<()> {
    if !pipeline_path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}",
            pipeline_path.display()
        ));
    }

    let working_dir = std::env::current_dir()
        .map_err(|e| miette::miette!("Failed to get current directory: {}", e))?;
    let pipeline_file = absolute(&working_dir, &pipeline_path);

    println!("{}", "Starting watch mode...".bold());
    println!("Watching for changes (debounce: {}ms)", debounce_ms);
    println!("Press {} to exit.", "Ctrl+C".cyan());
    println!();

    let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();

    let mut debouncer = new_debouncer(Duration::from_millis(debounce_ms), move |res| {
        let _ = tx.send(res);
    })
    .map_err(|e| miette::miette!("Failed to create file watcher: {}", e))?;

    debouncer
        .watcher()
        .watch(&working_dir, RecursiveMode::Recursive)
        .map_err(|e| miette::miette!("Failed to start watching: {}", e))?;

    let registry = Arc::new(StageRegistry::with_builtins());
    let mut pipeline = rebuild(&pipeline_file, &registry, verbose);
    let mut ignored = ignored_dirs(&working_dir, pipeline.as_ref());
    rerun(pipeline.as_mut()).await;

    loop {
        let events = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = rx.recv() => match received {
                Some(Ok(events)) => events,
                Some(Err(e)) => {
                    eprintln!("{}: {:?}", "Watch error".red(), e);
                    continue;
                }
                None => break,
            },
        };

        let relevant: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, DebouncedEventKind::Any))
            .filter(|e| !ignored.iter().any(|dir| e.path.starts_with(dir)))
            .collect();

        if relevant.is_empty() {
            continue;
        }

        println!();
        println!("{}", "─".repeat(50).dimmed());
        println!(
            "{}: {} file(s) changed",
            "Change detected".yellow(),
            relevant.len()
        );
        if verbose {
            for event in &relevant {
                println!("  {}", event.path.display());
            }
        }
        println!();

        if relevant.iter().any(|e| e.path == pipeline_file) {
            if let Some(rebuilt) = rebuild(&pipeline_file, &registry, verbose) {
                ignored = ignored_dirs(&working_dir, Some(&rebuilt));
                pipeline = Some(rebuilt);
            } else if pipeline.is_some() {
                println!("{}", "Keeping the previous pipeline.".dimmed());
            }
        }

        rerun(pipeline.as_mut()).await;
    }

    println!();
    println!("{}", "Watch stopped.".dimmed());
    Ok(())
}

fn rebuild(pipeline_file: &Path, registry: &Arc<StageRegistry>, verbose: bool) -> Option<Pipeline> {
    let config = match load_config(pipeline_file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Failed to load pipeline".red(), e);
            return None;
        }
    };

    let validation = PipelineValidator::validate(&config, Some(registry.as_ref()));
    print_problems(&validation.errors, &validation.warnings, verbose);
    if !validation.is_valid() {
        return None;
    }

    match Pipeline::build(&config, Arc::clone(registry)) {
        Ok(pipeline) => Some(pipeline),
        Err(e) => {
            eprintln!("{}: {}", "Failed to build pipeline".red(), e);
            None
        }
    }
}

async fn rerun(pipeline: Option<&mut Pipeline>) {
    let Some(pipeline) = pipeline else {
        return;
    };

    match pipeline.run_iteration().await {
        Ok(report) => {
            println!(
                "{} ({:.2}s, {} cache hit(s))",
                "Pipeline completed successfully".green(),
                report.duration.as_secs_f64(),
                report.cache_hits()
            );
        }
        Err(e) => {
            eprintln!("{}: {}", "Pipeline failed".red(), e);
            if pipeline.stages().iter().any(|s| s.latest_output_data.is_some()) {
                eprintln!("{}", "Outputs of the last successful run are kept.".dimmed());
            }
        }
    }
}

/// Cache directories, whose writes must not trigger reruns
fn ignored_dirs(working_dir: &Path, pipeline: Option<&Pipeline>) -> Vec<PathBuf> {
    pipeline
        .map(|p| {
            p.stages()
                .iter()
                .filter_map(|s| s.descriptor.cache_directory.as_deref())
                .map(|dir| absolute(working_dir, dir))
                .collect()
        })
        .unwrap_or_default()
}

fn absolute(working_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path.strip_prefix(".").unwrap_or(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_paths() {
        let cwd = Path::new("/work");
        assert_eq!(absolute(cwd, Path::new("p.yaml")), PathBuf::from("/work/p.yaml"));
        assert_eq!(absolute(cwd, Path::new("./cache")), PathBuf::from("/work/cache"));
        assert_eq!(absolute(cwd, Path::new("/tmp/c")), PathBuf::from("/tmp/c"));
    }

    #[test]
    fn test_ignored_dirs_follow_cache_directories() {
        let yaml = r#"
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
  cache_directory: ./cache/extract
"#;
        let config = crate::pipeline::PipelineConfig::from_yaml(yaml).unwrap();
        let pipeline =
            Pipeline::build(&config, Arc::new(StageRegistry::with_builtins())).unwrap();

        let dirs = ignored_dirs(Path::new("/work"), Some(&pipeline));
        assert_eq!(dirs, vec![PathBuf::from("/work/cache/extract")]);
        assert!(ignored_dirs(Path::new("/work"), None).is_empty());
    }
}
