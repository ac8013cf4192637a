// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Run command - execute the pipeline once

use colored::Colorize;
use miette::Result;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::{load_config, print_problems};
use crate::pipeline::{Pipeline, PipelineValidator, RunOptions, RunReport, StageOutcome};
use crate::registry::StageRegistry;

/// Run the pipeline
pub async fn run(
    pipeline_path: PathBuf,
    no_cache: bool,
    timeout: Option<u64>,
    verbose: bool,
) -> Result<()> {
    let config = load_config(&pipeline_path)?;
    let registry = Arc::new(StageRegistry::with_builtins());

    let validation = PipelineValidator::validate(&config, Some(registry.as_ref()));
    print_problems(&validation.errors, &validation.warnings, verbose);
    if !validation.is_valid() {
        return Err(miette::miette!("Pipeline configuration is invalid"));
    }

    let mut pipeline = Pipeline::build(&config, registry)?;
    print_plan(&pipeline);

    let options = RunOptions {
        no_cache,
        deadline: timeout.map(Duration::from_millis),
        ..Default::default()
    };

    let cancel = options.cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = pipeline.run_with(&options).await;
    ctrl_c.abort();

    let report = result?;
    print_report(&report);
    print_outputs(&pipeline, verbose);

    Ok(())
}

/// Print the execution order
pub(crate) fn print_plan(pipeline: &Pipeline) {
    println!(
        "{} {}",
        "Pipeline".bold(),
        format!("(workers: {})", pipeline.workers()).dimmed()
    );
    println!("{}", "═".repeat(50));
    print!("{}", pipeline.plan());
    println!();
}

/// Print per-stage results
pub(crate) fn print_report(report: &RunReport) {
    for stage in &report.stages {
        let note = match stage.outcome {
            StageOutcome::Computed => String::new(),
            StageOutcome::Cached => " (cached)".to_string(),
            StageOutcome::Replicated(n) => format!(" ({} replicas)", n),
        };
        println!(
            "  {} {} {}{}",
            "✓".green(),
            stage.name,
            format!("[{:.2}s]", stage.duration.as_secs_f64()).dimmed(),
            note.cyan()
        );
    }

    println!();
    println!(
        "{} ({:.2}s, {} cache hit(s))",
        "Pipeline completed successfully".green().bold(),
        report.duration.as_secs_f64(),
        report.cache_hits()
    );
}

/// Print the final outputs of terminal stages
fn print_outputs(pipeline: &Pipeline, verbose: bool) {
    let terminal: Vec<_> = pipeline
        .stages()
        .iter()
        .filter(|s| s.followers.is_empty())
        .collect();

    if terminal.is_empty() {
        return;
    }

    println!();
    println!("{}:", "Outputs".bold());
    for stage in terminal {
        for field in &stage.descriptor.output_fields {
            let Some(value) = stage.output(field) else {
                continue;
            };
            if verbose {
                let rendered = serde_json::to_string_pretty(value).unwrap_or_default();
                println!("  - {}: {}", field, rendered);
            } else {
                println!("  - {}: {}", field, summarize(value));
            }
        }
    }
}

/// Short description of an output value
fn summarize(value: &Value) -> String {
    match value {
        Value::Array(items) => format!("{} item(s)", items.len()),
        Value::Object(doc) => match doc.get("signals").and_then(Value::as_array) {
            Some(signals) => format!("{} signal(s)", signals.len()),
            None => format!("{} key(s)", doc.len()),
        },
        other => other.to_string(),
    }
}
