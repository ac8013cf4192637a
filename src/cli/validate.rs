// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Validate command - check pipeline configuration

use colored::Colorize;
use miette::Result;
use std::path::PathBuf;

use crate::pipeline::{PipelineConfig, PipelineValidator};
use crate::registry::StageRegistry;

/// Run the validate command
pub async fn run(pipeline_path: PathBuf, verbose: bool) -> Result<()> {
    println!("{}", "Validating pipeline...".bold());
    println!();

    if !pipeline_path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}",
            pipeline_path.display()
        ));
    }

    let config = match PipelineConfig::from_file(&pipeline_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("  {} Failed to parse pipeline", "✗".red());
            eprintln!();
            return Err(e.into());
        }
    };

    println!("  {} Pipeline file is valid YAML", "✓".green());

    let registry = StageRegistry::with_builtins();
    let validation = PipelineValidator::validate(&config, Some(&registry));

    if !validation.errors.is_empty() {
        println!();
        println!("{}:", "Errors".red().bold());
        for error in &validation.errors {
            println!("  {} {}", "✗".red(), error);
        }
    }

    if !validation.warnings.is_empty() {
        println!();
        println!("{}:", "Warnings".yellow().bold());
        for warning in &validation.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }

    if verbose {
        println!();
        println!("{}:", "Pipeline summary".bold());
        println!("  Stages: {}", config.parameters.len());
        println!("  Workers: {}", config.global_settings.number_of_workers);
        for entry in &config.pipeline {
            let kind = config
                .get_stage(&entry.name)
                .map(|s| match &s.subtype {
                    Some(subtype) => format!("{}/{}", s.stage_type, subtype),
                    None => s.stage_type.clone(),
                })
                .unwrap_or_else(|| "?".to_string());
            let follows = if entry.follows.is_empty() {
                String::new()
            } else {
                format!(" [follows: {}]", entry.follows.join(", "))
            };
            println!("    - {} ({}){}", entry.name, kind, follows.dimmed());
        }
    }

    println!();

    if !validation.is_valid() {
        Err(miette::miette!("Pipeline validation failed"))
    } else if validation.has_warnings() {
        println!("{}", "Pipeline is valid but has warnings.".yellow().bold());
        Ok(())
    } else {
        println!("{}", "Pipeline is valid!".green().bold());
        Ok(())
    }
}
