// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! CLI command definitions and handlers
//!
//! Defines the command-line interface for metricflow.

pub mod cache;
pub mod graph;
pub mod run;
pub mod validate;
pub mod watch;
pub mod worker;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::pipeline::PipelineConfig;

/// Default pipeline file name
pub const DEFAULT_PIPELINE: &str = "metricflow.yaml";

/// Metric analysis pipeline runner
#[derive(Parser, Debug)]
#[clap(
    name = "metricflow",
    version,
    about = "Run declarative metric analysis pipelines",
    long_about = None,
    after_help = "Examples:\n\
        metricflow validate                  Check metricflow.yaml\n\
        metricflow run -p pipeline.yaml      Run a pipeline once\n\
        metricflow graph -f mermaid          Show the stage graph\n\
        metricflow watch                     Re-run on file changes\n\n\
        See 'metricflow <command> --help' for more information on a specific command."
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Change to directory before executing
    #[clap(short = 'C', long, global = true, value_name = "DIR")]
    pub directory: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline once
    Run {
        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Skip cache (force re-execution)
        #[clap(long)]
        no_cache: bool,

        /// Abort the run after this many milliseconds
        #[clap(long, value_name = "MS")]
        timeout: Option<u64>,
    },

    /// Watch mode - re-run pipeline on file changes
    Watch {
        /// Pipeline file
        #[clap(short, long, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Debounce delay in milliseconds
        #[clap(long, default_value = "500")]
        debounce: u64,
    },

    /// Validate pipeline configuration
    Validate {
        /// Pipeline file to validate
        #[clap(default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,
    },

    /// Cache management
    Cache {
        /// Pipeline file whose cache directories are managed
        #[clap(short, long, global = true, default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        #[clap(subcommand)]
        action: CacheAction,
    },

    /// Show pipeline as a graph
    Graph {
        /// Pipeline file
        #[clap(default_value = DEFAULT_PIPELINE)]
        pipeline: PathBuf,

        /// Output format
        #[clap(short, long, default_value = "text", value_parser = clap::builder::TypedValueParser::map(clap::builder::PossibleValuesParser::new(["text", "dot", "mermaid"]), |s| s.parse::<GraphFormat>().unwrap()))]
        format: GraphFormat,
    },

    /// Serve compute requests on stdin/stdout (used by the process pool)
    #[clap(hide = true)]
    Worker,
}

/// Cache management actions
#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Show cache statistics
    Stats,

    /// Clear the cache
    Clear {
        /// Skip confirmation
        #[clap(short, long)]
        yes: bool,
    },

    /// List cached entries
    List,
}

/// Graph output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Text,
    Dot,
    Mermaid,
}

impl std::str::FromStr for GraphFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "dot" => Ok(Self::Dot),
            "mermaid" => Ok(Self::Mermaid),
            _ => Err(format!("Unknown graph format: {}", s)),
        }
    }
}

/// Load a pipeline file, with a hint when it does not exist
pub(crate) fn load_config(path: &Path) -> miette::Result<PipelineConfig> {
    if !path.exists() {
        return Err(miette::miette!(
            "Pipeline file not found: {}\n\n\
             Pass another file with '-p <FILE>'.",
            path.display()
        ));
    }

    Ok(PipelineConfig::from_file(path)?)
}

/// Print validation problems to stderr
pub(crate) fn print_problems(errors: &[String], warnings: &[String], verbose: bool) {
    if !errors.is_empty() {
        eprintln!("{}", "Pipeline validation failed:".red().bold());
        for error in errors {
            eprintln!("  {} {}", "✗".red(), error);
        }
    }

    if !warnings.is_empty() && verbose {
        eprintln!("{}", "Pipeline warnings:".yellow().bold());
        for warning in warnings {
            eprintln!("  {} {}", "⚠".yellow(), warning);
        }
        eprintln!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_format_parse() {
        assert_eq!("DOT".parse::<GraphFormat>().unwrap(), GraphFormat::Dot);
        assert_eq!("mermaid".parse::<GraphFormat>().unwrap(), GraphFormat::Mermaid);
        assert!("svg".parse::<GraphFormat>().is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["metricflow", "run", "-p", "p.yaml", "--no-cache"]);
        match cli.command {
            Commands::Run {
                pipeline, no_cache, ..
            } => {
                assert_eq!(pipeline, PathBuf::from("p.yaml"));
                assert!(no_cache);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cache_pipeline_flag_after_action() {
        let cli = Cli::parse_from(["metricflow", "cache", "clear", "--yes", "-p", "p.yaml"]);
        assert!(matches!(
            cli.command,
            Commands::Cache {
                action: CacheAction::Clear { yes: true },
                ..
            }
        ));
    }
}
