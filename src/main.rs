// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! metricflow - declarative metric analysis pipelines
//!
//! Validate, run and watch pipelines of ingest, extract and map-reduce stages.

use clap::Parser;
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metricflow::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; a worker's stdout carries protocol replies
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if cli.verbose {
                    "metricflow=debug".into()
                } else {
                    "metricflow=info".into()
                }
            }),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Some(ref dir) = cli.directory {
        std::env::set_current_dir(dir).map_err(|e| {
            miette::miette!("Failed to change to directory '{}': {}", dir.display(), e)
        })?;
    }

    match cli.command {
        Commands::Run {
            pipeline,
            no_cache,
            timeout,
        } => metricflow::cli::run::run(pipeline, no_cache, timeout, cli.verbose).await,
        Commands::Watch { pipeline, debounce } => {
            metricflow::cli::watch::run(pipeline, debounce, cli.verbose).await
        }
        Commands::Validate { pipeline } => {
            metricflow::cli::validate::run(pipeline, cli.verbose).await
        }
        Commands::Cache { pipeline, action } => {
            metricflow::cli::cache::run(pipeline, action, cli.verbose).await
        }
        Commands::Graph { pipeline, format } => {
            metricflow::cli::graph::run(pipeline, format, cli.verbose).await
        }
        Commands::Worker => metricflow::cli::worker::run().await,
    }
}
