// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Graph command - visualize pipeline as a graph

use miette::Result;
use std::path::PathBuf;
use std::sync::Arc;

use super::{load_config, GraphFormat};
use crate::pipeline::Pipeline;
use crate::registry::StageRegistry;

/// Run the graph command
pub async fn run(pipeline_path: PathBuf, format: GraphFormat, _verbose: bool) -> Result<()> {
    let config = load_config(&pipeline_path)?;
    let pipeline = Pipeline::build(&config, Arc::new(StageRegistry::with_builtins()))?;

    let output = match format {
        GraphFormat::Text => pipeline.plan(),
        GraphFormat::Dot => pipeline.graph().to_dot(),
        GraphFormat::Mermaid => pipeline.graph().to_mermaid(),
    };

    print!("{}", output);

    Ok(())
}
