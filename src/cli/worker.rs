// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Worker command - serve replicas for the process pool

use miette::Result;
use tokio::io::BufReader;
use tracing::debug;

use crate::registry::StageRegistry;
use crate::workers::serve;

/// Answer compute requests on stdin until it closes
pub async fn run() -> Result<()> {
    debug!("Worker {} started", std::process::id());

    let registry = StageRegistry::with_builtins();
    serve(&registry, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;

    debug!("Worker {} finished", std::process::id());
    Ok(())
}
