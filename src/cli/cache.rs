// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Cache command - manage the stage caches of a pipeline

use colored::Colorize;
use miette::Result;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use super::{load_config, CacheAction};
use crate::cache::{Cache, CacheStats, FilesystemCache};

/// Run the cache command
pub async fn run(pipeline_path: PathBuf, action: CacheAction, _verbose: bool) -> Result<()> {
    let config = load_config(&pipeline_path)?;
    let caches: Vec<FilesystemCache> = config
        .cache_directories()
        .into_iter()
        .map(FilesystemCache::new)
        .collect();

    if caches.is_empty() {
        println!("{}", "No stage declares a cache_directory.".dimmed());
        return Ok(());
    }

    match action {
        CacheAction::Stats => {
            println!("{}", "Cache Statistics".bold());
            println!("{}", "═".repeat(40));

            for cache in &caches {
                let stats = cache.stats().await?;
                print_stats(cache, &stats);
            }

            Ok(())
        }

        CacheAction::Clear { yes } => {
            let mut total = CacheStats::default();
            for cache in &caches {
                let stats = cache.stats().await?;
                total.entries += stats.entries;
                total.size_bytes += stats.size_bytes;
            }

            if total.entries == 0 {
                println!("{}", "Cache is already empty.".dimmed());
                return Ok(());
            }

            if !yes {
                print!(
                    "Clear {} cache entries ({})? [y/N] ",
                    total.entries,
                    total.formatted_size()
                );
                io::stdout().flush().ok();

                let mut input = String::new();
                io::stdin().read_line(&mut input).ok();

                if !input.trim().eq_ignore_ascii_case("y") {
                    println!("{}", "Cancelled.".dimmed());
                    return Ok(());
                }
            }

            let mut removed = 0;
            for cache in &caches {
                removed += cache.clear().await?;
            }
            println!("{} ({} entries removed)", "Cache cleared.".green(), removed);

            Ok(())
        }

        CacheAction::List => {
            println!("{}", "Cached Entries".bold());
            println!("{}", "═".repeat(40));

            for cache in &caches {
                let entries = cache.entries().await?;
                println!("{}", cache.cache_dir().display().to_string().cyan());

                if entries.is_empty() {
                    println!("{}", "  No cached entries.".dimmed());
                    continue;
                }

                for entry in entries {
                    let age = age(entry.timestamp)
                        .map(|a| format!(" ({} ago)", a))
                        .unwrap_or_default();
                    println!(
                        "  {}  {}{}",
                        &entry.cache_key[..entry.cache_key.len().min(16)],
                        entry.stage_name,
                        age.dimmed()
                    );
                }
            }

            Ok(())
        }
    }
}

fn print_stats(cache: &FilesystemCache, stats: &CacheStats) {
    println!("  Location: {}", cache.cache_dir().display());
    println!("  Entries:  {}", stats.entries);
    println!("  Size:     {}", stats.formatted_size());

    if let Some(oldest) = stats.oldest_entry.and_then(age) {
        println!("  Oldest:   {} ago", oldest);
    }
    if let Some(newest) = stats.newest_entry.and_then(age) {
        println!("  Newest:   {} ago", newest);
    }
    println!();
}

fn age(timestamp: SystemTime) -> Option<String> {
    timestamp.elapsed().ok().map(format_duration)
}

fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
