// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Caching layer for stage results
//!
//! A stage with a `cache_directory` and exactly one input is keyed by the
//! `metadata` field of that input. Stage config is not part of the key.

mod filesystem;
mod hash;

pub use filesystem::{FilesystemCache, METADATA_FILE, SIGNALS_FILE};
pub use hash::{canonical_json, hash_json, ContentHasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

use crate::errors::MetricflowError;

/// Trait for cache implementations
#[async_trait]
pub trait Cache: Send + Sync {
    /// Outputs cached for `input`
    ///
    /// Unreadable or corrupt entries are misses, never errors.
    async fn lookup(&self, input: &Value) -> Option<Vec<Value>>;

    /// Store the outputs computed by `stage` for `input`
    async fn store(&self, stage: &str, input: &Value, outputs: &[Value])
        -> Result<(), MetricflowError>;

    /// Remove every entry
    async fn clear(&self) -> Result<usize, MetricflowError>;

    /// Readable entries
    async fn entries(&self) -> Result<Vec<CachedEntry>, MetricflowError>;

    /// Get cache statistics
    async fn stats(&self) -> Result<CacheStats, MetricflowError>;
}

/// Cache key of a stage input, `None` when it carries no `metadata`
pub fn cache_key(input: &Value) -> Option<String> {
    input.get("metadata").map(hash_json)
}

/// Cache statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of cached entries
    pub entries: usize,
    /// Total size in bytes
    pub size_bytes: u64,
    /// Oldest entry timestamp
    pub oldest_entry: Option<SystemTime>,
    /// Newest entry timestamp
    pub newest_entry: Option<SystemTime>,
}

impl CacheStats {
    /// Format size for display
    pub fn formatted_size(&self) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if self.size_bytes >= GB {
            format!("{:.2} GB", self.size_bytes as f64 / GB as f64)
        } else if self.size_bytes >= MB {
            format!("{:.2} MB", self.size_bytes as f64 / MB as f64)
        } else if self.size_bytes >= KB {
            format!("{:.2} KB", self.size_bytes as f64 / KB as f64)
        } else {
            format!("{} bytes", self.size_bytes)
        }
    }

    fn record(&mut self, timestamp: SystemTime) {
        self.entries += 1;
        if self.oldest_entry.map_or(true, |oldest| timestamp < oldest) {
            self.oldest_entry = Some(timestamp);
        }
        if self.newest_entry.map_or(true, |newest| timestamp > newest) {
            self.newest_entry = Some(timestamp);
        }
    }
}

/// Bookkeeping of one cache entry, stored in `entry_file`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    /// When the entry was cached
    pub timestamp: SystemTime,
    /// Stage that computed the outputs
    pub stage_name: String,
    /// Cache key (content hash)
    pub cache_key: String,
    /// The input metadata the key was derived from, read from `metadata_file`
    #[serde(skip)]
    pub metadata: Value,
}
