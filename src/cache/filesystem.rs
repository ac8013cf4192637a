// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Filesystem-based cache implementation
//!
//! Each entry is a directory named after the cache key, holding the canonical
//! input metadata in `metadata_file`, the stage outputs in `signals_file` and
//! the bookkeeping (stage, time, key) in `entry_file`.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use super::{cache_key, canonical_json, Cache, CacheStats, CachedEntry};
use crate::errors::MetricflowError;

pub const METADATA_FILE: &str = "metadata_file";
pub const SIGNALS_FILE: &str = "signals_file";
pub const ENTRY_FILE: &str = "entry_file";

/// Filesystem-based cache rooted at a stage's `cache_directory`
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    cache_dir: PathBuf,
}

impl FilesystemCache {
    /// Create a cache; the directory is created on first store
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory of the entry for `key`
    fn entry_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    /// Directories that look like cache entries
    fn entry_dirs(&self) -> Result<Vec<PathBuf>, MetricflowError> {
        if !self.cache_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.cache_dir)
            .map_err(|e| MetricflowError::cache("Failed to read cache directory", e))?
        {
            let path = entry
                .map_err(|e| MetricflowError::cache("Failed to read cache entry", e))?
                .path();

            if path.join(METADATA_FILE).exists() || path.join(SIGNALS_FILE).exists() {
                dirs.push(path);
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    async fn read_outputs(path: &Path) -> Option<Vec<Value>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("Cache miss, cannot read {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(outputs) => Some(outputs),
            Err(e) => {
                debug!("Cache miss, cannot parse {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Calculate directory size recursively
    fn dir_size(path: &Path) -> Result<u64, MetricflowError> {
        let mut size = 0;

        if path.is_file() {
            return Ok(path.metadata().map(|m| m.len()).unwrap_or(0));
        }

        for entry in std::fs::read_dir(path)
            .map_err(|e| MetricflowError::cache("Failed to read directory", e))?
        {
            let entry = entry.map_err(|e| MetricflowError::cache("Failed to read entry", e))?;

            let path = entry.path();
            if path.is_dir() {
                size += Self::dir_size(&path)?;
            } else {
                size += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }

        Ok(size)
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn lookup(&self, input: &Value) -> Option<Vec<Value>> {
        let key = cache_key(input)?;
        Self::read_outputs(&self.entry_path(&key).join(SIGNALS_FILE)).await
    }

    async fn store(
        &self,
        stage: &str,
        input: &Value,
        outputs: &[Value],
    ) -> Result<(), MetricflowError> {
        let Some(key) = cache_key(input) else {
            return Ok(());
        };
        let dir = self.entry_path(&key);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| MetricflowError::cache("Failed to create cache directory", e))?;

        let entry = CachedEntry {
            timestamp: SystemTime::now(),
            stage_name: stage.to_string(),
            cache_key: key,
            metadata: Value::Null,
        };

        let metadata = canonical_json(input.get("metadata").unwrap_or(&Value::Null));
        let signals = serde_json::to_string(outputs)
            .map_err(|e| MetricflowError::cache("Failed to serialize cache outputs", e))?;
        let bookkeeping = serde_json::to_string_pretty(&entry)
            .map_err(|e| MetricflowError::cache("Failed to serialize cache entry", e))?;

        tokio::fs::write(dir.join(METADATA_FILE), metadata)
            .await
            .map_err(|e| MetricflowError::cache("Failed to write cache metadata", e))?;
        tokio::fs::write(dir.join(SIGNALS_FILE), signals)
            .await
            .map_err(|e| MetricflowError::cache("Failed to write cache outputs", e))?;
        tokio::fs::write(dir.join(ENTRY_FILE), bookkeeping)
            .await
            .map_err(|e| MetricflowError::cache("Failed to write cache entry", e))?;

        debug!("Cached outputs of '{}' in {}", stage, dir.display());
        Ok(())
    }

    async fn clear(&self) -> Result<usize, MetricflowError> {
        let dirs = self.entry_dirs()?;
        for dir in &dirs {
            tokio::fs::remove_dir_all(dir)
                .await
                .map_err(|e| MetricflowError::cache("Failed to clear cache", e))?;
        }
        Ok(dirs.len())
    }

    async fn entries(&self) -> Result<Vec<CachedEntry>, MetricflowError> {
        let mut entries = Vec::new();

        for dir in self.entry_dirs()? {
            let Ok(content) = tokio::fs::read_to_string(dir.join(ENTRY_FILE)).await else {
                continue;
            };
            let Ok(mut entry) = serde_json::from_str::<CachedEntry>(&content) else {
                continue;
            };
            if let Ok(metadata) = tokio::fs::read_to_string(dir.join(METADATA_FILE)).await {
                entry.metadata = serde_json::from_str(&metadata).unwrap_or(Value::Null);
            }
            entries.push(entry);
        }

        Ok(entries)
    }

    async fn stats(&self) -> Result<CacheStats, MetricflowError> {
        let mut stats = CacheStats::default();

        for entry in self.entries().await? {
            stats.record(entry.timestamp);
        }

        if self.cache_dir.exists() {
            stats.size_bytes = Self::dir_size(&self.cache_dir)?;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn input() -> Value {
        json!({"metadata": {"job": "node"}, "signals": [1, 2, 3]})
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path().join("cache"));

        assert!(cache.lookup(&input()).await.is_none());

        cache
            .store("extract", &input(), &[json!({"features": 1})])
            .await
            .unwrap();

        let cached = cache.lookup(&input()).await.unwrap();
        assert_eq!(cached, vec![json!({"features": 1})]);

        let key = cache_key(&input()).unwrap();
        let entry_dir = temp_dir.path().join("cache").join(&key);
        assert!(entry_dir.join(METADATA_FILE).is_file());
        assert!(entry_dir.join(SIGNALS_FILE).is_file());
    }

    #[tokio::test]
    async fn test_metadata_file_is_canonical() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path());
        let input: Value =
            serde_json::from_str(r#"{"metadata": {"job": "node", "env": {"z": 1, "a": 2}}, "signals": []}"#)
                .unwrap();

        cache.store("extract", &input, &[json!(1)]).await.unwrap();

        let dir = temp_dir.path().join(cache_key(&input).unwrap());
        let written = std::fs::read_to_string(dir.join(METADATA_FILE)).unwrap();
        assert_eq!(written, r#"{"env":{"a":2,"z":1},"job":"node"}"#);

        let entries = cache.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].stage_name, "extract");
        assert_eq!(entries[0].metadata, input["metadata"]);
    }

    #[tokio::test]
    async fn test_float_outputs_survive_exactly() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path());

        let outputs: Vec<Value> = (0..2000)
            .map(|i| {
                let v = (i as f64).sqrt() / 7.3 + 1e-7 * i as f64;
                json!({"mean": v})
            })
            .collect();

        cache.store("extract", &input(), &outputs).await.unwrap();
        let cached = cache.lookup(&input()).await.unwrap();

        assert_eq!(cached, outputs);
        assert_eq!(
            serde_json::to_string(&cached).unwrap(),
            serde_json::to_string(&outputs).unwrap()
        );
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path());

        cache.store("extract", &input(), &[json!(1)]).await.unwrap();

        let key = cache_key(&input()).unwrap();
        std::fs::write(temp_dir.path().join(key).join(SIGNALS_FILE), "{not json").unwrap();

        assert!(cache.lookup(&input()).await.is_none());
    }

    #[tokio::test]
    async fn test_input_without_metadata_is_never_cached() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path());

        cache.store("extract", &json!([1, 2]), &[json!(1)]).await.unwrap();
        assert!(cache.lookup(&json!([1, 2])).await.is_none());
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_write_failure_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let cache = FilesystemCache::new(&blocker);
        let result = cache.store("extract", &input(), &[json!(1)]).await;

        assert!(matches!(result, Err(MetricflowError::CacheError { .. })));
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let cache = FilesystemCache::new(temp_dir.path());

        cache.store("a", &input(), &[json!(1)]).await.unwrap();
        cache
            .store("a", &json!({"metadata": {"job": "db"}}), &[json!(2)])
            .await
            .unwrap();
        std::fs::write(temp_dir.path().join("unrelated.txt"), "keep").unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert!(stats.size_bytes > 0);
        assert!(stats.oldest_entry.is_some());

        let entries = cache.entries().await.unwrap();
        assert!(entries.iter().all(|e| e.stage_name == "a"));

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert_eq!(cache.stats().await.unwrap().entries, 0);
        assert!(temp_dir.path().join("unrelated.txt").exists());
    }
}
