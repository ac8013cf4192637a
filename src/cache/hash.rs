// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 metricflow contributors

//! Content hashing for cache keys
//!
//! Keys are BLAKE3 digests of the canonical JSON form of a value: object keys
//! sorted at every level, no whitespace. Two values that differ only in key
//! order hash the same.

use blake3::Hasher;
use serde_json::Value;

/// Content hasher for generating cache keys
pub struct ContentHasher {
    hasher: Hasher,
}

impl ContentHasher {
    /// Create a new content hasher
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    /// Feed the canonical form of a JSON value
    pub fn update_json(&mut self, value: &Value) {
        self.hasher.update(canonical_json(value).as_bytes());
    }

    /// Finalize and get the hex digest
    pub fn finalize(self) -> String {
        self.hasher.finalize().to_hex().to_string()
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Cache key of a JSON value
pub fn hash_json(value: &Value) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update_json(value);
    hasher.finalize()
}

/// Serialize with object keys sorted recursively
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
