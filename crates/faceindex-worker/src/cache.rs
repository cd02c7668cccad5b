//! Per-worker key/value cache.
//!
//! Holds embedding sets for the search operations and arbitrary JSON blobs.
//! Entries live until they are cleared explicitly. An embedding set is kept
//! only as its vector index, so every operation on a key sees the same vectors.

use faceindex_core::search::{EmbeddingIndex, EmbeddingRecord, SearchError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no cache entry for key '{0}'")]
    Missing(String),
    #[error("cache entry '{0}' does not hold embeddings")]
    NotEmbeddings(String),
    #[error("cache entry '{key}' has inconsistent vectors: {source}")]
    Index {
        key: String,
        #[source]
        source: SearchError,
    },
}

/// Value accepted by `cache-set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheValue {
    Embeddings(Vec<EmbeddingRecord>),
    Json(serde_json::Value),
}

enum CacheEntry {
    Embeddings(EmbeddingIndex),
    Json(serde_json::Value),
}

#[derive(Default)]
pub struct WorkerCache {
    entries: HashMap<String, CacheEntry>,
}

impl WorkerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous entry.
    ///
    /// Embedding sets are indexed up front and rejected if their vectors
    /// disagree in dimension. A repeated id keeps its last vector.
    pub fn set(&mut self, key: &str, value: CacheValue) -> Result<(), CacheError> {
        let entry = match value {
            CacheValue::Embeddings(records) => {
                let index =
                    EmbeddingIndex::from_records(&records).map_err(|source| CacheError::Index {
                        key: key.to_string(),
                        source,
                    })?;
                tracing::debug!(key, vectors = index.len(), "cached embeddings");
                CacheEntry::Embeddings(index)
            }
            CacheValue::Json(value) => CacheEntry::Json(value),
        };
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn index(&self, key: &str) -> Result<&EmbeddingIndex, CacheError> {
        match self.entries.get(key) {
            Some(CacheEntry::Embeddings(index)) => Ok(index),
            Some(CacheEntry::Json(_)) => Err(CacheError::NotEmbeddings(key.to_string())),
            None => Err(CacheError::Missing(key.to_string())),
        }
    }

    pub fn json(&self, key: &str) -> Option<&serde_json::Value> {
        match self.entries.get(key) {
            Some(CacheEntry::Json(value)) => Some(value),
            _ => None,
        }
    }

    /// Remove one entry. Returns whether it existed.
    pub fn remove(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
