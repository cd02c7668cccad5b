//! Routes validated operations to the pipeline, search and cache.
//!
//! A dispatcher is owned by exactly one worker thread and handles one
//! operation at a time, so it needs no locking.

use crate::cache::{CacheError, WorkerCache};
use crate::ops::{AnalyzeRequest, ArgumentError, Operation};
use crate::runtime::{ModelLoader, RuntimeConfig, RuntimeError, RuntimeManager};
use faceindex_core::InferenceSession;
use faceindex_core::clip::{self, ClipError};
use faceindex_core::clustering::{self, ClusteringError};
use faceindex_core::decode::{decode_image_from_path, DecodeError};
use faceindex_core::search::{self, SearchError, VectorIndex};
use faceindex_core::{analyze_image, PipelineError, PipelineSessions};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("image decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("pipeline: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("text embedding: {0}")]
    Clip(#[from] ClipError),
    #[error("search: {0}")]
    Search(#[from] SearchError),
    #[error("clustering: {0}")]
    Clustering(#[from] ClusteringError),
    #[error("result serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub struct Dispatcher<L: ModelLoader> {
    runtime: RuntimeManager<L>,
    cache: WorkerCache,
    defaults: RuntimeConfig,
}

impl<L: ModelLoader> Dispatcher<L> {
    pub fn new(loader: L, defaults: RuntimeConfig) -> Self {
        Self {
            runtime: RuntimeManager::new(loader),
            cache: WorkerCache::new(),
            defaults,
        }
    }

    /// Parse and run one request.
    pub fn handle(&mut self, tag: &str, args: Value) -> Result<Value, DispatchError> {
        let op = Operation::parse(tag, args, &self.defaults)?;
        self.dispatch(op)
    }

    pub fn dispatch(&mut self, op: Operation) -> Result<Value, DispatchError> {
        let tag = op.tag();
        tracing::debug!(op = tag, "dispatching");
        let result = self.run(op);
        if let Err(e) = &result {
            tracing::warn!(op = tag, error = %e, "operation failed");
        }
        result
    }

    fn run(&mut self, op: Operation) -> Result<Value, DispatchError> {
        if op.uses_runtime() {
            self.runtime.ensure_loaded()?;
        }
        match op {
            Operation::PrepareRuntime { config, stages } => {
                to_value(self.runtime.prepare(&config, stages)?)
            }
            Operation::ReleaseRuntime => {
                if let Err(e) = self.runtime.release() {
                    tracing::warn!(error = %e, "runtime release reported failures");
                }
                Ok(Value::Null)
            }
            Operation::DetectAndEmbedImage(request) => self.detect_and_embed(request),
            Operation::LoadModels { models, policy } => {
                let mut loaded = Vec::with_capacity(models.len());
                for model in models {
                    self.runtime.load_named(&model.name, &model.path, &policy)?;
                    loaded.push(model.name);
                }
                Ok(json!({ "loaded": loaded }))
            }
            Operation::ReleaseModels { names } => {
                Ok(json!({ "released": self.runtime.release_named(&names) }))
            }
            Operation::ComputeEmbeddingsForText {
                model_name,
                token_ids,
            } => {
                let session = self.runtime.named_session(&model_name)?;
                to_value(clip::embed_text(session, &token_ids)?.embedding)
            }
            Operation::BulkSimilarity { cache_key, queries } => {
                let candidates = self.cache.index(&cache_key)?.records()?;
                to_value(search::bulk_similarity(&candidates, &queries)?)
            }
            Operation::BulkVectorSearch {
                cache_key,
                queries,
                count,
                exact,
            } => {
                let index = self.cache.index(&cache_key)?;
                to_value(index.bulk_search(&queries, count, exact)?)
            }
            Operation::BulkVectorSearchByKey {
                cache_key,
                keys,
                count,
                exact,
            } => {
                let index = self.cache.index(&cache_key)?;
                to_value(index.search_by_key(&keys, count, exact)?)
            }
            Operation::VectorSearchWithinSimilarity {
                cache_key,
                query,
                minimum_similarity,
            } => {
                let index = self.cache.index(&cache_key)?;
                to_value(index.search_within_similarity(&query, minimum_similarity)?)
            }
            Operation::BulkFilteredVectorSearchWithinDistance {
                cache_key,
                queries,
                allowed_keys,
                count,
                max_distance,
            } => {
                let index = self.cache.index(&cache_key)?;
                to_value(index.bulk_filtered_search_within_distance(
                    &queries,
                    &allowed_keys,
                    count,
                    max_distance,
                )?)
            }
            Operation::RunIncrementalClustering { faces, thresholds } => {
                to_value(clustering::cluster_faces(&faces, thresholds)?)
            }
            Operation::CacheSet { key, value } => {
                self.cache.set(&key, value)?;
                Ok(Value::Null)
            }
            Operation::CacheClear { key } => Ok(json!({ "removed": self.cache.remove(&key) })),
            Operation::CacheClearAll => {
                let removed = self.cache.clear();
                self.runtime.dispose();
                Ok(json!({ "removed": removed }))
            }
        }
    }

    fn detect_and_embed(&mut self, request: AnalyzeRequest) -> Result<Value, DispatchError> {
        let stages = request.stages;
        self.runtime.prepare(&request.runtime, stages)?;
        let image = decode_image_from_path(&request.image_path)?;
        let sessions = self.runtime.sessions()?;

        let (detector, embedder) = if stages.faces {
            (
                Some(require(sessions.detector, "faceDetectionModelPath")?),
                Some(require(sessions.embedder, "faceEmbeddingModelPath")?),
            )
        } else {
            (None, None)
        };
        let clip_image = if stages.clip {
            Some(require(sessions.auxiliary, "auxiliaryModelPath")?)
        } else {
            None
        };
        let analysis = analyze_image(
            PipelineSessions {
                detector,
                embedder,
                clip_image,
            },
            request.file_id,
            &image,
        )?;

        tracing::info!(
            file_id = request.file_id,
            faces = ?analysis.faces.as_ref().map(Vec::len),
            clip = analysis.clip.is_some(),
            "image analyzed"
        );
        to_value(analysis)
    }

    /// Release everything this worker holds.
    pub fn shutdown(&mut self) {
        self.cache.clear();
        self.runtime.dispose();
    }
}

fn require<'a>(
    session: Option<&'a mut dyn InferenceSession>,
    path_name: &str,
) -> Result<&'a mut dyn InferenceSession, RuntimeError> {
    session.ok_or_else(|| RuntimeError::MissingModelPaths(vec![path_name.to_string()]))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, DispatchError> {
    Ok(serde_json::to_value(value)?)
}
