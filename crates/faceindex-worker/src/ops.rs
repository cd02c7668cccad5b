//! Operation tags and argument validation.
//!
//! Requests arrive as a kebab-case tag plus a JSON object of camelCase
//! arguments. [`Operation::parse`] checks every argument once at the boundary
//! and produces a typed [`Operation`]; nothing downstream looks at raw JSON.

use crate::cache::CacheValue;
use crate::runtime::{ModelStages, RuntimeConfig};
use faceindex_core::clustering::{ClusteringFace, ClusteringThresholds};
use faceindex_core::search::SimilarityQuery;
use faceindex_core::ExecutionProviderPolicy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ArgumentError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("missing required argument '{0}'")]
    Missing(String),
    #[error("argument '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

/// Validated view over a request's argument object.
pub struct ArgBag {
    args: Map<String, Value>,
}

impl ArgBag {
    pub fn new(args: Value) -> Result<Self, ArgumentError> {
        match args {
            Value::Object(args) => Ok(Self { args }),
            Value::Null => Ok(Self { args: Map::new() }),
            other => Err(ArgumentError::NotAnObject(json_kind(&other))),
        }
    }

    /// Deserialize a present, non-null argument. Types are not coerced.
    pub fn optional<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ArgumentError> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| ArgumentError::Invalid {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    pub fn required<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgumentError> {
        self.optional(name)?
            .ok_or_else(|| ArgumentError::Missing(name.to_string()))
    }

    pub fn or_default<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, ArgumentError> {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    /// Provider preferences, each falling back to `defaults`.
    pub fn provider_policy(
        &self,
        defaults: &ExecutionProviderPolicy,
    ) -> Result<ExecutionProviderPolicy, ArgumentError> {
        Ok(ExecutionProviderPolicy {
            prefer_coreml: self.or_default("preferCoreml", defaults.prefer_coreml)?,
            prefer_nnapi: self.or_default("preferNnapi", defaults.prefer_nnapi)?,
            prefer_xnnpack: self.or_default("preferXnnpack", defaults.prefer_xnnpack)?,
            allow_cpu_fallback: self.or_default("allowCpuFallback", defaults.allow_cpu_fallback)?,
        })
    }

    /// Runtime configuration with omitted fields taken from `defaults`.
    ///
    /// Empty paths are kept as given; preparing the runtime rejects them
    /// when a requested stage needs them.
    pub fn runtime_config(&self, defaults: &RuntimeConfig) -> Result<RuntimeConfig, ArgumentError> {
        let mut config = defaults.clone();
        let paths = &mut config.model_paths;
        if let Some(path) = self.optional("faceDetectionModelPath")? {
            paths.face_detection = path;
        }
        if let Some(path) = self.optional("faceEmbeddingModelPath")? {
            paths.face_embedding = path;
        }
        if let Some(path) = self.optional("auxiliaryModelPath")? {
            paths.auxiliary = path;
        }
        config.provider_policy = self.provider_policy(&defaults.provider_policy)?;
        Ok(config)
    }

    /// Requested pipeline stages: faces unless `runFaces` is false, CLIP only
    /// when `runClip` is true.
    pub fn model_stages(&self) -> Result<ModelStages, ArgumentError> {
        Ok(ModelStages {
            faces: self.or_default("runFaces", true)?,
            clip: self.or_default("runClip", false)?,
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzeRequest {
    pub file_id: i64,
    pub image_path: String,
    pub runtime: RuntimeConfig,
    pub stages: ModelStages,
}

/// Every operation a worker understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    PrepareRuntime {
        config: RuntimeConfig,
        stages: ModelStages,
    },
    ReleaseRuntime,
    DetectAndEmbedImage(AnalyzeRequest),
    LoadModels {
        models: Vec<ModelSpec>,
        policy: ExecutionProviderPolicy,
    },
    ReleaseModels {
        names: Vec<String>,
    },
    ComputeEmbeddingsForText {
        model_name: String,
        token_ids: Vec<i32>,
    },
    BulkSimilarity {
        cache_key: String,
        queries: Vec<SimilarityQuery>,
    },
    BulkVectorSearch {
        cache_key: String,
        queries: Vec<Vec<f32>>,
        count: usize,
        exact: bool,
    },
    BulkVectorSearchByKey {
        cache_key: String,
        keys: Vec<u64>,
        count: usize,
        exact: bool,
    },
    VectorSearchWithinSimilarity {
        cache_key: String,
        query: Vec<f32>,
        minimum_similarity: f32,
    },
    BulkFilteredVectorSearchWithinDistance {
        cache_key: String,
        queries: Vec<Vec<f32>>,
        allowed_keys: Vec<u64>,
        count: usize,
        max_distance: f32,
    },
    RunIncrementalClustering {
        faces: Vec<ClusteringFace>,
        thresholds: ClusteringThresholds,
    },
    CacheSet {
        key: String,
        value: CacheValue,
    },
    CacheClear {
        key: String,
    },
    CacheClearAll,
}

impl Operation {
    /// Parse a tag and its arguments. Omitted runtime settings come from `defaults`.
    pub fn parse(tag: &str, args: Value, defaults: &RuntimeConfig) -> Result<Self, ArgumentError> {
        let args = ArgBag::new(args)?;
        let op = match tag {
            "prepare-runtime" => Operation::PrepareRuntime {
                config: args.runtime_config(defaults)?,
                stages: args.model_stages()?,
            },
            "release-runtime" => Operation::ReleaseRuntime,
            "detect-and-embed-image" => Operation::DetectAndEmbedImage(AnalyzeRequest {
                file_id: args.required("fileId")?,
                image_path: args.required("imagePath")?,
                runtime: args.runtime_config(defaults)?,
                stages: args.model_stages()?,
            }),
            "load-models" => Operation::LoadModels {
                models: args.required("models")?,
                policy: args.provider_policy(&defaults.provider_policy)?,
            },
            "release-models" => Operation::ReleaseModels {
                names: args.required("names")?,
            },
            "compute-embeddings-for-text" => Operation::ComputeEmbeddingsForText {
                model_name: args.required("modelName")?,
                token_ids: args.required("tokenIds")?,
            },
            "bulk-similarity" => Operation::BulkSimilarity {
                cache_key: args.required("cacheKey")?,
                queries: args.required("queries")?,
            },
            "bulk-vector-search" => Operation::BulkVectorSearch {
                cache_key: args.required("cacheKey")?,
                queries: args.required("queries")?,
                count: args.required("count")?,
                exact: args.or_default("exact", false)?,
            },
            "bulk-vector-search-by-key" => Operation::BulkVectorSearchByKey {
                cache_key: args.required("cacheKey")?,
                keys: args.required("keys")?,
                count: args.required("count")?,
                exact: args.or_default("exact", false)?,
            },
            "vector-search-within-similarity" => Operation::VectorSearchWithinSimilarity {
                cache_key: args.required("cacheKey")?,
                query: args.required("query")?,
                minimum_similarity: args.required("minimumSimilarity")?,
            },
            "bulk-filtered-vector-search-within-distance" => {
                Operation::BulkFilteredVectorSearchWithinDistance {
                    cache_key: args.required("cacheKey")?,
                    queries: args.required("queries")?,
                    allowed_keys: args.required("allowedKeys")?,
                    count: args.required("count")?,
                    max_distance: args.required("maxDistance")?,
                }
            }
            "run-incremental-clustering" => {
                let defaults = ClusteringThresholds::default();
                Operation::RunIncrementalClustering {
                    faces: args.required("faces")?,
                    thresholds: ClusteringThresholds {
                        distance: args.or_default("distanceThreshold", defaults.distance)?,
                        conservative_distance: args.or_default(
                            "conservativeDistanceThreshold",
                            defaults.conservative_distance,
                        )?,
                    },
                }
            }
            "cache-set" => Operation::CacheSet {
                key: args.required("key")?,
                value: args.required("value")?,
            },
            "cache-clear" => Operation::CacheClear {
                key: args.required("key")?,
            },
            "cache-clear-all" => Operation::CacheClearAll,
            other => return Err(ArgumentError::UnknownOperation(other.to_string())),
        };
        Ok(op)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Operation::PrepareRuntime { .. } => "prepare-runtime",
            Operation::ReleaseRuntime => "release-runtime",
            Operation::DetectAndEmbedImage(_) => "detect-and-embed-image",
            Operation::LoadModels { .. } => "load-models",
            Operation::ReleaseModels { .. } => "release-models",
            Operation::ComputeEmbeddingsForText { .. } => "compute-embeddings-for-text",
            Operation::BulkSimilarity { .. } => "bulk-similarity",
            Operation::BulkVectorSearch { .. } => "bulk-vector-search",
            Operation::BulkVectorSearchByKey { .. } => "bulk-vector-search-by-key",
            Operation::VectorSearchWithinSimilarity { .. } => "vector-search-within-similarity",
            Operation::BulkFilteredVectorSearchWithinDistance { .. } => {
                "bulk-filtered-vector-search-within-distance"
            }
            Operation::RunIncrementalClustering { .. } => "run-incremental-clustering",
            Operation::CacheSet { .. } => "cache-set",
            Operation::CacheClear { .. } => "cache-clear",
            Operation::CacheClearAll => "cache-clear-all",
        }
    }

    /// Whether the operation needs the native runtime.
    pub fn uses_runtime(&self) -> bool {
        matches!(
            self,
            Operation::PrepareRuntime { .. }
                | Operation::DetectAndEmbedImage(_)
                | Operation::LoadModels { .. }
                | Operation::ComputeEmbeddingsForText { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::config;
    use serde_json::json;

    fn defaults() -> RuntimeConfig {
        config("/models/det.onnx")
    }

    #[test]
    fn test_prepare_runtime_merges_defaults() {
        let op = Operation::parse(
            "prepare-runtime",
            json!({"faceEmbeddingModelPath": "/x/embed.onnx", "preferXnnpack": true}),
            &defaults(),
        )
        .unwrap();
        let Operation::PrepareRuntime { config: cfg, stages } = op else {
            panic!("wrong operation");
        };
        assert_eq!(cfg.model_paths.face_detection, "/models/det.onnx");
        assert_eq!(cfg.model_paths.face_embedding, "/x/embed.onnx");
        assert!(cfg.provider_policy.prefer_xnnpack);
        assert!(cfg.provider_policy.allow_cpu_fallback);
        assert_eq!(stages, ModelStages::FACES);

        let op = Operation::parse("prepare-runtime", json!({"runClip": true}), &defaults()).unwrap();
        assert!(matches!(op, Operation::PrepareRuntime { stages: ModelStages::ALL, .. }));
    }

    #[test]
    fn test_detect_and_embed_defaults() {
        let op = Operation::parse(
            "detect-and-embed-image",
            json!({"fileId": 42, "imagePath": "/photos/a.jpg"}),
            &defaults(),
        )
        .unwrap();
        let Operation::DetectAndEmbedImage(req) = op else {
            panic!("wrong operation");
        };
        assert_eq!(req.file_id, 42);
        assert_eq!(req.stages, ModelStages::FACES);
    }

    #[test]
    fn test_missing_argument_is_named() {
        let err = Operation::parse("detect-and-embed-image", json!({"fileId": 1}), &defaults())
            .unwrap_err();
        assert_eq!(err, ArgumentError::Missing("imagePath".into()));
    }

    #[test]
    fn test_types_are_not_coerced() {
        let err = Operation::parse(
            "detect-and-embed-image",
            json!({"fileId": "42", "imagePath": "/a.jpg"}),
            &defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, ArgumentError::Invalid { ref name, .. } if name == "fileId"));

        let err = Operation::parse("bulk-vector-search", json!({"cacheKey": "k", "queries": [[1.0]], "count": -1}), &defaults())
            .unwrap_err();
        assert!(matches!(err, ArgumentError::Invalid { ref name, .. } if name == "count"));
    }

    #[test]
    fn test_unknown_operation_and_bad_args() {
        assert_eq!(
            Operation::parse("enroll", json!({}), &defaults()).unwrap_err(),
            ArgumentError::UnknownOperation("enroll".into())
        );
        assert_eq!(
            Operation::parse("cache-clear-all", json!([1]), &defaults()).unwrap_err(),
            ArgumentError::NotAnObject("an array")
        );
        assert_eq!(
            Operation::parse("cache-clear-all", Value::Null, &defaults()).unwrap(),
            Operation::CacheClearAll
        );
    }

    #[test]
    fn test_search_and_cache_operations() {
        let op = Operation::parse(
            "bulk-similarity",
            json!({"cacheKey": "faces", "queries": [{"vector": [1.0, 0.0], "threshold": 0.5}]}),
            &defaults(),
        )
        .unwrap();
        assert_eq!(op.tag(), "bulk-similarity");
        assert!(!op.uses_runtime());

        let op = Operation::parse(
            "cache-set",
            json!({"key": "faces", "value": {"embeddings": [{"id": 1, "vector": [1.0]}]}}),
            &defaults(),
        )
        .unwrap();
        assert!(matches!(op, Operation::CacheSet { value: CacheValue::Embeddings(_), .. }));
    }

    #[test]
    fn test_clustering_thresholds() {
        let op = Operation::parse(
            "run-incremental-clustering",
            json!({
                "faces": [{"faceId": "1_0_0_1_1", "embedding": [1.0], "blur": 50.0}],
                "distanceThreshold": 0.3
            }),
            &defaults(),
        )
        .unwrap();
        let Operation::RunIncrementalClustering { faces, thresholds } = op else {
            panic!("wrong operation");
        };
        assert_eq!(faces[0].cluster_id, None);
        assert_eq!(thresholds.distance, 0.3);
        assert_eq!(thresholds.conservative_distance, 0.06);
    }

    #[test]
    fn test_every_tag_round_trips() {
        let cases = [
            ("release-runtime", json!({})),
            ("load-models", json!({"models": [{"name": "text", "path": "/m.onnx"}]})),
            ("release-models", json!({"names": ["text"]})),
            ("compute-embeddings-for-text", json!({"modelName": "text", "tokenIds": [1, 2]})),
            ("bulk-vector-search-by-key", json!({"cacheKey": "k", "keys": [1], "count": 3})),
            (
                "vector-search-within-similarity",
                json!({"cacheKey": "k", "query": [1.0], "minimumSimilarity": 0.7}),
            ),
            (
                "bulk-filtered-vector-search-within-distance",
                json!({"cacheKey": "k", "queries": [[1.0]], "allowedKeys": [1], "count": 2, "maxDistance": 0.3}),
            ),
            ("cache-clear", json!({"key": "k"})),
        ];
        for (tag, args) in cases {
            let op = Operation::parse(tag, args, &defaults()).unwrap();
            assert_eq!(op.tag(), tag);
        }
    }
}
