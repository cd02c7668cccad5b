//! Native runtime lifecycle.
//!
//! [`RuntimeManager`] owns every model session of a worker. It moves between
//! *unloaded* and *loaded with fingerprint F*, where F hashes the model paths
//! and provider preferences. Preparing with an unchanged fingerprint does
//! nothing; anything else rebuilds all sessions before swapping them in.
//! Models with an empty path are skipped, so a worker that never runs CLIP
//! does not need the auxiliary model.

use faceindex_core::onnx::OrtSession;
use faceindex_core::{ExecutionProviderPolicy, InferenceError, InferenceSession};
use ort::environment::Environment;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("missing required model paths: {}", .0.join(", "))]
    MissingModelPaths(Vec<String>),
    #[error("runtime is not prepared")]
    NotPrepared,
    #[error("model '{0}' is not loaded")]
    UnknownModel(String),
    #[error("runtime binding failed: {0}")]
    Binding(String),
    #[error("failed to release {0} session(s)")]
    Release(usize),
    #[error("model load failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("failed to encode runtime config: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

/// Files for the three fixed runtime models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPaths {
    pub face_detection: String,
    pub face_embedding: String,
    /// CLIP image encoder.
    pub auxiliary: String,
}

/// Effective runtime configuration of one prepare request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub model_paths: ModelPaths,
    pub provider_policy: ExecutionProviderPolicy,
}

/// Pipeline stages a request needs models for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStages {
    /// Detection and embedding.
    pub faces: bool,
    /// CLIP image encoding with the auxiliary model.
    pub clip: bool,
}

impl ModelStages {
    pub const FACES: ModelStages = ModelStages {
        faces: true,
        clip: false,
    };
    pub const ALL: ModelStages = ModelStages {
        faces: true,
        clip: true,
    };
}

impl RuntimeConfig {
    /// Hex SHA-256 of the canonical JSON form.
    pub fn fingerprint(&self) -> Result<String, RuntimeError> {
        // Field order is fixed by the struct definitions.
        let canonical = serde_json::to_vec(self)?;
        Ok(Sha256::digest(&canonical)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect())
    }

    /// Wire names of the empty model paths that `stages` needs.
    pub fn missing_model_paths(&self, stages: ModelStages) -> Vec<String> {
        let paths = &self.model_paths;
        [
            (stages.faces, "faceDetectionModelPath", &paths.face_detection),
            (stages.faces, "faceEmbeddingModelPath", &paths.face_embedding),
            (stages.clip, "auxiliaryModelPath", &paths.auxiliary),
        ]
        .into_iter()
        .filter(|(needed, _, path)| *needed && path.trim().is_empty())
        .map(|(_, name, _)| name.to_string())
        .collect()
    }
}

/// Low-level model loading primitives.
pub trait ModelLoader: Send {
    /// Attach the native runtime binding. Called at most once per attach.
    fn init(&mut self) -> Result<(), RuntimeError>;

    fn load(
        &mut self,
        path: &str,
        policy: &ExecutionProviderPolicy,
    ) -> Result<Box<dyn InferenceSession>, InferenceError>;

    fn release(&mut self, session: Box<dyn InferenceSession>) -> Result<(), RuntimeError>;

    /// Detach the native runtime binding.
    fn detach(&mut self) -> Result<(), RuntimeError>;
}

/// ONNX Runtime loader.
///
/// Holds a handle to the ONNX Runtime environment while attached.
#[derive(Debug, Default)]
pub struct OrtLoader {
    environment: Option<Arc<Environment>>,
}

impl ModelLoader for OrtLoader {
    fn init(&mut self) -> Result<(), RuntimeError> {
        if !ort::init().with_name("faceindex").commit() {
            tracing::debug!("ONNX Runtime environment options were already set");
        }
        let environment = Environment::current().map_err(|e| RuntimeError::Binding(e.to_string()))?;
        self.environment = Some(environment);
        tracing::info!("ONNX Runtime environment initialized");
        Ok(())
    }

    fn load(
        &mut self,
        path: &str,
        policy: &ExecutionProviderPolicy,
    ) -> Result<Box<dyn InferenceSession>, InferenceError> {
        Ok(Box::new(OrtSession::load(path, policy)?))
    }

    fn release(&mut self, session: Box<dyn InferenceSession>) -> Result<(), RuntimeError> {
        drop(session);
        Ok(())
    }

    fn detach(&mut self) -> Result<(), RuntimeError> {
        // Other holders of the environment keep it alive.
        self.environment = None;
        tracing::debug!("ONNX Runtime binding detached");
        Ok(())
    }
}

/// Outcome of [`RuntimeManager::prepare`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareOutcome {
    pub reinitialized: bool,
    pub fingerprint: String,
}

/// Mutable access to the prepared sessions. A model whose path was empty
/// has no session.
pub struct RuntimeSessions<'a> {
    pub detector: Option<&'a mut dyn InferenceSession>,
    pub embedder: Option<&'a mut dyn InferenceSession>,
    pub auxiliary: Option<&'a mut dyn InferenceSession>,
}

type SessionSlot = Option<Box<dyn InferenceSession>>;

struct LoadedRuntime {
    fingerprint: String,
    detector: SessionSlot,
    embedder: SessionSlot,
    auxiliary: SessionSlot,
}

fn session_mut(slot: &mut SessionSlot) -> Option<&mut dyn InferenceSession> {
    match slot {
        Some(session) => Some(session.as_mut()),
        None => None,
    }
}

struct NamedModel {
    path: String,
    session: Box<dyn InferenceSession>,
}

pub struct RuntimeManager<L: ModelLoader> {
    loader: L,
    attached: bool,
    loaded: Option<LoadedRuntime>,
    named: HashMap<String, NamedModel>,
}

impl<L: ModelLoader> RuntimeManager<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            attached: false,
            loaded: None,
            named: HashMap::new(),
        }
    }

    /// Attach the runtime binding once. Later calls are no-ops.
    pub fn ensure_loaded(&mut self) -> Result<(), RuntimeError> {
        if !self.attached {
            self.loader.init()?;
            self.attached = true;
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.loaded.as_ref().map(|l| l.fingerprint.as_str())
    }

    pub fn is_prepared(&self) -> bool {
        self.loaded.is_some()
    }

    /// Load the sessions for `config` unless they are already loaded.
    ///
    /// Every path `stages` needs must be set; other empty paths are skipped.
    /// On failure nothing changes: previously loaded sessions and their
    /// fingerprint stay in place.
    pub fn prepare(
        &mut self,
        config: &RuntimeConfig,
        stages: ModelStages,
    ) -> Result<PrepareOutcome, RuntimeError> {
        self.ensure_loaded()?;
        let missing = config.missing_model_paths(stages);
        if !missing.is_empty() {
            return Err(RuntimeError::MissingModelPaths(missing));
        }

        let fingerprint = config.fingerprint()?;
        if self.fingerprint() == Some(fingerprint.as_str()) {
            tracing::debug!(%fingerprint, "runtime already prepared");
            return Ok(PrepareOutcome {
                reinitialized: false,
                fingerprint,
            });
        }

        let paths = &config.model_paths;
        let policy = &config.provider_policy;
        let mut fresh: Vec<SessionSlot> = Vec::with_capacity(3);
        for path in [&paths.face_detection, &paths.face_embedding, &paths.auxiliary] {
            if path.trim().is_empty() {
                fresh.push(None);
                continue;
            }
            match self.loader.load(path, policy) {
                Ok(session) => fresh.push(Some(session)),
                Err(e) => {
                    for session in fresh.into_iter().flatten() {
                        let _ = self.loader.release(session);
                    }
                    return Err(e.into());
                }
            }
        }
        let mut fresh = fresh.into_iter();
        let previous = self.loaded.replace(LoadedRuntime {
            fingerprint: fingerprint.clone(),
            detector: fresh.next().flatten(),
            embedder: fresh.next().flatten(),
            auxiliary: fresh.next().flatten(),
        });
        if let Some(old) = previous {
            self.release_runtime_sessions(old);
        }

        tracing::info!(
            %fingerprint,
            detection = %paths.face_detection,
            embedding = %paths.face_embedding,
            auxiliary = %paths.auxiliary,
            "runtime prepared"
        );
        Ok(PrepareOutcome {
            reinitialized: true,
            fingerprint,
        })
    }

    pub fn sessions(&mut self) -> Result<RuntimeSessions<'_>, RuntimeError> {
        let loaded = self.loaded.as_mut().ok_or(RuntimeError::NotPrepared)?;
        Ok(RuntimeSessions {
            detector: session_mut(&mut loaded.detector),
            embedder: session_mut(&mut loaded.embedder),
            auxiliary: session_mut(&mut loaded.auxiliary),
        })
    }

    /// Load a named auxiliary model. Returns `false` when the same path is
    /// already loaded under that name.
    pub fn load_named(
        &mut self,
        name: &str,
        path: &str,
        policy: &ExecutionProviderPolicy,
    ) -> Result<bool, RuntimeError> {
        self.ensure_loaded()?;
        if self.named.get(name).is_some_and(|m| m.path == path) {
            return Ok(false);
        }
        if path.trim().is_empty() {
            return Err(RuntimeError::MissingModelPaths(vec![format!("models.{name}.path")]));
        }

        let session = self.loader.load(path, policy)?;
        let previous = self.named.insert(
            name.to_string(),
            NamedModel {
                path: path.to_string(),
                session,
            },
        );
        if let Some(old) = previous {
            if let Err(e) = self.loader.release(old.session) {
                tracing::warn!(name, error = %e, "failed to release replaced model");
            }
        }
        tracing::info!(name, path, "named model loaded");
        Ok(true)
    }

    /// Release named models. Returns the names that were loaded.
    pub fn release_named(&mut self, names: &[String]) -> Vec<String> {
        let mut released = Vec::new();
        for name in names {
            if let Some(model) = self.named.remove(name) {
                if let Err(e) = self.loader.release(model.session) {
                    tracing::warn!(name = %name, error = %e, "failed to release model");
                }
                released.push(name.clone());
            }
        }
        released
    }

    pub fn named_session(&mut self, name: &str) -> Result<&mut dyn InferenceSession, RuntimeError> {
        match self.named.get_mut(name) {
            Some(model) => Ok(model.session.as_mut()),
            None => Err(RuntimeError::UnknownModel(name.to_string())),
        }
    }

    /// Free every session and forget the fingerprint.
    ///
    /// Best effort: all sessions are attempted even if some fail, and the
    /// state is unloaded either way. The result only reports failures.
    pub fn release(&mut self) -> Result<(), RuntimeError> {
        let mut failures = 0;
        if let Some(loaded) = self.loaded.take() {
            failures += self.release_runtime_sessions(loaded);
        }
        for (name, model) in self.named.drain() {
            if let Err(e) = self.loader.release(model.session) {
                tracing::warn!(name = %name, error = %e, "failed to release model");
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(RuntimeError::Release(failures));
        }
        Ok(())
    }

    /// Release everything and detach the runtime binding. Never fails.
    pub fn dispose(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "release during dispose failed");
        }
        if self.attached {
            if let Err(e) = self.loader.detach() {
                tracing::warn!(error = %e, "runtime detach failed");
            }
            self.attached = false;
            tracing::info!("runtime disposed");
        }
    }

    fn release_runtime_sessions(&mut self, loaded: LoadedRuntime) -> usize {
        let mut failures = 0;
        for session in [loaded.detector, loaded.embedder, loaded.auxiliary]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.loader.release(session) {
                tracing::warn!(error = %e, "failed to release runtime session");
                failures += 1;
            }
        }
        failures
    }
}
