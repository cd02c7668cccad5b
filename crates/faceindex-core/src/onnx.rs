//! ONNX Runtime session seam.
//!
//! Pipeline stages talk to models through [`InferenceSession`] so they can be
//! driven by a real `ort` session in production and by canned outputs in tests.

use ndarray::{ArrayD, IxDyn};
use ort::ep;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("no execution provider selected while CPU fallback is disabled")]
    NoExecutionProvider,
    #[error("failed to create session for '{path}' across provider fallbacks: {errors}")]
    SessionCreation { path: String, errors: String },
    #[error("input shape {shape:?} does not match {len} values")]
    InputShape { shape: Vec<usize>, len: usize },
    #[error("model produced no outputs")]
    MissingOutput,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Execution provider preferences for session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionProviderPolicy {
    pub prefer_coreml: bool,
    pub prefer_nnapi: bool,
    pub prefer_xnnpack: bool,
    pub allow_cpu_fallback: bool,
}

impl Default for ExecutionProviderPolicy {
    fn default() -> Self {
        Self {
            prefer_coreml: true,
            prefer_nnapi: true,
            prefer_xnnpack: false,
            allow_cpu_fallback: true,
        }
    }
}

/// Element data of a model input.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A single dense model input.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInput {
    pub shape: Vec<usize>,
    pub data: TensorData,
}

impl TensorInput {
    pub fn f32(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data: TensorData::F32(data),
        }
    }

    pub fn i32(shape: Vec<usize>, data: Vec<i32>) -> Self {
        Self {
            shape,
            data: TensorData::I32(data),
        }
    }
}

/// First output of a model, flattened row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorOutput {
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// A loaded model that maps one input tensor to its first output tensor.
pub trait InferenceSession: Send {
    fn run(&mut self, input: TensorInput) -> Result<TensorOutput, InferenceError>;
}

/// `ort`-backed session.
pub struct OrtSession {
    session: Session,
}

impl OrtSession {
    /// Load a model from disk honoring the execution provider policy.
    pub fn load(model_path: &str, policy: &ExecutionProviderPolicy) -> Result<Self, InferenceError> {
        let session = build_session(model_path, policy)?;
        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ONNX model"
        );
        Ok(Self { session })
    }
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: TensorInput) -> Result<TensorOutput, InferenceError> {
        let shape = input.shape.clone();
        let len = input.data.len();
        let mismatch = |_| InferenceError::InputShape {
            shape: shape.clone(),
            len,
        };

        let outputs = match input.data {
            TensorData::F32(data) => {
                let array = ArrayD::from_shape_vec(IxDyn(&input.shape), data).map_err(mismatch)?;
                self.session
                    .run(ort::inputs![TensorRef::from_array_view(array.view())?])?
            }
            TensorData::I32(data) => {
                let array = ArrayD::from_shape_vec(IxDyn(&input.shape), data).map_err(mismatch)?;
                self.session
                    .run(ort::inputs![TensorRef::from_array_view(array.view())?])?
            }
        };

        if outputs.len() == 0 {
            return Err(InferenceError::MissingOutput);
        }
        let (out_shape, out_data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(TensorOutput {
            shape: out_shape.iter().copied().collect(),
            data: out_data.to_vec(),
        })
    }
}

/// Execution providers a session can be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    CoreMl,
    Nnapi,
    Xnnpack,
    Cpu,
}

/// Create a session, falling back through progressively simpler provider sets.
///
/// Order: preferred providers, then without XNNPACK, then CPU only. The last
/// two steps only run when CPU fallback is allowed. Every failure is reported.
pub fn build_session(model_path: &str, policy: &ExecutionProviderPolicy) -> Result<Session, InferenceError> {
    if !Path::new(model_path).exists() {
        return Err(InferenceError::ModelNotFound(model_path.to_string()));
    }
    create_with_fallback(model_path, &provider_attempts(policy), |providers| {
        commit_with_providers(model_path, providers)
    })
}

/// Provider sets to try, in order. Accelerators missing on this platform are
/// left out, and empty sets are skipped.
pub fn provider_attempts(policy: &ExecutionProviderPolicy) -> Vec<Vec<Provider>> {
    let mut accelerators = Vec::new();
    if cfg!(target_vendor = "apple") && policy.prefer_coreml {
        accelerators.push(Provider::CoreMl);
    }
    if cfg!(target_os = "android") && policy.prefer_nnapi {
        accelerators.push(Provider::Nnapi);
    }

    let mut preferred = accelerators.clone();
    if policy.prefer_xnnpack {
        preferred.push(Provider::Xnnpack);
    }
    if policy.allow_cpu_fallback {
        preferred.push(Provider::Cpu);
    }

    let mut attempts = vec![preferred];
    if policy.allow_cpu_fallback {
        if policy.prefer_xnnpack {
            let mut without_xnnpack = accelerators;
            without_xnnpack.push(Provider::Cpu);
            attempts.push(without_xnnpack);
        }
        attempts.push(vec![Provider::Cpu]);
    }
    attempts.retain(|providers| !providers.is_empty());
    attempts.dedup();
    attempts
}

/// Run `create` for each provider set until one succeeds.
pub fn create_with_fallback<T, E: std::fmt::Display>(
    model_path: &str,
    attempts: &[Vec<Provider>],
    mut create: impl FnMut(&[Provider]) -> Result<T, E>,
) -> Result<T, InferenceError> {
    if attempts.is_empty() {
        return Err(InferenceError::NoExecutionProvider);
    }
    let mut errors = Vec::with_capacity(attempts.len());
    for providers in attempts {
        match create(providers) {
            Ok(session) => {
                if !errors.is_empty() {
                    tracing::info!(path = model_path, ?providers, "session created after fallback");
                }
                return Ok(session);
            }
            Err(e) => {
                tracing::warn!(path = model_path, ?providers, error = %e, "session creation attempt failed");
                errors.push(format!("{providers:?}: {e}"));
            }
        }
    }
    Err(InferenceError::SessionCreation {
        path: model_path.to_string(),
        errors: errors.join(" | "),
    })
}

/// Accelerators fail registration loudly so the next attempt can run.
fn dispatch(provider: Provider) -> Option<ep::ExecutionProviderDispatch> {
    match provider {
        #[cfg(target_vendor = "apple")]
        Provider::CoreMl => Some(ep::CoreML::default().build().error_on_failure()),
        #[cfg(target_os = "android")]
        Provider::Nnapi => Some(ep::NNAPI::default().build().error_on_failure()),
        Provider::Xnnpack => Some(ep::XNNPACK::default().build().error_on_failure()),
        Provider::Cpu => Some(ep::CPU::default().build()),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

fn commit_with_providers(model_path: &str, providers: &[Provider]) -> Result<Session, ort::Error> {
    let providers: Vec<_> = providers.iter().copied().filter_map(dispatch).collect();
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(1)?
        .with_inter_threads(1)?
        .with_execution_providers(providers)?
        .commit_from_file(model_path)?;
    Ok(session)
}
