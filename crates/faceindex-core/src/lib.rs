//! faceindex-core: on-device face indexing engine.
//!
//! Detects faces with a YOLO-style model, aligns them onto the MobileFaceNet
//! template, scores blur, embeds them and searches the resulting vectors.
//! All models run through ONNX Runtime behind [`onnx::InferenceSession`].

pub mod alignment;
pub mod blur;
pub mod clip;
pub mod clustering;
pub mod decode;
pub mod detector;
pub mod embedder;
pub mod geometry;
pub mod onnx;
pub mod pipeline;
pub mod search;
pub mod types;

pub use geometry::{BoundingBox, Point};
pub use onnx::{ExecutionProviderPolicy, InferenceError, InferenceSession, OrtSession};
pub use pipeline::{analyze_image, index_faces, ImageAnalysis, PipelineError, PipelineSessions};
pub use types::{DecodedImage, Dimensions, Face, FaceAlignment, FaceDetection};
