//! Per-image indexing: detect → align → blur → embed, plus optional CLIP.

use crate::alignment::{self, AlignmentError};
use crate::blur::{self, BlurError};
use crate::clip::{self, ClipEmbedding, ClipError};
use crate::detector::{self, DetectorError};
use crate::embedder::{self, EmbedderError};
use crate::onnx::InferenceSession;
use crate::search::l2_normalize;
use crate::types::{face_id, CoordinateError, DecodedImage, Dimensions, Face};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detection: {0}")]
    Detector(#[from] DetectorError),
    #[error("alignment: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("blur: {0}")]
    Blur(#[from] BlurError),
    #[error("embedding: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("clip: {0}")]
    Clip(#[from] ClipError),
    #[error("coordinates: {0}")]
    Coordinates(#[from] CoordinateError),
}

/// Sessions used for one image. Unused stages may be `None`.
pub struct PipelineSessions<'a> {
    pub detector: Option<&'a mut dyn InferenceSession>,
    pub embedder: Option<&'a mut dyn InferenceSession>,
    pub clip_image: Option<&'a mut dyn InferenceSession>,
}

/// Result of indexing one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAnalysis {
    pub file_id: i64,
    pub decoded_image_size: Dimensions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<Face>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip: Option<ClipEmbedding>,
}

/// Detect, align, score and embed every face in `image`.
///
/// Returned detections are image-relative and embeddings are unit length.
pub fn index_faces(
    detector_session: &mut dyn InferenceSession,
    embedder_session: &mut dyn InferenceSession,
    file_id: i64,
    image: &DecodedImage,
) -> Result<Vec<Face>, PipelineError> {
    let detections = detector::detect_faces(detector_session, image)?;
    if detections.is_empty() {
        return Ok(Vec::new());
    }

    let mut alignments = Vec::with_capacity(detections.len());
    let mut crops = Vec::with_capacity(detections.len());
    for detection in &detections {
        let alignment = alignment::align_detection(detection)?;
        crops.push(alignment::warp_face(&image.rgb, &alignment));
        alignments.push(alignment);
    }

    let blurs = blur::blur_scores(&crops, &detections)?;
    let embeddings = embedder::embed_faces(embedder_session, &crops)?;

    let faces = detections
        .into_iter()
        .zip(alignments)
        .zip(blurs)
        .zip(embeddings)
        .map(|(((detection, alignment), blur), mut embedding)| {
            l2_normalize(&mut embedding);
            let relative = detection.into_relative(image.dimensions)?;
            Ok(Face {
                face_id: face_id(file_id, &relative.bbox),
                detection: relative,
                alignment,
                blur,
                embedding,
            })
        })
        .collect::<Result<Vec<_>, PipelineError>>()?;

    tracing::debug!(file_id, faces = faces.len(), "indexed faces");
    Ok(faces)
}

/// Run the requested stages on one decoded image.
///
/// A stage runs only when its sessions are present.
pub fn analyze_image(
    sessions: PipelineSessions<'_>,
    file_id: i64,
    image: &DecodedImage,
) -> Result<ImageAnalysis, PipelineError> {
    let faces = match (sessions.detector, sessions.embedder) {
        (Some(detector), Some(embedder)) => Some(index_faces(detector, embedder, file_id, image)?),
        _ => None,
    };
    let clip = match sessions.clip_image {
        Some(session) => Some(clip::embed_image(session, image)?),
        None => None,
    };
    Ok(ImageAnalysis {
        file_id,
        decoded_image_size: image.dimensions,
        faces,
        clip,
    })
}
