//! MobileFaceNet face embedder via ONNX Runtime.
//!
//! Maps a batch of aligned 112×112 RGB crops to one 192-dimensional vector per
//! face in a single model invocation. Vectors are returned as produced by the
//! model; callers normalize.

use crate::alignment::ALIGNED_FACE_SIZE;
use crate::onnx::{InferenceError, InferenceSession, TensorInput};
use image::RgbImage;
use ndarray::Array4;
use thiserror::Error;

const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;
pub const EMBEDDING_DIM: usize = 192;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("aligned face {index} is {width}x{height}, expected 112x112")]
    FaceSize { index: usize, width: u32, height: u32 },
    #[error("embedding output has {len} values for {faces} faces of dimension 192")]
    OutputSize { len: usize, faces: usize },
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Embed a batch of aligned faces. An empty batch skips the model.
pub fn embed_faces(
    session: &mut dyn InferenceSession,
    faces: &[RgbImage],
) -> Result<Vec<Vec<f32>>, EmbedderError> {
    if faces.is_empty() {
        return Ok(Vec::new());
    }

    let input = preprocess(faces)?;
    let shape = input.shape().to_vec();
    let (data, _) = input.into_raw_vec_and_offset();
    let output = session.run(TensorInput::f32(shape, data))?;

    if output.data.len() != faces.len() * EMBEDDING_DIM {
        return Err(EmbedderError::OutputSize {
            len: output.data.len(),
            faces: faces.len(),
        });
    }

    tracing::debug!(faces = faces.len(), "computed face embeddings");
    Ok(output
        .data
        .chunks_exact(EMBEDDING_DIM)
        .map(<[f32]>::to_vec)
        .collect())
}

/// Pack aligned crops into an NHWC tensor scaled to `[-1, 1]`.
fn preprocess(faces: &[RgbImage]) -> Result<Array4<f32>, EmbedderError> {
    let size = ALIGNED_FACE_SIZE as usize;
    for (index, face) in faces.iter().enumerate() {
        let (width, height) = face.dimensions();
        if width != ALIGNED_FACE_SIZE || height != ALIGNED_FACE_SIZE {
            return Err(EmbedderError::FaceSize { index, width, height });
        }
    }

    Ok(Array4::from_shape_fn((faces.len(), size, size, 3), |(n, y, x, c)| {
        let px = faces[n].get_pixel(x as u32, y as u32).0[c] as f32;
        (px - EMBEDDER_MEAN) / EMBEDDER_STD
    }))
}
