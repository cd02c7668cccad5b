//! CLIP image and text embeddings.
//!
//! The image encoder sees the whole photo resized to cover 256×256 and center
//! cropped. The text encoder runs on token ids produced by the caller.

use crate::onnx::{InferenceError, InferenceSession, TensorInput, TensorOutput};
use crate::search::l2_normalize;
use crate::types::DecodedImage;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const CLIP_INPUT_SIZE: u32 = 256;

#[derive(Error, Debug)]
pub enum ClipError {
    #[error("cannot embed an image with zero dimensions")]
    EmptyImage,
    #[error("token id list is empty")]
    EmptyTokens,
    #[error("unsupported CLIP output shape {0:?}")]
    OutputShape(Vec<i64>),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// L2-normalized CLIP embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipEmbedding {
    pub embedding: Vec<f32>,
}

/// Embed a whole image with the CLIP image encoder.
pub fn embed_image(
    session: &mut dyn InferenceSession,
    image: &DecodedImage,
) -> Result<ClipEmbedding, ClipError> {
    let input = preprocess(image)?;
    let size = CLIP_INPUT_SIZE as usize;
    let output = session.run(TensorInput::f32(vec![1, 3, size, size], input))?;
    Ok(ClipEmbedding {
        embedding: single_embedding(output)?,
    })
}

/// Embed caller-tokenized text with a CLIP text encoder.
pub fn embed_text(
    session: &mut dyn InferenceSession,
    token_ids: &[i32],
) -> Result<ClipEmbedding, ClipError> {
    if token_ids.is_empty() {
        return Err(ClipError::EmptyTokens);
    }
    let output = session.run(TensorInput::i32(vec![1, token_ids.len()], token_ids.to_vec()))?;
    Ok(ClipEmbedding {
        embedding: single_embedding(output)?,
    })
}

/// Accept `[d]` or `[1, d]` outputs and normalize.
fn single_embedding(output: TensorOutput) -> Result<Vec<f32>, ClipError> {
    match output.shape.as_slice() {
        [_] | [1, _] => {
            let mut embedding = output.data;
            l2_normalize(&mut embedding);
            Ok(embedding)
        }
        _ => Err(ClipError::OutputShape(output.shape)),
    }
}

/// Resize to cover 256×256, center crop, planar RGB in `[0, 1]`.
fn preprocess(image: &DecodedImage) -> Result<Vec<f32>, ClipError> {
    let (w, h) = (image.dimensions.width, image.dimensions.height);
    if w == 0 || h == 0 {
        return Err(ClipError::EmptyImage);
    }

    let target = CLIP_INPUT_SIZE as f32;
    let scale = (target / w as f32).max(target / h as f32);
    let scaled_w = ((w as f32 * scale).round() as u32).max(CLIP_INPUT_SIZE);
    let scaled_h = ((h as f32 * scale).round() as u32).max(CLIP_INPUT_SIZE);
    let resized = imageops::resize(&image.rgb, scaled_w, scaled_h, FilterType::Triangle);

    let start_x = (scaled_w - CLIP_INPUT_SIZE) / 2;
    let start_y = (scaled_h - CLIP_INPUT_SIZE) / 2;
    let plane = (CLIP_INPUT_SIZE * CLIP_INPUT_SIZE) as usize;
    let mut tensor = vec![0.0f32; 3 * plane];
    for y in 0..CLIP_INPUT_SIZE {
        for x in 0..CLIP_INPUT_SIZE {
            let px = resized.get_pixel(start_x + x, start_y + y).0;
            let idx = (y * CLIP_INPUT_SIZE + x) as usize;
            for (c, &v) in px.iter().enumerate() {
                tensor[c * plane + idx] = v as f32 / 255.0;
            }
        }
    }
    Ok(tensor)
}
