//! Direction-aware blur scoring of aligned faces.
//!
//! The score is the variance of a 3×3 Laplacian over the grayscale face, after
//! dropping a band of columns on the side the face is turned away from. Low
//! values mean blurry faces.

use crate::types::FaceDetection;
use image::RgbImage;
use ndarray::Array2;
use thiserror::Error;

/// Faces scoring below this are treated as blurry downstream.
pub const LAPLACIAN_HARD_THRESHOLD: f32 = 10.0;

/// Width of the column band removed before filtering.
const REMOVED_COLUMNS: usize = 56;

const LAPLACIAN_KERNEL: [[i32; 3]; 3] = [[0, 1, 0], [1, -4, 1], [0, 1, 0]];

#[derive(Error, Debug, PartialEq)]
pub enum BlurError {
    #[error("got {faces} aligned faces but {detections} detections")]
    LengthMismatch { faces: usize, detections: usize },
    #[error("face crop {width}x{height} is too small to score")]
    FaceTooSmall { width: u32, height: u32 },
}

/// Which way a face is turned, judged from its landmarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceDirection {
    Straight,
    Left,
    Right,
}

impl FaceDirection {
    /// Classify from pixel-space landmarks.
    ///
    /// A face looks left (or right) when its nose lies beyond both eyes and
    /// both mouth corners on that side, or when the face is upright and the
    /// nose sits within a fifth of the eye distance of that eye.
    pub fn from_detection(detection: &FaceDetection) -> Self {
        let [left_eye, right_eye, nose, left_mouth, right_mouth] = detection.landmarks;

        let eye_dx = (right_eye.x - left_eye.x).abs();
        let eye_dy = (right_eye.y - left_eye.y).abs();
        let mouth_dy = (right_mouth.y - left_mouth.y).abs();

        let upright = left_eye.y.max(right_eye.y) + 0.5 * eye_dy < nose.y
            && nose.y + 0.5 * mouth_dy < left_mouth.y.min(right_mouth.y);

        let nose_out_left =
            nose.x < left_eye.x.min(right_eye.x) && nose.x < left_mouth.x.min(right_mouth.x);
        let nose_out_right =
            nose.x > left_eye.x.max(right_eye.x) && nose.x > left_mouth.x.max(right_mouth.x);

        let near_left_eye = (nose.x - left_eye.x).abs() < 0.2 * eye_dx;
        let near_right_eye = (nose.x - right_eye.x).abs() < 0.2 * eye_dx;

        if nose_out_left || (upright && near_left_eye) {
            FaceDirection::Left
        } else if nose_out_right || (upright && near_right_eye) {
            FaceDirection::Right
        } else {
            FaceDirection::Straight
        }
    }

    /// First kept column after removing the band.
    fn first_column(self) -> usize {
        match self {
            FaceDirection::Straight => REMOVED_COLUMNS / 2,
            FaceDirection::Left => REMOVED_COLUMNS,
            FaceDirection::Right => 0,
        }
    }
}

/// Luma of an RGB image, rounded to integers.
fn grayscale(face: &RgbImage) -> Array2<i32> {
    let (w, h) = face.dimensions();
    Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
        let [r, g, b] = face.get_pixel(x as u32, y as u32).0;
        (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
            .round()
            .clamp(0.0, 255.0) as i32
    })
}

/// Reflect an out-of-range index back inside `0..len` without repeating the edge.
fn reflect(i: isize, len: usize) -> usize {
    if i < 0 {
        (-i) as usize
    } else if i as usize >= len {
        2 * len - 2 - i as usize
    } else {
        i as usize
    }
}

fn laplacian(gray: &Array2<i32>) -> Array2<i32> {
    let (rows, cols) = gray.dim();
    Array2::from_shape_fn((rows, cols), |(y, x)| {
        let mut sum = 0;
        for (ky, kernel_row) in LAPLACIAN_KERNEL.iter().enumerate() {
            for (kx, &k) in kernel_row.iter().enumerate() {
                if k == 0 {
                    continue;
                }
                let sy = reflect(y as isize + ky as isize - 1, rows);
                let sx = reflect(x as isize + kx as isize - 1, cols);
                sum += gray[[sy, sx]] * k;
            }
        }
        sum
    })
}

fn variance(values: &Array2<i32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f32;
    let mean = values.iter().map(|&v| v as f32).sum::<f32>() / n;
    values
        .iter()
        .map(|&v| {
            let d = v as f32 - mean;
            d * d
        })
        .sum::<f32>()
        / n
}

/// Blur score for one aligned face.
pub fn blur_score(face: &RgbImage, direction: FaceDirection) -> Result<f32, BlurError> {
    let (width, height) = face.dimensions();
    if (width as usize) < REMOVED_COLUMNS + 2 || height < 2 {
        return Err(BlurError::FaceTooSmall { width, height });
    }

    let gray = grayscale(face);
    let start = direction.first_column();
    let kept = gray.slice(ndarray::s![.., start..start + width as usize - REMOVED_COLUMNS]);
    let score = variance(&laplacian(&kept.to_owned()));

    if score.is_finite() {
        Ok(score)
    } else {
        tracing::warn!(?direction, "non-finite blur variance, using fallback");
        Ok(LAPLACIAN_HARD_THRESHOLD + 1.0)
    }
}

/// Blur scores for a batch of aligned faces and their pixel-space detections.
pub fn blur_scores(faces: &[RgbImage], detections: &[FaceDetection]) -> Result<Vec<f32>, BlurError> {
    if faces.len() != detections.len() {
        return Err(BlurError::LengthMismatch {
            faces: faces.len(),
            detections: detections.len(),
        });
    }
    faces
        .iter()
        .zip(detections)
        .map(|(face, det)| blur_score(face, FaceDirection::from_detection(det)))
        .collect()
}
