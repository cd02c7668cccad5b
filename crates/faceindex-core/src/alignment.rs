//! Face alignment via 4-DOF similarity transform.
//!
//! Maps detected landmarks onto the MobileFaceNet reference landmarks with a
//! least-squares fit, derives the alignment descriptor (center, size,
//! rotation) and warps the face into a 112×112 crop for embedding.

use crate::geometry::Point;
use crate::types::{FaceAlignment, FaceDetection};
use image::{Rgb, RgbImage};
use thiserror::Error;

/// Side length of the aligned face crop.
pub const ALIGNED_FACE_SIZE: u32 = 112;

/// MobileFaceNet reference landmarks for a 112×112 crop, in pixels:
/// left eye, right eye, nose, left mouth corner, right mouth corner.
const REFERENCE_LANDMARKS_112: [(f64, f64); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

#[derive(Error, Debug, PartialEq)]
pub enum AlignmentError {
    #[error("alignment needs 4 or 5 landmarks, got {0}")]
    LandmarkCount(usize),
    #[error("landmarks are degenerate; similarity transform is singular")]
    Degenerate,
}

/// Which reference layout a landmark set is fitted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkTemplate {
    /// Eyes, nose and both mouth corners.
    FivePoint,
    /// Eyes, nose and the mouth center. Detectors that report a single
    /// mouth point land here.
    FourPoint,
}

impl LandmarkTemplate {
    pub fn for_count(count: usize) -> Result<Self, AlignmentError> {
        match count {
            5 => Ok(Self::FivePoint),
            4 => Ok(Self::FourPoint),
            n => Err(AlignmentError::LandmarkCount(n)),
        }
    }

    /// Reference positions in unit crop coordinates.
    pub fn unit_points(self) -> Vec<(f64, f64)> {
        let size = ALIGNED_FACE_SIZE as f64;
        let [left_eye, right_eye, nose, left_mouth, right_mouth] = REFERENCE_LANDMARKS_112;
        let pixels = match self {
            Self::FivePoint => REFERENCE_LANDMARKS_112.to_vec(),
            Self::FourPoint => vec![left_eye, right_eye, nose, midpoint(left_mouth, right_mouth)],
        };
        pixels.into_iter().map(|(x, y)| (x / size, y / size)).collect()
    }
}

fn midpoint(a: (f64, f64), b: (f64, f64)) -> (f64, f64) {
    ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)
}

/// Collapse five landmarks to the four-point layout by merging the mouth
/// corners.
pub fn merge_mouth_corners(landmarks: &[Point; 5]) -> [Point; 4] {
    let [left_eye, right_eye, nose, left_mouth, right_mouth] = *landmarks;
    let mouth = Point::new(
        (left_mouth.x + right_mouth.x) / 2.0,
        (left_mouth.y + right_mouth.y) / 2.0,
    );
    [left_eye, right_eye, nose, mouth]
}

/// Coefficients of the similarity `| a -b tx |, | b a ty |` taking one point
/// set onto another.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f64,
    b: f64,
    tx: f64,
    ty: f64,
}

impl Similarity {
    /// Least-squares fit over paired points.
    ///
    /// With both sets centered, the rotation-scale part has a closed form
    /// and the translation carries one centroid onto the other.
    fn fit(from: &[(f64, f64)], to: &[(f64, f64)]) -> Result<Self, AlignmentError> {
        let (fx, fy) = centroid(from);
        let (tx, ty) = centroid(to);

        let mut spread = 0.0;
        let mut along = 0.0;
        let mut across = 0.0;
        for (&(px, py), &(qx, qy)) in from.iter().zip(to) {
            let (px, py) = (px - fx, py - fy);
            let (qx, qy) = (qx - tx, qy - ty);
            spread += px * px + py * py;
            along += px * qx + py * qy;
            across += px * qy - py * qx;
        }
        if spread < 1e-12 {
            return Err(AlignmentError::Degenerate);
        }

        let a = along / spread;
        let b = across / spread;
        Ok(Self {
            a,
            b,
            tx: tx - (a * fx - b * fy),
            ty: ty - (b * fx + a * fy),
        })
    }

    fn scale(&self) -> f64 {
        self.a.hypot(self.b)
    }
}

fn centroid(points: &[(f64, f64)]) -> (f64, f64) {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x, sy + y));
    (sx / n, sy / n)
}

/// Derive the alignment descriptor from pixel-space landmarks.
///
/// The affine matrix maps source pixels into unit canonical face space;
/// `size` is the face side in source pixels and `center` the face center.
pub fn estimate_alignment(landmarks: &[Point]) -> Result<FaceAlignment, AlignmentError> {
    let template = LandmarkTemplate::for_count(landmarks.len())?.unit_points();
    let src: Vec<(f64, f64)> = landmarks
        .iter()
        .map(|p| (p.x as f64, p.y as f64))
        .collect();

    let fit = Similarity::fit(&src, &template)?;
    let scale = fit.scale();
    if scale < 1e-12 {
        return Err(AlignmentError::Degenerate);
    }
    let size = 1.0 / scale;

    let (src_cx, src_cy) = centroid(&src);
    let (dst_cx, dst_cy) = centroid(&template);
    let center = Point::new(
        (src_cx - (dst_cx - 0.5) * size) as f32,
        (src_cy - (dst_cy - 0.5) * size) as f32,
    );

    let Similarity { a, b, tx, ty } = fit;
    Ok(FaceAlignment {
        affine_matrix: [
            [a as f32, -b as f32, tx as f32],
            [b as f32, a as f32, ty as f32],
            [0.0, 0.0, 1.0],
        ],
        center,
        size: size as f32,
        rotation: b.atan2(a) as f32,
    })
}

/// Alignment for a pixel-space detection using all five landmarks.
pub fn align_detection(detection: &FaceDetection) -> Result<FaceAlignment, AlignmentError> {
    estimate_alignment(&detection.landmarks)
}

/// Warp the aligned face out of `source` into a `ALIGNED_FACE_SIZE` square.
///
/// Uses bilinear interpolation. Samples outside the source are filled with 0 (black).
pub fn warp_face(source: &RgbImage, alignment: &FaceAlignment) -> RgbImage {
    let size = ALIGNED_FACE_SIZE as f32;
    let m = &alignment.affine_matrix;
    // Scale unit-space output up to crop pixels.
    let (a, b, c, d) = (m[0][0] * size, m[0][1] * size, m[1][0] * size, m[1][1] * size);
    let (tx, ty) = (m[0][2] * size, m[1][2] * size);

    let mut output = RgbImage::new(ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE);
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return output;
    }
    let inv_det = 1.0 / det;
    let (ia, ib, ic, id) = (d * inv_det, -b * inv_det, -c * inv_det, a * inv_det);

    let src_w = source.width() as i64;
    let src_h = source.height() as i64;
    let sample = |x: i64, y: i64, ch: usize| -> f32 {
        if x >= 0 && x < src_w && y >= 0 && y < src_h {
            source.get_pixel(x as u32, y as u32).0[ch] as f32
        } else {
            0.0
        }
    };

    for oy in 0..ALIGNED_FACE_SIZE {
        for ox in 0..ALIGNED_FACE_SIZE {
            // Map output pixel back to source: src = M_inv * (dst - t)
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = ic * dx + id * dy;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let mut px = [0u8; 3];
            for (ch, out) in px.iter_mut().enumerate() {
                let val = sample(x0, y0, ch) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, ch) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, ch) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, ch) * fx * fy;
                *out = val.round().clamp(0.0, 255.0) as u8;
            }
            output.put_pixel(ox, oy, Rgb(px));
        }
    }

    output
}
