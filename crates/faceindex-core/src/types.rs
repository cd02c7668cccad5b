use crate::geometry::{BoundingBox, BoxTransform, Point};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of landmarks emitted per detection.
pub const LANDMARK_COUNT: usize = 5;

#[derive(Error, Debug, PartialEq)]
pub enum CoordinateError {
    #[error("detection is already in image-relative coordinates")]
    AlreadyRelative,
    #[error("cannot normalize against zero image dimensions {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },
}

/// Pixel dimensions of a decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A decoded, orientation-corrected RGB image.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub dimensions: Dimensions,
    pub rgb: RgbImage,
}

impl DecodedImage {
    pub fn new(rgb: RgbImage) -> Self {
        Self {
            dimensions: Dimensions {
                width: rgb.width(),
                height: rgb.height(),
            },
            rgb,
        }
    }
}

/// Which space a detection's coordinates live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CoordinateSpace {
    /// Source image pixels.
    Absolute,
    /// Fractions of the source image width/height.
    Relative,
}

/// One detector candidate: box, landmarks and confidence.
///
/// Landmark order: left eye, right eye, nose, left mouth corner, right mouth corner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceDetection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub landmarks: [Point; LANDMARK_COUNT],
    pub score: f32,
    pub space: CoordinateSpace,
}

impl FaceDetection {
    /// Center used by duplicate suppression.
    ///
    /// Averages only the first four landmarks (eyes, nose, left mouth corner);
    /// the right mouth corner is ignored. Kept for parity with stored indexes.
    pub fn dedup_center(&self) -> Point {
        Point::mean(&self.landmarks[..4])
    }

    /// Convert pixel coordinates into fractions of the image size.
    ///
    /// A detection can only be normalized once.
    pub fn into_relative(self, dimensions: Dimensions) -> Result<Self, CoordinateError> {
        if self.space == CoordinateSpace::Relative {
            return Err(CoordinateError::AlreadyRelative);
        }
        if dimensions.width == 0 || dimensions.height == 0 {
            return Err(CoordinateError::ZeroDimensions {
                width: dimensions.width,
                height: dimensions.height,
            });
        }
        let t = BoxTransform::scaling(
            1.0 / dimensions.width as f32,
            1.0 / dimensions.height as f32,
        );
        Ok(Self {
            bbox: t.apply_box(&self.bbox),
            landmarks: self.landmarks.map(|p| t.apply_point(p)),
            score: self.score,
            space: CoordinateSpace::Relative,
        })
    }

    /// Pixel-space copy of this detection. Absolute detections are returned as-is.
    pub fn to_absolute(&self, dimensions: Dimensions) -> Self {
        if self.space == CoordinateSpace::Absolute {
            return self.clone();
        }
        let t = BoxTransform::scaling(dimensions.width as f32, dimensions.height as f32);
        Self {
            bbox: t.apply_box(&self.bbox),
            landmarks: self.landmarks.map(|p| t.apply_point(p)),
            score: self.score,
            space: CoordinateSpace::Absolute,
        }
    }
}

/// Normalization descriptor for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceAlignment {
    /// Maps source pixels into unit canonical face space.
    pub affine_matrix: [[f32; 3]; 3],
    /// Face center in source pixels.
    pub center: Point,
    /// Face side length in source pixels (`1 / scale`).
    pub size: f32,
    /// Radians.
    pub rotation: f32,
}

/// One indexed face of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Face {
    pub face_id: String,
    pub detection: FaceDetection,
    pub alignment: FaceAlignment,
    pub blur: f32,
    pub embedding: Vec<f32>,
}

/// Stable face identifier: `{file_id}_{x_min}_{y_min}_{x_max}_{y_max}`.
///
/// Each edge is image-relative, clamped to `[0, 0.999999]` and written as the
/// five fractional digits of its fixed-point representation.
pub fn face_id(file_id: i64, relative_box: &BoundingBox) -> String {
    fn segment(v: f32) -> String {
        let fixed = format!("{:.5}", v.clamp(0.0, 0.999_999));
        fixed
            .split_once('.')
            .map(|(_, frac)| frac.to_string())
            .unwrap_or_else(|| "00000".to_string())
    }

    let [x_min, y_min, x_max, y_max] = relative_box.to_xyxy();
    format!(
        "{file_id}_{}_{}_{}_{}",
        segment(x_min),
        segment(y_min),
        segment(x_max),
        segment(y_max)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection() -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(100.0, 50.0, 200.0, 100.0),
            landmarks: [
                Point::new(150.0, 80.0),
                Point::new(250.0, 80.0),
                Point::new(200.0, 100.0),
                Point::new(160.0, 130.0),
                Point::new(240.0, 130.0),
            ],
            score: 0.9,
            space: CoordinateSpace::Absolute,
        }
    }

    const DIMS: Dimensions = Dimensions {
        width: 400,
        height: 200,
    };

    #[test]
    fn test_into_relative() {
        let rel = detection().into_relative(DIMS).unwrap();
        assert_eq!(rel.space, CoordinateSpace::Relative);
        assert!((rel.bbox.x - 0.25).abs() < 1e-6);
        assert!((rel.bbox.y - 0.25).abs() < 1e-6);
        assert!((rel.bbox.width - 0.5).abs() < 1e-6);
        assert!((rel.landmarks[2].y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_into_relative_only_once() {
        let rel = detection().into_relative(DIMS).unwrap();
        assert_eq!(rel.into_relative(DIMS), Err(CoordinateError::AlreadyRelative));
    }

    #[test]
    fn test_into_relative_rejects_zero_dimensions() {
        let err = detection()
            .into_relative(Dimensions { width: 0, height: 10 })
            .unwrap_err();
        assert!(matches!(err, CoordinateError::ZeroDimensions { .. }));
    }

    #[test]
    fn test_relative_absolute_roundtrip() {
        let original = detection();
        let back = original.clone().into_relative(DIMS).unwrap().to_absolute(DIMS);
        assert!((back.bbox.x - original.bbox.x).abs() < 1e-3);
        assert!((back.landmarks[4].x - original.landmarks[4].x).abs() < 1e-3);
    }

    #[test]
    fn test_dedup_center_ignores_right_mouth() {
        let mut d = detection();
        let before = d.dedup_center();
        d.landmarks[4] = Point::new(10_000.0, 10_000.0);
        assert_eq!(d.dedup_center(), before);
        // (150 + 250 + 200 + 160) / 4, (80 + 80 + 100 + 130) / 4
        assert_eq!(before, Point::new(190.0, 97.5));
    }

    #[test]
    fn test_face_id_format() {
        let id = face_id(42, &BoundingBox::from_xyxy([0.1, 0.25, 0.5, 0.75]));
        assert_eq!(id, "42_10000_25000_50000_75000");
        // Out-of-range edges clamp to 0.999999, which rounds to "1.00000".
        let clamped = face_id(42, &BoundingBox::from_xyxy([-0.2, 0.0, 1.5, 0.5]));
        assert_eq!(clamped, "42_00000_00000_00000_50000");
    }

    #[test]
    fn test_face_id_is_deterministic() {
        let b = BoundingBox::new(0.123456, 0.5, 0.2, 0.2);
        assert_eq!(face_id(7, &b), face_id(7, &b));
        assert!(face_id(7, &b).starts_with("7_12346_50000_"));
    }
}
