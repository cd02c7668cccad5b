//! YOLO-style face detector decoding.
//!
//! The detector sees a 640×640 letterboxed image and emits one 16-value row
//! per candidate: `[xc, yc, w, h, score, lm1x, lm1y, …, lm5x, lm5y]`.
//! Rows are filtered by confidence, mapped back to source pixels and then
//! thinned by a landmark-center distance test instead of box IoU.

use crate::geometry::{BoundingBox, BoxTransform, Point};
use crate::onnx::{InferenceError, InferenceSession, TensorInput};
use crate::types::{CoordinateSpace, DecodedImage, FaceDetection, LANDMARK_COUNT};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DETECTOR_INPUT_SIZE: usize = 640;
const DETECTOR_PAD_VALUE: f32 = 114.0;
const DETECTOR_ROW_LEN: usize = 16;
/// Minimum score for a row to become a detection.
pub const DETECTOR_MIN_SCORE: f32 = 0.7;
/// Duplicate distance threshold as a fraction of image width (√2 %).
const DEDUP_WIDTH_FRACTION: f32 = std::f32::consts::SQRT_2 / 100.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image dimensions cannot be zero")]
    EmptyImage,
    #[error("detector output length {0} is not a multiple of 16")]
    MalformedOutput(usize),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
}

/// Metadata for coordinate de-mapping after letterbox resize.
///
/// The resized image sits at the top-left of the square input; padding fills
/// the right and bottom remainder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub scaled_width: usize,
    pub scaled_height: usize,
}

impl Letterbox {
    pub fn for_image(width: u32, height: u32) -> Self {
        let input = DETECTOR_INPUT_SIZE as f32;
        let scale = (input / width as f32).min(input / height as f32);
        let scaled_width = (width as f32 * scale).round().clamp(0.0, input) as usize;
        let scaled_height = (height as f32 * scale).round().clamp(0.0, input) as usize;
        Self {
            scale,
            pad_x: 0.0,
            pad_y: 0.0,
            scaled_width,
            scaled_height,
        }
    }

    /// Transform from model input space back to source image pixels.
    pub fn to_image(&self) -> BoxTransform {
        BoxTransform {
            scale_x: 1.0 / self.scale,
            scale_y: 1.0 / self.scale,
            translate_x: -self.pad_x / self.scale,
            translate_y: -self.pad_y / self.scale,
        }
    }
}

/// Run the detection model on one image and return deduplicated detections
/// in source pixel coordinates, highest confidence first.
pub fn detect_faces(
    session: &mut dyn InferenceSession,
    image: &DecodedImage,
) -> Result<Vec<FaceDetection>, DetectorError> {
    let (input, letterbox) = preprocess(image)?;
    let output = session.run(TensorInput::f32(
        vec![1, 3, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE],
        input,
    ))?;

    let candidates = decode_detections(&output.data, &letterbox, DETECTOR_MIN_SCORE)?;
    let candidate_count = candidates.len();
    let detections = remove_duplicate_detections(candidates, image.dimensions.width);
    tracing::debug!(
        rows = output.data.len() / DETECTOR_ROW_LEN,
        candidates = candidate_count,
        kept = detections.len(),
        "face detection decoded"
    );
    Ok(detections)
}

/// Letterbox an RGB image into a planar `[3, 640, 640]` tensor scaled to `[0, 1]`.
///
/// Bilinear sampling with half-pixel centers; padding is mid-gray (114).
pub fn preprocess(image: &DecodedImage) -> Result<(Vec<f32>, Letterbox), DetectorError> {
    let width = image.dimensions.width as usize;
    let height = image.dimensions.height as usize;
    if width == 0 || height == 0 {
        return Err(DetectorError::EmptyImage);
    }

    let letterbox = Letterbox::for_image(image.dimensions.width, image.dimensions.height);
    let plane = DETECTOR_INPUT_SIZE * DETECTOR_INPUT_SIZE;
    let mut tensor = vec![DETECTOR_PAD_VALUE / 255.0; 3 * plane];
    let inv_scale = 1.0 / letterbox.scale;
    let raw = image.rgb.as_raw();

    for y in 0..letterbox.scaled_height {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..letterbox.scaled_width {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let idx = y * DETECTOR_INPUT_SIZE + x;
            for c in 0..3 {
                let tl = raw[(y0 * width + x0) * 3 + c] as f32;
                let tr = raw[(y0 * width + x1) * 3 + c] as f32;
                let bl = raw[(y1 * width + x0) * 3 + c] as f32;
                let br = raw[(y1 * width + x1) * 3 + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;
                tensor[c * plane + idx] = val / 255.0;
            }
        }
    }

    Ok((tensor, letterbox))
}

/// Decode raw detector rows into pixel-space detections.
pub fn decode_detections(
    output: &[f32],
    letterbox: &Letterbox,
    min_score: f32,
) -> Result<Vec<FaceDetection>, DetectorError> {
    if output.len() % DETECTOR_ROW_LEN != 0 {
        return Err(DetectorError::MalformedOutput(output.len()));
    }

    let to_image = letterbox.to_image();
    let detections = output
        .chunks_exact(DETECTOR_ROW_LEN)
        .filter(|row| row[4] >= min_score)
        .map(|row| {
            let bbox = BoundingBox::from_center(row[0], row[1], row[2], row[3]);
            let landmarks: [Point; LANDMARK_COUNT] =
                std::array::from_fn(|i| to_image.apply_point(Point::new(row[5 + i * 2], row[6 + i * 2])));
            FaceDetection {
                bbox: to_image.apply_box(&bbox),
                landmarks,
                score: row[4],
                space: CoordinateSpace::Absolute,
            }
        })
        .collect();

    Ok(detections)
}

/// Drop near-duplicate detections.
///
/// Candidates are ordered by descending score; any detection whose
/// [`FaceDetection::dedup_center`] lies within `√2 %` of the image width of a
/// higher-scoring survivor is removed.
pub fn remove_duplicate_detections(
    mut detections: Vec<FaceDetection>,
    image_width: u32,
) -> Vec<FaceDetection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let threshold = image_width as f32 * DEDUP_WIDTH_FRACTION;

    let centers: Vec<Point> = detections.iter().map(FaceDetection::dedup_center).collect();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && centers[i].distance(&centers[j]) <= threshold {
                suppressed[j] = true;
            }
        }
    }

    detections
        .into_iter()
        .zip(suppressed)
        .filter_map(|(d, s)| (!s).then_some(d))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::TensorOutput;
    use image::{Rgb, RgbImage};

    fn row(xc: f32, yc: f32, w: f32, h: f32, score: f32) -> Vec<f32> {
        let mut r = vec![xc, yc, w, h, score];
        // Landmarks spread around the box center.
        for (dx, dy) in [(-10.0, -10.0), (10.0, -10.0), (0.0, 0.0), (-8.0, 10.0), (8.0, 10.0)] {
            r.push(xc + dx);
            r.push(yc + dy);
        }
        r
    }

    fn detection_at(cx: f32, cy: f32, score: f32) -> FaceDetection {
        let p = Point::new(cx, cy);
        FaceDetection {
            bbox: BoundingBox::from_center(cx, cy, 50.0, 50.0),
            landmarks: [p; LANDMARK_COUNT],
            score,
            space: CoordinateSpace::Absolute,
        }
    }

    const IDENTITY_BOX: Letterbox = Letterbox {
        scale: 1.0,
        pad_x: 0.0,
        pad_y: 0.0,
        scaled_width: 640,
        scaled_height: 640,
    };

    #[test]
    fn test_decode_single_confident_row() {
        let mut output = row(100.0, 120.0, 40.0, 60.0, 0.9);
        output.extend(row(300.0, 300.0, 40.0, 40.0, 0.69));
        output.extend(row(500.0, 500.0, 40.0, 40.0, 0.1));

        let dets = decode_detections(&output, &IDENTITY_BOX, DETECTOR_MIN_SCORE).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.bbox.x - (100.0 - 40.0 / 2.0)).abs() < 1e-5);
        assert!((d.bbox.y - (120.0 - 60.0 / 2.0)).abs() < 1e-5);
        assert!((d.bbox.width - 40.0).abs() < 1e-5);
        assert!((d.score - 0.9).abs() < 1e-6);
        assert_eq!(d.landmarks[2], Point::new(100.0, 120.0));
        assert_eq!(d.space, CoordinateSpace::Absolute);
    }

    #[test]
    fn test_decode_threshold_is_inclusive() {
        let output = row(100.0, 100.0, 10.0, 10.0, DETECTOR_MIN_SCORE);
        let dets = decode_detections(&output, &IDENTITY_BOX, DETECTOR_MIN_SCORE).unwrap();
        assert_eq!(dets.len(), 1);
    }

    #[test]
    fn test_decode_rejects_partial_rows() {
        let output = vec![0.0; DETECTOR_ROW_LEN + 3];
        let err = decode_detections(&output, &IDENTITY_BOX, DETECTOR_MIN_SCORE).unwrap_err();
        assert!(matches!(err, DetectorError::MalformedOutput(19)));
    }

    #[test]
    fn test_decode_maps_back_through_letterbox() {
        // 1280×640 image → scale 0.5, occupies the top 320 rows of the input.
        let letterbox = Letterbox::for_image(1280, 640);
        assert!((letterbox.scale - 0.5).abs() < 1e-6);
        assert_eq!(letterbox.scaled_width, 640);
        assert_eq!(letterbox.scaled_height, 320);

        let output = row(100.0, 50.0, 20.0, 20.0, 0.95);
        let dets = decode_detections(&output, &letterbox, DETECTOR_MIN_SCORE).unwrap();
        let d = &dets[0];
        assert!((d.bbox.x - 180.0).abs() < 1e-4);
        assert!((d.bbox.y - 80.0).abs() < 1e-4);
        assert!((d.bbox.width - 40.0).abs() < 1e-4);
        assert!((d.landmarks[2].x - 200.0).abs() < 1e-4);
        assert!((d.landmarks[2].y - 100.0).abs() < 1e-4);
    }

    #[test]
    fn test_dedup_removes_close_lower_confidence() {
        // Width 1000 → threshold ≈ 14.14 px.
        let dets = vec![
            detection_at(500.0, 500.0, 0.8),
            detection_at(501.0, 500.0, 0.95),
        ];
        let kept = remove_duplicate_detections(dets, 1000);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].score - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_dedup_keeps_distant_detections() {
        let dets = vec![
            detection_at(500.0, 500.0, 0.8),
            detection_at(520.0, 500.0, 0.95),
        ];
        let kept = remove_duplicate_detections(dets, 1000);
        assert_eq!(kept.len(), 2);
        assert!(kept[0].score > kept[1].score);
    }

    #[test]
    fn test_dedup_threshold_is_root_two_percent_of_width() {
        // 12 px apart: beyond 1 % of the width, inside √2 %.
        let close = vec![detection_at(500.0, 500.0, 0.8), detection_at(512.0, 500.0, 0.9)];
        assert_eq!(remove_duplicate_detections(close, 1000).len(), 1);
        let apart = vec![detection_at(500.0, 500.0, 0.8), detection_at(515.0, 500.0, 0.9)];
        assert_eq!(remove_duplicate_detections(apart, 1000).len(), 2);
    }

    #[test]
    fn test_dedup_center_uses_first_four_landmarks_only() {
        // Same first four landmarks, wildly different right mouth corner:
        // still treated as duplicates.
        let a = detection_at(300.0, 300.0, 0.9);
        let mut b = detection_at(300.0, 300.0, 0.8);
        b.landmarks[4] = Point::new(900.0, 900.0);
        let kept = remove_duplicate_detections(vec![a, b], 1000);
        assert_eq!(kept.len(), 1);

        // Moving only the right mouth corner of a far-away face does not make it a duplicate.
        let c = detection_at(300.0, 300.0, 0.9);
        let mut d = detection_at(400.0, 400.0, 0.8);
        d.landmarks[4] = Point::new(300.0, 300.0);
        let kept = remove_duplicate_detections(vec![c, d], 1000);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_preprocess_pads_with_gray() {
        let image = DecodedImage::new(RgbImage::from_pixel(64, 32, Rgb([255, 0, 0])));
        let (tensor, letterbox) = preprocess(&image).unwrap();
        let plane = DETECTOR_INPUT_SIZE * DETECTOR_INPUT_SIZE;
        assert_eq!(tensor.len(), 3 * plane);
        assert_eq!(letterbox.scaled_height, 320);

        // Inside the image: pure red.
        assert!((tensor[0] - 1.0).abs() < 1e-6);
        assert!(tensor[plane].abs() < 1e-6);
        // Below the scaled image: padding.
        let pad_idx = 500 * DETECTOR_INPUT_SIZE + 10;
        assert!((tensor[pad_idx] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[2 * plane + pad_idx] - 114.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_rejects_empty_image() {
        let image = DecodedImage::new(RgbImage::new(0, 0));
        assert!(matches!(preprocess(&image), Err(DetectorError::EmptyImage)));
    }

    struct CannedSession(Vec<f32>);

    impl InferenceSession for CannedSession {
        fn run(&mut self, input: TensorInput) -> Result<TensorOutput, InferenceError> {
            assert_eq!(input.shape, vec![1, 3, 640, 640]);
            Ok(TensorOutput {
                shape: vec![1, (self.0.len() / DETECTOR_ROW_LEN) as i64, 16],
                data: self.0.clone(),
            })
        }
    }

    #[test]
    fn test_detect_faces_end_to_end() {
        // 640×640 image → identity letterbox.
        let image = DecodedImage::new(RgbImage::from_pixel(640, 640, Rgb([90, 90, 90])));
        let mut output = row(200.0, 200.0, 80.0, 80.0, 0.9);
        output.extend(row(202.0, 201.0, 80.0, 80.0, 0.85));
        output.extend(row(450.0, 300.0, 60.0, 60.0, 0.75));
        let mut session = CannedSession(output);

        let dets = detect_faces(&mut session, &image).unwrap();
        assert_eq!(dets.len(), 2);
        assert!((dets[0].score - 0.9).abs() < 1e-6);
        assert!((dets[1].score - 0.75).abs() < 1e-6);
    }
}
