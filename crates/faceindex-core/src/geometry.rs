//! Geometry primitives shared by the detector, aligner and blur scorer.
//!
//! All types here are plain values: every transform returns a new value and
//! never mutates its receiver.

use serde::{Deserialize, Serialize};

/// A 2D point in pixel or image-relative space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Arithmetic mean of a set of points. Returns the origin for an empty slice.
    pub fn mean(points: &[Point]) -> Point {
        if points.is_empty() {
            return Point::default();
        }
        let n = points.len() as f32;
        let (sx, sy) = points
            .iter()
            .fold((0.0f32, 0.0f32), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }
}

/// Axis-aligned rectangle. Width and height are never negative.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build a box, clamping negative extents to zero.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Build a box from corner coordinates `[x_min, y_min, x_max, y_max]`.
    pub fn from_xyxy(xyxy: [f32; 4]) -> Self {
        Self::new(xyxy[0], xyxy[1], xyxy[2] - xyxy[0], xyxy[3] - xyxy[1])
    }

    /// Build a box from its center and size, as emitted by YOLO-style heads.
    pub fn from_center(center_x: f32, center_y: f32, width: f32, height: f32) -> Self {
        Self::new(center_x - width / 2.0, center_y - height / 2.0, width, height)
    }

    pub fn x_max(&self) -> f32 {
        self.x + self.width
    }

    pub fn y_max(&self) -> f32 {
        self.y + self.height
    }

    pub fn to_xyxy(&self) -> [f32; 4] {
        [self.x, self.y, self.x_max(), self.y_max()]
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow (or shrink, for `factor < 1`) the box around its center.
    pub fn enlarge(&self, factor: f32) -> Self {
        let c = self.center();
        Self::from_center(c.x, c.y, self.width * factor, self.height * factor)
    }

    /// Snap every edge to the nearest integer pixel.
    pub fn round(&self) -> Self {
        let [x_min, y_min, x_max, y_max] = self.to_xyxy().map(f32::round);
        Self::from_xyxy([x_min, y_min, x_max, y_max])
    }

    /// Scale position and extent per axis.
    pub fn scale(&self, scale_x: f32, scale_y: f32) -> Self {
        BoxTransform::scaling(scale_x, scale_y).apply_box(self)
    }
}

/// Axis-aligned affine map `p' = p * scale + translate`, with no rotation.
///
/// Used to move detector output from letterboxed model space back to the
/// source image and to convert between pixel and image-relative coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxTransform {
    pub scale_x: f32,
    pub scale_y: f32,
    pub translate_x: f32,
    pub translate_y: f32,
}

impl BoxTransform {
    pub fn scaling(scale_x: f32, scale_y: f32) -> Self {
        Self {
            scale_x,
            scale_y,
            translate_x: 0.0,
            translate_y: 0.0,
        }
    }

    pub fn apply_point(&self, p: Point) -> Point {
        Point::new(
            p.x * self.scale_x + self.translate_x,
            p.y * self.scale_y + self.translate_y,
        )
    }

    pub fn apply_box(&self, b: &BoundingBox) -> BoundingBox {
        let origin = self.apply_point(Point::new(b.x, b.y));
        BoundingBox::new(
            origin.x,
            origin.y,
            b.width * self.scale_x.abs(),
            b.height * self.scale_y.abs(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_center() {
        let b = BoundingBox::from_center(50.0, 40.0, 20.0, 10.0);
        assert_eq!(b, BoundingBox::new(40.0, 35.0, 20.0, 10.0));
    }

    #[test]
    fn test_negative_extent_is_clamped() {
        let b = BoundingBox::from_xyxy([10.0, 10.0, 5.0, 20.0]);
        assert_eq!(b.width, 0.0);
        assert_eq!(b.height, 10.0);
    }

    #[test]
    fn test_enlarge_keeps_center() {
        let b = BoundingBox::new(10.0, 20.0, 40.0, 60.0);
        let e = b.enlarge(1.5);
        assert_eq!(e.center(), b.center());
        assert!((e.width - 60.0).abs() < 1e-5);
        assert!((e.height - 90.0).abs() < 1e-5);
        let shrunk = b.enlarge(0.5);
        assert_eq!(shrunk, BoundingBox::new(20.0, 35.0, 20.0, 30.0));
    }

    #[test]
    fn test_round_snaps_edges() {
        let b = BoundingBox::new(1.4, 2.6, 3.3, 4.8).round();
        // Edges 1.4..4.7 and 2.6..7.4 snap to 1..5 and 3..7.
        assert_eq!(b, BoundingBox::new(1.0, 3.0, 4.0, 4.0));
    }

    #[test]
    fn test_scale_per_axis() {
        let b = BoundingBox::new(0.1, 0.2, 0.3, 0.4).scale(100.0, 50.0);
        assert!((b.x - 10.0).abs() < 1e-4);
        assert!((b.y - 10.0).abs() < 1e-4);
        assert!((b.width - 30.0).abs() < 1e-4);
        assert!((b.height - 20.0).abs() < 1e-4);
    }

    #[test]
    fn test_box_transform_translate_and_scale() {
        let t = BoxTransform {
            scale_x: 2.0,
            scale_y: 2.0,
            translate_x: -10.0,
            translate_y: 5.0,
        };
        let b = t.apply_box(&BoundingBox::new(10.0, 10.0, 5.0, 5.0));
        assert_eq!(b, BoundingBox::new(10.0, 25.0, 10.0, 10.0));
        assert_eq!(BoxTransform::scaling(1.0, 1.0).apply_point(Point::new(3.0, 4.0)), Point::new(3.0, 4.0));
    }

    #[test]
    fn test_point_mean_and_distance() {
        let m = Point::mean(&[Point::new(0.0, 0.0), Point::new(2.0, 4.0)]);
        assert_eq!(m, Point::new(1.0, 2.0));
        assert!((Point::new(0.0, 0.0).distance(&Point::new(3.0, 4.0)) - 5.0).abs() < 1e-6);
        assert_eq!(Point::mean(&[]), Point::default());
    }
}
