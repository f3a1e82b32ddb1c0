pub mod handle;
pub mod model_ultraface;

use core::fmt::Debug;

pub use handle::{
    face_detect, init_face_detector, init_face_detector_with, release_face_detector,
    DetectorHandle,
};

/// Number of floats per detection in the flat output layout (`x1, y1, x2, y2, score`).
pub const FACE_STRIDE: usize = 5;

/// A decoded face, in pixel coordinates of the model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceInfo {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl FaceInfo {
    pub fn to_array(&self) -> [f32; FACE_STRIDE] {
        [self.x1, self.y1, self.x2, self.y2, self.score]
    }
}

/// Flattens detections into the stride-5 layout used across the native boundary.
pub fn flatten_faces(faces: &[FaceInfo]) -> Vec<f32> {
    faces.iter().flat_map(|face| face.to_array()).collect()
}

/// Inverse of [`flatten_faces`]. Trailing values that do not fill a whole group are ignored.
pub fn unflatten_faces(values: &[f32]) -> Vec<FaceInfo> {
    values
        .chunks_exact(FACE_STRIDE)
        .map(|c| FaceInfo {
            x1: c[0],
            y1: c[1],
            x2: c[2],
            y2: c[3],
            score: c[4],
        })
        .collect()
}

/// Trait representing a bounding box around a detected face in an image.
pub trait FaceBoundingBox {
    /// Returns the coordinates of the origin (top-left corner) of the face rectangle as a tuple of x and y (in pixels).
    fn origin(&self) -> (f32, f32);

    /// Returns the width of the face rectangle (in pixels).
    fn width(&self) -> f32;

    /// Returns the height of the face rectangle (in pixels).
    fn height(&self) -> f32;

    /// Returns the confidence score of the detected face.
    fn score(&self) -> f32;

    /// Returns the same box with every coordinate scaled from `from` space into `to` space.
    fn rescaled(&self, from: (u32, u32), to: (u32, u32)) -> FaceInfo;
}

impl FaceBoundingBox for FaceInfo {
    fn origin(&self) -> (f32, f32) {
        (self.x1, self.y1)
    }

    fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    fn score(&self) -> f32 {
        self.score
    }

    fn rescaled(&self, from: (u32, u32), to: (u32, u32)) -> FaceInfo {
        let sx = to.0 as f32 / from.0.max(1) as f32;
        let sy = to.1 as f32 / from.1.max(1) as f32;
        FaceInfo {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
            score: self.score,
        }
    }
}

impl Debug for dyn FaceBoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaceBoundingBox")
            .field("origin", &self.origin())
            .field("width", &self.width())
            .field("height", &self.height())
            .field("score", &self.score())
            .finish()
    }
}
