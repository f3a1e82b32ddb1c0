//! Owned detector handle.
//!
//! A handle is created once per input geometry and reused for every frame. It is
//! released either explicitly with [`release_face_detector`] or when it goes out of
//! scope; both paths consume it, so a released handle can never reach `face_detect`.

use tracing::debug;

use crate::error::Result;
use crate::face_detection::model_ultraface::{UltrafaceDecoder, UltrafaceParams};
use crate::face_detection::{flatten_faces, FaceInfo};

#[derive(Debug)]
pub struct DetectorHandle {
    decoder: UltrafaceDecoder,
}

impl DetectorHandle {
    pub fn input_size(&self) -> (u32, u32) {
        self.decoder.input_size()
    }

    pub fn num_anchors(&self) -> usize {
        self.decoder.num_anchors()
    }

    pub fn params(&self) -> &UltrafaceParams {
        self.decoder.params()
    }

    /// Decodes raw `scores` (anchors x 2) and `boxes` (anchors x 4) into faces.
    pub fn detect(&self, scores: &[f32], boxes: &[f32]) -> Result<Vec<FaceInfo>> {
        self.decoder.detect(scores, boxes)
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        let (w, h) = self.decoder.input_size();
        debug!(width = w, height = h, "released face detector");
    }
}

/// Creates a detector for `width` x `height` inputs with the default thresholds.
pub fn init_face_detector(width: u32, height: u32, channels: u32) -> Result<DetectorHandle> {
    init_face_detector_with(width, height, channels, UltrafaceParams::default())
}

pub fn init_face_detector_with(
    width: u32,
    height: u32,
    channels: u32,
    params: UltrafaceParams,
) -> Result<DetectorHandle> {
    let decoder = UltrafaceDecoder::new(width, height, channels, params)?;
    debug!(
        width,
        height,
        anchors = decoder.num_anchors(),
        "initialized face detector"
    );
    Ok(DetectorHandle { decoder })
}

/// Runs decode and NMS and returns the detections flattened with stride 5.
pub fn face_detect(handle: &DetectorHandle, scores: &[f32], boxes: &[f32]) -> Result<Vec<f32>> {
    let faces = handle.detect(scores, boxes)?;
    Ok(flatten_faces(&faces))
}

pub fn release_face_detector(handle: DetectorHandle) {
    handle.release()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::face_detection::FACE_STRIDE;

    #[test]
    fn test_init_validates_geometry() {
        assert!(matches!(
            init_face_detector(320, 0, 3),
            Err(Error::InvalidDetectorConfig(_))
        ));
        assert!(matches!(
            init_face_detector(320, 240, 4),
            Err(Error::InvalidDetectorConfig(_))
        ));
        let handle = init_face_detector(320, 240, 3).unwrap();
        assert_eq!(handle.input_size(), (320, 240));
        assert_eq!(handle.num_anchors(), 4420);
        release_face_detector(handle);
    }

    #[test]
    fn test_face_detect_returns_stride_five() {
        let handle = init_face_detector(320, 240, 3).unwrap();
        let anchors = handle.num_anchors();
        let mut scores = vec![0.0f32; anchors * 2];
        let boxes = vec![0.0f32; anchors * 4];

        // two far-apart anchors: first cell of stride 8 and last cell of stride 64
        scores[1] = 0.9;
        scores[(anchors - 1) * 2 + 1] = 0.8;

        let flat = face_detect(&handle, &scores, &boxes).unwrap();
        assert_eq!(flat.len(), 2 * FACE_STRIDE);
        assert!((flat[4] - 0.9).abs() < 1e-6);
        assert!((flat[9] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_face_detect_propagates_shape_errors() {
        let handle = init_face_detector(320, 240, 3).unwrap();
        assert!(face_detect(&handle, &[], &[]).is_err());
    }
}
