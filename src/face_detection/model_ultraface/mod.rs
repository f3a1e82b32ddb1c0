//! Post-processing for the UltraFace (version-slim / RFB, 320x240) face detector.
//!
//! The network emits, per anchor, two class scores (background, face) and four box
//! regressions relative to a fixed prior box. Decoding turns those regressions into
//! pixel rectangles, drops anchors below the score threshold and merges overlapping
//! rectangles with non-maximum suppression.

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::face_detection::FaceInfo;

const STRIDES: [f32; 4] = [8.0, 16.0, 32.0, 64.0];
const MIN_BOXES: [&[f32]; 4] = [
    &[10.0, 16.0, 24.0],
    &[32.0, 48.0],
    &[64.0, 96.0],
    &[128.0, 192.0, 256.0],
];
const CENTER_VARIANCE: f32 = 0.1;
const SIZE_VARIANCE: f32 = 0.2;

const NUM_CLASSES: usize = 2;
const FACE_CLASS: usize = 1;
const BOX_VALUES: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NmsMode {
    /// Keep only the highest scoring box of every overlapping group.
    Hard,
    /// Replace every overlapping group by its softmax(score) weighted average.
    #[default]
    Blending,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct UltrafaceParams {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub nms: NmsMode,
}

impl Default for UltrafaceParams {
    fn default() -> Self {
        Self {
            score_threshold: 0.7,
            iou_threshold: 0.35,
            nms: NmsMode::Blending,
        }
    }
}

impl UltrafaceParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(Error::InvalidDetectorConfig(format!(
                "score threshold {} is not in 0.0..=1.0",
                self.score_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(Error::InvalidDetectorConfig(format!(
                "iou threshold {} is not in 0.0..=1.0",
                self.iou_threshold
            )));
        }
        Ok(())
    }
}

/// Anchor box in normalized image coordinates (center x, center y, width, height).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prior {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Generates the anchor layout for an input of `in_w` x `in_h` pixels.
///
/// Anchors are ordered stride by stride, then row-major over the feature map, then by
/// min box size, which is the order the network emits its per-anchor outputs in.
pub fn generate_priors(in_w: u32, in_h: u32) -> Vec<Prior> {
    let (w, h) = (in_w as f32, in_h as f32);
    let mut priors = Vec::new();

    for (stride, min_boxes) in STRIDES.iter().zip(MIN_BOXES.iter()) {
        let feature_w = (w / stride).ceil() as usize;
        let feature_h = (h / stride).ceil() as usize;
        let scale_w = w / stride;
        let scale_h = h / stride;

        for j in 0..feature_h {
            for i in 0..feature_w {
                let cx = (i as f32 + 0.5) / scale_w;
                let cy = (j as f32 + 0.5) / scale_h;
                for k in min_boxes.iter() {
                    priors.push(Prior {
                        cx: clip(cx, 1.0),
                        cy: clip(cy, 1.0),
                        w: clip(k / w, 1.0),
                        h: clip(k / h, 1.0),
                    });
                }
            }
        }
    }

    priors
}

/// Decoder bound to one input geometry. Priors are computed once at construction.
#[derive(Debug, Clone)]
pub struct UltrafaceDecoder {
    in_w: u32,
    in_h: u32,
    in_c: u32,
    params: UltrafaceParams,
    priors: Vec<Prior>,
}

impl UltrafaceDecoder {
    pub fn new(in_w: u32, in_h: u32, in_c: u32, params: UltrafaceParams) -> Result<Self> {
        if in_w == 0 || in_h == 0 {
            return Err(Error::InvalidDetectorConfig(format!(
                "input size {}x{} must be non-zero",
                in_w, in_h
            )));
        }
        if in_c != 3 {
            return Err(Error::InvalidDetectorConfig(format!(
                "expected 3 input channels, got {}",
                in_c
            )));
        }
        params.validate()?;

        let priors = generate_priors(in_w, in_h);
        debug!(
            width = in_w,
            height = in_h,
            anchors = priors.len(),
            "generated ultraface priors"
        );

        Ok(Self {
            in_w,
            in_h,
            in_c,
            params,
            priors,
        })
    }

    pub fn num_anchors(&self) -> usize {
        self.priors.len()
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.in_w, self.in_h)
    }

    pub fn channels(&self) -> u32 {
        self.in_c
    }

    pub fn params(&self) -> &UltrafaceParams {
        &self.params
    }

    pub fn priors(&self) -> &[Prior] {
        &self.priors
    }

    /// Full post-processing: threshold, decode and suppress.
    pub fn detect(&self, scores: &[f32], boxes: &[f32]) -> Result<Vec<FaceInfo>> {
        let candidates = self.filter_bboxes(scores, boxes)?;
        let candidate_count = candidates.len();
        let faces = self.nms(candidates);
        debug!(candidates = candidate_count, faces = faces.len(), "ultraface decode");
        Ok(faces)
    }

    /// Decodes every anchor whose face score exceeds the threshold into a pixel rectangle.
    pub fn filter_bboxes(&self, scores: &[f32], boxes: &[f32]) -> Result<Vec<FaceInfo>> {
        let anchors = self.num_anchors();
        if scores.len() != anchors * NUM_CLASSES {
            return Err(Error::ShapeMismatch {
                what: "scores",
                expected: anchors * NUM_CLASSES,
                actual: scores.len(),
            });
        }
        if boxes.len() != anchors * BOX_VALUES {
            return Err(Error::ShapeMismatch {
                what: "boxes",
                expected: anchors * BOX_VALUES,
                actual: boxes.len(),
            });
        }

        let (w, h) = (self.in_w as f32, self.in_h as f32);
        let mut faces = Vec::new();

        for (i, prior) in self.priors.iter().enumerate() {
            let score = scores[i * NUM_CLASSES + FACE_CLASS];
            if score.is_nan() || score <= self.params.score_threshold {
                continue;
            }

            let reg = &boxes[i * BOX_VALUES..(i + 1) * BOX_VALUES];
            let cx = reg[0] * CENTER_VARIANCE * prior.w + prior.cx;
            let cy = reg[1] * CENTER_VARIANCE * prior.h + prior.cy;
            let bw = (reg[2] * SIZE_VARIANCE).exp() * prior.w;
            let bh = (reg[3] * SIZE_VARIANCE).exp() * prior.h;

            let face = FaceInfo {
                x1: clip(cx - bw / 2.0, 1.0) * w,
                y1: clip(cy - bh / 2.0, 1.0) * h,
                x2: clip(cx + bw / 2.0, 1.0) * w,
                y2: clip(cy + bh / 2.0, 1.0) * h,
                score: clip(score, 1.0),
            };

            // NaN regressions survive clip and would poison the ordering below
            if face.to_array().iter().any(|v| v.is_nan()) {
                continue;
            }
            faces.push(face);
        }

        Ok(faces)
    }

    /// Non-maximum suppression over decoded candidates.
    pub fn nms(&self, mut input: Vec<FaceInfo>) -> Vec<FaceInfo> {
        input.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut merged = vec![false; input.len()];
        let mut output = Vec::new();

        for i in 0..input.len() {
            if merged[i] {
                continue;
            }
            merged[i] = true;
            let mut group = vec![input[i]];

            for j in (i + 1)..input.len() {
                if merged[j] {
                    continue;
                }
                if let Some(overlap) = iou(&input[i], &input[j]) {
                    if overlap > self.params.iou_threshold {
                        merged[j] = true;
                        group.push(input[j]);
                    }
                }
            }

            let face = match self.params.nms {
                NmsMode::Hard => group[0],
                NmsMode::Blending => blend(&group),
            };
            output.push(self.clamp_to_input(face));
        }

        output
    }

    fn clamp_to_input(&self, face: FaceInfo) -> FaceInfo {
        let (w, h) = (self.in_w as f32, self.in_h as f32);
        FaceInfo {
            x1: face.x1.clamp(0.0, w),
            y1: face.y1.clamp(0.0, h),
            x2: face.x2.clamp(0.0, w),
            y2: face.y2.clamp(0.0, h),
            score: face.score.clamp(0.0, 1.0),
        }
    }
}

/// Intersection over union with inclusive pixel extents. `None` when the boxes do not overlap.
fn iou(a: &FaceInfo, b: &FaceInfo) -> Option<f32> {
    let inner_x0 = a.x1.max(b.x1);
    let inner_y0 = a.y1.max(b.y1);
    let inner_x1 = a.x2.min(b.x2);
    let inner_y1 = a.y2.min(b.y2);

    let inner_w = inner_x1 - inner_x0 + 1.0;
    let inner_h = inner_y1 - inner_y0 + 1.0;
    if inner_w <= 0.0 || inner_h <= 0.0 {
        return None;
    }

    let inner_area = inner_w * inner_h;
    let area_a = (a.x2 - a.x1 + 1.0) * (a.y2 - a.y1 + 1.0);
    let area_b = (b.x2 - b.x1 + 1.0) * (b.y2 - b.y1 + 1.0);

    Some(inner_area / (area_a + area_b - inner_area))
}

fn blend(group: &[FaceInfo]) -> FaceInfo {
    let total: f32 = group.iter().map(|f| f.score.exp()).sum();
    let mut out = FaceInfo {
        x1: 0.0,
        y1: 0.0,
        x2: 0.0,
        y2: 0.0,
        score: 0.0,
    };
    for face in group {
        let rate = face.score.exp() / total;
        out.x1 += face.x1 * rate;
        out.y1 += face.y1 * rate;
        out.x2 += face.x2 * rate;
        out.y2 += face.y2 * rate;
        out.score += face.score * rate;
    }
    out
}

fn clip(x: f32, y: f32) -> f32 {
    if x < 0.0 {
        0.0
    } else if x > y {
        y
    } else {
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(params: UltrafaceParams) -> UltrafaceDecoder {
        UltrafaceDecoder::new(320, 240, 3, params).unwrap()
    }

    fn empty_outputs(anchors: usize) -> (Vec<f32>, Vec<f32>) {
        let mut scores = vec![0.0; anchors * 2];
        for i in 0..anchors {
            scores[i * 2] = 1.0;
        }
        (scores, vec![0.0; anchors * 4])
    }

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> FaceInfo {
        FaceInfo { x1, y1, x2, y2, score }
    }

    // deterministic pseudo random floats in [0, 1)
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 40) as f32) / (1u64 << 24) as f32
        }
    }

    #[test]
    fn test_anchor_count_for_320x240() {
        let priors = generate_priors(320, 240);
        // 40x30x3 + 20x15x2 + 10x8x2 + 5x4x3
        assert_eq!(priors.len(), 4420);
    }

    #[test]
    fn test_priors_are_normalized() {
        for prior in generate_priors(320, 240) {
            for v in [prior.cx, prior.cy, prior.w, prior.h] {
                assert!((0.0..=1.0).contains(&v));
            }
        }
    }

    #[test]
    fn test_first_prior_geometry() {
        let priors = generate_priors(320, 240);
        let first = priors[0];
        assert!((first.cx - 4.0 / 320.0).abs() < 1e-6);
        assert!((first.cy - 4.0 / 240.0).abs() < 1e-6);
        assert!((first.w - 10.0 / 320.0).abs() < 1e-6);
        assert!((first.h - 10.0 / 240.0).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(UltrafaceDecoder::new(0, 240, 3, UltrafaceParams::default()).is_err());
        assert!(UltrafaceDecoder::new(320, 240, 1, UltrafaceParams::default()).is_err());
        let params = UltrafaceParams {
            score_threshold: 1.5,
            ..Default::default()
        };
        assert!(UltrafaceDecoder::new(320, 240, 3, params).is_err());
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let d = decoder(UltrafaceParams::default());
        let err = d.detect(&[0.0; 10], &[0.0; 20]).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                what: "scores",
                expected: 8840,
                actual: 10
            }
        ));

        let (scores, _) = empty_outputs(d.num_anchors());
        let err = d.detect(&scores, &[0.0; 3]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { what: "boxes", .. }));
    }

    #[test]
    fn test_no_scores_above_threshold_yields_no_faces() {
        let d = decoder(UltrafaceParams::default());
        let (scores, boxes) = empty_outputs(d.num_anchors());
        assert!(d.detect(&scores, &boxes).unwrap().is_empty());
    }

    #[test]
    fn test_zero_regression_decodes_to_prior_box() {
        let d = decoder(UltrafaceParams::default());
        let (mut scores, boxes) = empty_outputs(d.num_anchors());

        // last anchor: stride 64, bottom-right cell, 256px box
        let idx = d.num_anchors() - 1;
        scores[idx * 2 + 1] = 0.9;

        let faces = d.detect(&scores, &boxes).unwrap();
        assert_eq!(faces.len(), 1);

        let prior = d.priors()[idx];
        let expected_x1 = clip(prior.cx - prior.w / 2.0, 1.0) * 320.0;
        let expected_y2 = clip(prior.cy + prior.h / 2.0, 1.0) * 240.0;
        assert!((faces[0].x1 - expected_x1).abs() < 1e-3);
        assert!((faces[0].y2 - expected_y2).abs() < 1e-3);
        assert!((faces[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_score_equal_to_threshold_is_dropped() {
        let d = decoder(UltrafaceParams::default());
        let (mut scores, boxes) = empty_outputs(d.num_anchors());
        scores[1] = 0.7;
        assert!(d.filter_bboxes(&scores, &boxes).unwrap().is_empty());
    }

    #[test]
    fn test_nan_regressions_are_skipped() {
        let d = decoder(UltrafaceParams::default());
        let (mut scores, mut boxes) = empty_outputs(d.num_anchors());
        scores[1] = 0.95;
        boxes[2] = f32::NAN;
        assert!(d.filter_bboxes(&scores, &boxes).unwrap().is_empty());
    }

    #[test]
    fn test_hard_nms_keeps_highest_of_overlapping_group() {
        let d = decoder(UltrafaceParams {
            nms: NmsMode::Hard,
            ..Default::default()
        });
        let out = d.nms(vec![
            face(10.0, 10.0, 50.0, 50.0, 0.8),
            face(12.0, 12.0, 52.0, 52.0, 0.95),
            face(200.0, 100.0, 240.0, 140.0, 0.75),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], face(12.0, 12.0, 52.0, 52.0, 0.95));
        assert_eq!(out[1], face(200.0, 100.0, 240.0, 140.0, 0.75));
    }

    #[test]
    fn test_blending_nms_averages_group() {
        let d = decoder(UltrafaceParams::default());
        let out = d.nms(vec![
            face(10.0, 10.0, 50.0, 50.0, 0.9),
            face(14.0, 14.0, 54.0, 54.0, 0.9),
        ]);
        assert_eq!(out.len(), 1);
        // equal scores give equal weights
        assert!((out[0].x1 - 12.0).abs() < 1e-4);
        assert!((out[0].y2 - 52.0).abs() < 1e-4);
        assert!((out[0].score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn test_touching_boxes_are_not_merged_below_threshold() {
        let d = decoder(UltrafaceParams::default());
        let out = d.nms(vec![
            face(0.0, 0.0, 20.0, 20.0, 0.9),
            face(40.0, 40.0, 60.0, 60.0, 0.8),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_iou_inclusive_pixels() {
        let a = face(0.0, 0.0, 9.0, 9.0, 1.0);
        let b = face(5.0, 5.0, 14.0, 14.0, 1.0);
        // 5x5 overlap of two 10x10 boxes
        let overlap = iou(&a, &b).unwrap();
        assert!((overlap - 25.0 / 175.0).abs() < 1e-6);
        assert!(iou(&a, &face(20.0, 20.0, 30.0, 30.0, 1.0)).is_none());
    }

    #[test]
    fn test_output_properties_hold_for_random_outputs() {
        for mode in [NmsMode::Hard, NmsMode::Blending] {
            let d = decoder(UltrafaceParams {
                score_threshold: 0.3,
                nms: mode,
                ..Default::default()
            });
            let anchors = d.num_anchors();
            let mut rng = Lcg(7);

            for _ in 0..3 {
                let scores: Vec<f32> = (0..anchors * 2).map(|_| rng.next()).collect();
                let boxes: Vec<f32> = (0..anchors * 4).map(|_| rng.next() * 8.0 - 4.0).collect();

                let faces = d.detect(&scores, &boxes).unwrap();
                assert!(faces.len() <= anchors);
                for f in &faces {
                    assert!((0.0..=1.0).contains(&f.score), "score {}", f.score);
                    assert!(f.x1 <= f.x2, "{:?}", f);
                    assert!(f.y1 <= f.y2, "{:?}", f);
                    assert!(f.x2 <= 320.0 && f.y2 <= 240.0);
                }
            }
        }
    }
}
