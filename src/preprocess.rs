//! Camera frame to model input conversion.

use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::{Array4, ArrayView4};
use rayon::prelude::*;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::face_detection::FaceInfo;

/// Per-channel normalization: `(pixel * pixel_scale - mean) / std`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub pixel_scale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// ImageNet statistics used by torchvision classifiers.
    pub const TORCHVISION: Normalization = Normalization {
        pixel_scale: 1.0 / 255.0,
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// UltraFace expects `(pixel - 127) / 128`.
    pub const ULTRANET: Normalization = Normalization {
        pixel_scale: 1.0,
        mean: [127.0, 127.0, 127.0],
        std: [128.0, 128.0, 128.0],
    };

    #[inline]
    pub fn apply(&self, channel: usize, value: u8) -> f32 {
        (value as f32 * self.pixel_scale - self.mean[channel]) / self.std[channel]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeMode {
    /// Scale to cover the target, then cut the centered target-sized window.
    #[default]
    CenterCrop,
    /// Scale to fit inside the target and pad the remainder with black.
    Letterbox,
}

/// Planar YUV 4:2:0 frame as delivered by mobile camera pipelines.
///
/// Chroma planes are subsampled by two in both directions. `uv_pixel_stride` is 1 for
/// fully planar (I420) data and 2 for semi-planar layouts that interleave U and V.
#[derive(Debug, Clone)]
pub struct Yuv420Frame {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub y_row_stride: usize,
    pub uv_row_stride: usize,
    pub uv_pixel_stride: usize,
}

impl Yuv420Frame {
    fn check_planes(&self) -> Result<()> {
        let (w, h) = (self.width as usize, self.height as usize);
        let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);

        let y_needed = if h == 0 { 0 } else { (h - 1) * self.y_row_stride + w };
        let uv_needed = if ch == 0 {
            0
        } else {
            (ch - 1) * self.uv_row_stride + (cw - 1) * self.uv_pixel_stride + 1
        };

        if self.y.len() < y_needed {
            return Err(Error::ShapeMismatch {
                what: "y plane",
                expected: y_needed,
                actual: self.y.len(),
            });
        }
        for (what, plane) in [("u plane", &self.u), ("v plane", &self.v)] {
            if plane.len() < uv_needed {
                return Err(Error::ShapeMismatch {
                    what,
                    expected: uv_needed,
                    actual: plane.len(),
                });
            }
        }
        Ok(())
    }

    /// Converts to RGB using full-range BT.601 coefficients.
    pub fn to_rgb(&self) -> Result<RgbImage> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::ShapeMismatch {
                what: "frame",
                expected: 1,
                actual: 0,
            });
        }
        self.check_planes()?;

        let width = self.width as usize;
        let mut buffer = vec![0u8; width * self.height as usize * 3];

        buffer
            .par_chunks_mut(width * 3)
            .enumerate()
            .for_each(|(row, out)| {
                let y_row = &self.y[row * self.y_row_stride..];
                let uv_offset = (row / 2) * self.uv_row_stride;
                for col in 0..width {
                    let uv_idx = uv_offset + (col / 2) * self.uv_pixel_stride;
                    let y = y_row[col] as f32;
                    let u = self.u[uv_idx] as f32 - 128.0;
                    let v = self.v[uv_idx] as f32 - 128.0;

                    let r = y + 1.402 * v;
                    let g = y - 0.344_136 * u - 0.714_136 * v;
                    let b = y + 1.772 * u;

                    out[col * 3] = r.round().clamp(0.0, 255.0) as u8;
                    out[col * 3 + 1] = g.round().clamp(0.0, 255.0) as u8;
                    out[col * 3 + 2] = b.round().clamp(0.0, 255.0) as u8;
                }
            });

        RgbImage::from_raw(self.width, self.height, buffer).ok_or(Error::ShapeMismatch {
            what: "rgb buffer",
            expected: width * self.height as usize * 3,
            actual: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Rgb(RgbImage),
    Yuv420(Yuv420Frame),
}

impl Frame {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Frame::Rgb(image) => image.dimensions(),
            Frame::Yuv420(frame) => (frame.width, frame.height),
        }
    }

    pub fn to_rgb(&self) -> Result<Cow<'_, RgbImage>> {
        match self {
            Frame::Rgb(image) => Ok(Cow::Borrowed(image)),
            Frame::Yuv420(frame) => Ok(Cow::Owned(frame.to_rgb()?)),
        }
    }
}

/// NCHW float input buffer, allocated once and overwritten for every frame.
#[derive(Debug, Clone)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            data: Array4::zeros((1, channels, height, width)),
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3]]
    }

    pub fn width(&self) -> usize {
        self.data.shape()[3]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[2]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }
}

/// Geometry applied by [`fill_input_tensor`]: the frame is rotated upright, then
/// `input = upright * scale + offset` maps upright frame pixels into model input pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTransform {
    /// Clockwise rotation in `0..360`.
    pub rotation: i32,
    /// Frame size after rotation.
    pub upright_size: (u32, u32),
    pub scale: (f32, f32),
    /// Letterbox padding (positive) or center-crop cut (negative), in input pixels.
    pub offset: (f32, f32),
}

impl FrameTransform {
    pub fn identity(size: (u32, u32)) -> Self {
        Self {
            rotation: 0,
            upright_size: size,
            scale: (1.0, 1.0),
            offset: (0.0, 0.0),
        }
    }

    /// Maps a point in model input space onto the upright frame.
    pub fn to_upright(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset.0) / self.scale.0,
            (y - self.offset.1) / self.scale.1,
        )
    }

    /// Maps a face from model input space onto the upright frame, clipped to the frame.
    pub fn map_face(&self, face: &FaceInfo) -> FaceInfo {
        let (w, h) = (self.upright_size.0 as f32, self.upright_size.1 as f32);
        let (x1, y1) = self.to_upright(face.x1, face.y1);
        let (x2, y2) = self.to_upright(face.x2, face.y2);
        FaceInfo {
            x1: x1.clamp(0.0, w),
            y1: y1.clamp(0.0, h),
            x2: x2.clamp(0.0, w),
            y2: y2.clamp(0.0, h),
            score: face.score,
        }
    }
}

struct Fitted {
    image: RgbImage,
    scale: (f32, f32),
    offset: (f32, f32),
}

/// Rotates the frame upright, resizes it to the tensor's size and normalizes it into `tensor`.
/// Returns the transform needed to map detections back onto the upright frame.
pub fn fill_input_tensor(
    frame: &Frame,
    rotation_degrees: i32,
    mode: ResizeMode,
    norm: &Normalization,
    tensor: &mut InputTensor,
) -> Result<FrameTransform> {
    if tensor.channels() != 3 {
        return Err(Error::ShapeMismatch {
            what: "input channels",
            expected: 3,
            actual: tensor.channels(),
        });
    }

    let rgb = frame.to_rgb()?;
    let rotated = rotate(&rgb, rotation_degrees)?;
    let (tw, th) = (tensor.width() as u32, tensor.height() as u32);

    let fitted = match mode {
        ResizeMode::CenterCrop => center_crop(&rotated, tw, th),
        ResizeMode::Letterbox => letterbox(&rotated, tw, th),
    };

    for (x, y, pixel) in fitted.image.enumerate_pixels() {
        for c in 0..3 {
            tensor.data[[0, c, y as usize, x as usize]] = norm.apply(c, pixel[c]);
        }
    }

    Ok(FrameTransform {
        rotation: rotation_degrees.rem_euclid(360),
        upright_size: rotated.dimensions(),
        scale: fitted.scale,
        offset: fitted.offset,
    })
}

fn rotate(image: &RgbImage, degrees: i32) -> Result<Cow<'_, RgbImage>> {
    match degrees.rem_euclid(360) {
        0 => Ok(Cow::Borrowed(image)),
        90 => Ok(Cow::Owned(imageops::rotate90(image))),
        180 => Ok(Cow::Owned(imageops::rotate180(image))),
        270 => Ok(Cow::Owned(imageops::rotate270(image))),
        _ => Err(Error::UnsupportedRotation(degrees)),
    }
}

fn center_crop(image: &RgbImage, tw: u32, th: u32) -> Fitted {
    let (w, h) = image.dimensions();
    let scale = f32::max(tw as f32 / w as f32, th as f32 / h as f32);
    let nw = ((w as f32 * scale).ceil() as u32).max(tw);
    let nh = ((h as f32 * scale).ceil() as u32).max(th);
    let (cx, cy) = ((nw - tw) / 2, (nh - th) / 2);

    let resized = imageops::resize(image, nw, nh, FilterType::Triangle);
    Fitted {
        image: imageops::crop_imm(&resized, cx, cy, tw, th).to_image(),
        scale: (nw as f32 / w as f32, nh as f32 / h as f32),
        offset: (-(cx as f32), -(cy as f32)),
    }
}

fn letterbox(image: &RgbImage, tw: u32, th: u32) -> Fitted {
    let (w, h) = image.dimensions();
    let scale = f32::min(tw as f32 / w as f32, th as f32 / h as f32);
    let nw = ((w as f32 * scale).round() as u32).clamp(1, tw);
    let nh = ((h as f32 * scale).round() as u32).clamp(1, th);
    let (px, py) = ((tw - nw) / 2, (th - nh) / 2);

    let resized = imageops::resize(image, nw, nh, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(tw, th, Rgb([0, 0, 0]));
    imageops::overlay(&mut canvas, &resized, px as i64, py as i64);
    Fitted {
        image: canvas,
        scale: (nw as f32 / w as f32, nh as f32 / h as f32),
        offset: (px as f32, py as f32),
    }
}
