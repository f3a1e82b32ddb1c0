use std::path::{Path, PathBuf};

use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rusttype::{Font, Scale};

use crate::error::{Error, Result};
use crate::face_detection::{FaceBoundingBox, FaceInfo};
use crate::preprocess::FrameTransform;

pub const MAGENTA: Rgba<u8> = Rgba([255u8, 0u8, 255u8, 255u8]);
const TRANSPARENT: Rgba<u8> = Rgba([0u8, 0u8, 0u8, 0u8]);

pub struct OverlayStyle {
    pub color: Rgba<u8>,
    pub stroke_width: u32,
    pub text_scale: f32,
    pub font: Option<Font<'static>>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            color: MAGENTA,
            stroke_width: 5,
            text_scale: 37.0,
            font: None,
        }
    }
}

impl OverlayStyle {
    pub fn with_font_file(mut self, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let font = Font::try_from_vec(bytes)
            .ok_or_else(|| Error::Config(format!("{} is not a usable font", path.display())))?;
        self.font = Some(font);
        Ok(self)
    }
}

pub fn clear(overlay: &mut RgbaImage) {
    for pixel in overlay.pixels_mut() {
        *pixel = TRANSPARENT;
    }
}

/// Clears the overlay and draws every face. Faces are mapped from model input space back
/// onto the upright frame through `transform`, then scaled to the overlay size.
pub fn draw_faces(
    overlay: &mut RgbaImage,
    faces: &[FaceInfo],
    transform: &FrameTransform,
    style: &OverlayStyle,
) {
    clear(overlay);
    let canvas = overlay.dimensions();

    for face in faces {
        let scaled = transform
            .map_face(face)
            .rescaled(transform.upright_size, canvas);
        let (x, y) = scaled.origin();
        let (w, h) = (scaled.width(), scaled.height());

        // the stroke grows inward from the box edge
        for inset in 0..style.stroke_width {
            let inset_f = inset as f32;
            let rw = (w - 2.0 * inset_f).round();
            let rh = (h - 2.0 * inset_f).round();
            if rw < 1.0 || rh < 1.0 {
                break;
            }
            let rect = Rect::at((x + inset_f).round() as i32, (y + inset_f).round() as i32)
                .of_size(rw as u32, rh as u32);
            draw_hollow_rect_mut(overlay, rect, style.color);
        }

        if let Some(font) = &style.font {
            draw_text_mut(
                overlay,
                style.color,
                x.round() as i32,
                y.round() as i32,
                Scale::uniform(style.text_scale),
                font,
                &format!("{:.3}", scaled.score()),
            );
        }
    }
}

/// Transparent overlay the size of the upright frame with every face drawn on it.
pub fn render_overlay(
    faces: &[FaceInfo],
    transform: &FrameTransform,
    style: &OverlayStyle,
) -> RgbaImage {
    let (w, h) = transform.upright_size;
    let mut overlay = RgbaImage::new(w, h);
    draw_faces(&mut overlay, faces, transform, style);
    overlay
}

/// Writes an overlay as `frame_{index:05}.png` into `dir` and returns the path.
pub fn save_overlay(dir: &Path, index: usize, overlay: &RgbaImage) -> Result<PathBuf> {
    let path = dir.join(format!("frame_{index:05}.png"));
    overlay.save(&path)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_faces_scales_and_clears() {
        let mut overlay = RgbaImage::from_pixel(640, 480, Rgba([1, 2, 3, 4]));
        let faces = [FaceInfo {
            x1: 32.0,
            y1: 24.0,
            x2: 96.0,
            y2: 72.0,
            score: 0.9,
        }];
        let style = OverlayStyle::default();
        draw_faces(&mut overlay, &faces, &FrameTransform::identity((320, 240)), &style);

        // scaled box is (64, 48) - (192, 144)
        assert_eq!(*overlay.get_pixel(64, 48), MAGENTA);
        assert_eq!(*overlay.get_pixel(68, 100), MAGENTA);
        assert_eq!(*overlay.get_pixel(100, 100), TRANSPARENT);
        assert_eq!(*overlay.get_pixel(0, 0), TRANSPARENT);
    }

    #[test]
    fn test_degenerate_box_is_skipped() {
        let mut overlay = RgbaImage::new(100, 100);
        let faces = [FaceInfo {
            x1: 10.0,
            y1: 10.0,
            x2: 10.0,
            y2: 10.0,
            score: 0.8,
        }];
        draw_faces(
            &mut overlay,
            &faces,
            &FrameTransform::identity((100, 100)),
            &OverlayStyle::default(),
        );
        assert!(overlay.pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn test_invalid_font_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("font.ttf");
        std::fs::write(&path, b"not a font").unwrap();
        assert!(OverlayStyle::default().with_font_file(&path).is_err());
    }

    #[test]
    fn test_letterboxed_faces_skip_padding() {
        // 960x540 frame letterboxed into 320x240: scale 1/3, 30 rows of padding on top
        let transform = FrameTransform {
            rotation: 0,
            upright_size: (960, 540),
            scale: (1.0 / 3.0, 1.0 / 3.0),
            offset: (0.0, 30.0),
        };
        let faces = [FaceInfo {
            x1: 10.0,
            y1: 40.0,
            x2: 50.0,
            y2: 80.0,
            score: 0.9,
        }];
        let overlay = render_overlay(&faces, &transform, &OverlayStyle::default());

        assert_eq!(overlay.dimensions(), (960, 540));
        // mapped box is (30, 30) - (150, 150)
        assert_eq!(*overlay.get_pixel(30, 30), MAGENTA);
        assert_eq!(*overlay.get_pixel(149, 149), MAGENTA);
        assert_eq!(*overlay.get_pixel(29, 29), TRANSPARENT);
        assert_eq!(*overlay.get_pixel(90, 90), TRANSPARENT);
        // where the box would land without removing the padding
        assert_eq!(*overlay.get_pixel(30, 180), TRANSPARENT);
    }

    #[test]
    fn test_rotated_frame_overlay_is_upright() {
        let transform = FrameTransform {
            rotation: 90,
            upright_size: (480, 640),
            scale: (0.5, 0.5),
            offset: (0.0, 0.0),
        };
        let faces = [FaceInfo {
            x1: 100.0,
            y1: 200.0,
            x2: 150.0,
            y2: 300.0,
            score: 0.8,
        }];
        let overlay = render_overlay(&faces, &transform, &OverlayStyle::default());

        assert_eq!(overlay.dimensions(), (480, 640));
        assert_eq!(*overlay.get_pixel(200, 400), MAGENTA);
        assert_eq!(*overlay.get_pixel(299, 599), MAGENTA);
        assert_eq!(*overlay.get_pixel(250, 500), TRANSPARENT);
    }

    #[test]
    fn test_save_overlay_names_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = RgbaImage::new(4, 3);
        let path = save_overlay(dir.path(), 7, &overlay).unwrap();
        assert_eq!(path, dir.path().join("frame_00007.png"));
        assert_eq!(image::open(&path).unwrap().to_rgba8().dimensions(), (4, 3));
    }
}
