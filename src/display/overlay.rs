//! Draws face boxes, labels and stream info onto decoded frames.

use std::path::Path;

use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::info;

use crate::display::FaceAnnotation;
use crate::error::OverlayError;

/// DejaVu Sans Mono, see `assets/fonts/LICENSE-DejaVu`.
const BUNDLED_FONT: &[u8] = include_bytes!("../../assets/fonts/DejaVuSansMono.ttf");

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const NAME_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const CONFIDENCE_COLOR: Rgb<u8> = Rgb([0, 255, 255]);
const INFO_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

pub struct Overlay {
    font: Option<FontArc>,
    scale: PxScale,
}

impl Overlay {
    /// Boxes only, no text.
    pub fn plain() -> Self {
        Self {
            font: None,
            scale: PxScale::from(24.0),
        }
    }

    /// Labels with the bundled font.
    pub fn bundled(size: f32) -> Result<Self, OverlayError> {
        let font = FontArc::try_from_slice(BUNDLED_FONT).map_err(|_| OverlayError::BundledFont)?;
        Ok(Self {
            font: Some(font),
            scale: PxScale::from(size),
        })
    }

    /// Labels with the font at `font`, or the bundled one when unset.
    pub fn load(font: Option<&Path>, size: f32) -> Result<Self, OverlayError> {
        let Some(path) = font else {
            return Self::bundled(size);
        };
        let bytes = std::fs::read(path).map_err(|source| OverlayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let font = FontArc::try_from_vec(bytes).map_err(|_| OverlayError::InvalidFont {
            path: path.to_path_buf(),
        })?;
        info!(font = %path.display(), size, "overlay font loaded");
        Ok(Self {
            font: Some(font),
            scale: PxScale::from(size),
        })
    }

    /// Whether labels are drawn.
    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Annotate `image` in place.
    ///
    /// Label positions are baselines, so names sit just above each box and
    /// confidences just inside its bottom edge.
    pub fn draw(&self, image: &mut RgbImage, faces: &[FaceAnnotation], fps: f64, stream: &str) {
        for face in faces {
            let b = face.bbox;
            for inset in 0..BOX_THICKNESS {
                let (w, h) = (
                    b.width.saturating_sub(2 * inset),
                    b.height.saturating_sub(2 * inset),
                );
                if w == 0 || h == 0 {
                    break;
                }
                let rect = Rect::at((b.x + inset) as i32, (b.y + inset) as i32).of_size(w, h);
                draw_hollow_rect_mut(image, rect, BOX_COLOR);
            }
        }

        let Some(font) = &self.font else {
            return;
        };
        // draw_text_mut takes the top of the line, not the baseline
        let ascent = font.as_scaled(self.scale).ascent().round() as i32;
        let mut text = |color: Rgb<u8>, x: i32, baseline: i32, s: &str| {
            draw_text_mut(&mut *image, color, x, baseline - ascent, self.scale, font, s);
        };

        for face in faces {
            let b = face.bbox;
            let (x, y, h) = (b.x as i32, b.y as i32, b.height as i32);
            text(NAME_COLOR, x + 5, y - 5, &face.classification.name);
            text(
                CONFIDENCE_COLOR,
                x + 5,
                y + h - 5,
                &format!("{}%", face.classification.confidence),
            );
        }
        text(INFO_COLOR, 10, 30, &format!("FPS: {fps:.1}"));
        text(INFO_COLOR, 10, 60, &format!("Stream: {stream}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{BoundingBox, Classification};

    fn face(x: u32, y: u32, w: u32, h: u32) -> FaceAnnotation {
        FaceAnnotation {
            bbox: BoundingBox::new(x, y, w, h),
            classification: Classification {
                name: "alice".into(),
                confidence: 80,
                recognized: true,
            },
        }
    }

    fn lit(img: &RgbImage, xs: std::ops::Range<u32>, ys: std::ops::Range<u32>) -> usize {
        ys.flat_map(|y| xs.clone().map(move |x| (x, y)))
            .filter(|&(x, y)| *img.get_pixel(x, y) != Rgb([0, 0, 0]))
            .count()
    }

    #[test]
    fn test_box_is_two_pixels_wide() {
        let mut img = RgbImage::new(64, 64);
        Overlay::plain().draw(&mut img, &[face(10, 10, 20, 20)], 30.0, "cam");

        assert_eq!(*img.get_pixel(10, 10), BOX_COLOR);
        assert_eq!(*img.get_pixel(11, 11), BOX_COLOR);
        assert_eq!(*img.get_pixel(29, 29), BOX_COLOR);
        assert_eq!(*img.get_pixel(12, 12), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(20, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_plain_draws_no_text() {
        let mut img = RgbImage::new(32, 32);
        Overlay::plain().draw(&mut img, &[], 12.5, "cam");
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_default_overlay_draws_labels() {
        let overlay = Overlay::load(None, 16.0).unwrap();
        assert!(overlay.has_font());

        let mut img = RgbImage::new(240, 200);
        overlay.draw(&mut img, &[face(60, 100, 60, 60)], 25.0, "Camera 1");

        // FPS line sits on baseline 30, stream line on baseline 60.
        assert!(lit(&img, 10..200, 14..32) > 0, "no FPS text");
        assert!(lit(&img, 10..200, 44..62) > 0, "no stream text");
        // Name above the box and confidence inside it are the only
        // colours with a blue component.
        let blue_above = (62..200)
            .flat_map(|x| (80..96).map(move |y| (x, y)))
            .any(|(x, y)| img.get_pixel(x, y)[2] > 0);
        assert!(blue_above, "no name label");
        let blue_inside = (62..118)
            .flat_map(|x| (140..158).map(move |y| (x, y)))
            .any(|(x, y)| img.get_pixel(x, y)[2] > 0);
        assert!(blue_inside, "no confidence label");
    }

    #[test]
    fn test_degenerate_and_edge_boxes() {
        let mut img = RgbImage::new(16, 16);
        let overlay = Overlay::plain();
        overlay.draw(&mut img, &[face(0, 0, 0, 0), face(0, 0, 1, 1), face(10, 10, 40, 40)], 0.0, "cam");
        assert_eq!(*img.get_pixel(0, 0), BOX_COLOR);
        assert_eq!(*img.get_pixel(15, 10), BOX_COLOR);
    }

    #[test]
    fn test_labels_near_edges_are_clipped() {
        let overlay = Overlay::bundled(24.0).unwrap();
        let mut img = RgbImage::new(20, 20);
        overlay.draw(&mut img, &[face(0, 0, 20, 20)], 999.9, "a-very-long-stream-name");
    }

    #[test]
    fn test_bad_font_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not a font").unwrap();
        let err = Overlay::load(Some(file.path()), 20.0).err().unwrap();
        assert!(matches!(err, OverlayError::InvalidFont { .. }));

        let err = Overlay::load(Some(Path::new("/no/such/font.ttf")), 20.0).err().unwrap();
        assert!(matches!(err, OverlayError::Io { .. }));
    }
}
