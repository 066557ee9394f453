use image::{GrayImage, ImageFormat, RgbImage};

use super::frame::{Frame, PixelFormat};
use crate::error::DecodeError;

/// Decode a captured frame into packed RGB, whatever the connector produced.
pub fn decode_frame(frame: &Frame) -> Result<RgbImage, DecodeError> {
    let meta = &frame.meta;
    match meta.format {
        PixelFormat::Mjpeg => {
            let image = image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)?;
            Ok(image.to_rgb8())
        }
        PixelFormat::Rgb24 => raw_rgb(frame.data.to_vec(), meta.width, meta.height),
        PixelFormat::Bgr24 => {
            let mut pixels = frame.data.to_vec();
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            raw_rgb(pixels, meta.width, meta.height)
        }
    }
}

/// Single-channel view expected by the detection capability.
pub fn to_gray(image: &RgbImage) -> GrayImage {
    image::imageops::grayscale(image)
}

fn raw_rgb(pixels: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, DecodeError> {
    let len = pixels.len();
    RgbImage::from_raw(width, height, pixels).ok_or(DecodeError::SizeMismatch { len, width, height })
}
