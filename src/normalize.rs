use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Longer side of a normalized image never exceeds this.
pub const MAX_DIM: u32 = 512;
/// Fixed JPEG quality so identical pixel content always encodes to
/// identical bytes.
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
#[error("image is not decodable: {0}")]
pub struct DecodeError(#[from] image::ImageError);

/// A decoded, bounded, 3-channel bitmap together with its deterministic
/// JPEG encoding. The encoded bytes are what gets fingerprinted and stored.
pub struct NormalizedImage {
    pub image: RgbImage,
    pub bytes: Vec<u8>,
}

/// Decode raw upload bytes, drop alpha/palette down to RGB8, downscale so
/// the longer side is at most `MAX_DIM` (aspect ratio preserved, never
/// upscaled), and encode as quality-85 JPEG.
pub fn normalize(raw: &[u8]) -> Result<NormalizedImage, DecodeError> {
    let decoded = image::load_from_memory(raw)?;
    // Alpha is dropped, not composited.
    let rgb = decoded.to_rgb8();

    let (w, h) = rgb.dimensions();
    let ratio = (MAX_DIM as f32 / w as f32).min(MAX_DIM as f32 / h as f32);
    let resized = if ratio < 1.0 {
        let nw = ((w as f32 * ratio) as u32).max(1);
        let nh = ((h as f32 * ratio) as u32).max(1);
        image::imageops::resize(&rgb, nw, nh, FilterType::Lanczos3)
    } else {
        rgb
    };

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut bytes), JPEG_QUALITY)
        .encode_image(&resized)?;

    Ok(NormalizedImage {
        image: resized,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb};

    pub fn png_bytes(img: RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, _| {
            let v = (x * 255 / w.max(1)) as u8;
            Rgb([v, v, v])
        })
    }

    #[test]
    fn downscales_to_bounded_dimensions() {
        let raw = png_bytes(gradient(1024, 600));
        let norm = normalize(&raw).unwrap();
        let (w, h) = norm.image.dimensions();
        assert_eq!(w, 512);
        assert_eq!(h, 300); // 600 * (512/1024)
    }

    #[test]
    fn never_upscales_small_images() {
        let raw = png_bytes(gradient(100, 40));
        let norm = normalize(&raw).unwrap();
        assert_eq!(norm.image.dimensions(), (100, 40));
    }

    #[test]
    fn encoding_is_deterministic() {
        let raw = png_bytes(gradient(800, 800));
        let a = normalize(&raw).unwrap();
        let b = normalize(&raw).unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn alpha_is_dropped() {
        let rgba = image::RgbaImage::from_pixel(64, 64, image::Rgba([10, 20, 30, 128]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(rgba)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        let norm = normalize(&buf).unwrap();
        assert_eq!(norm.image.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(normalize(b"definitely not an image").is_err());
    }
}
