//! FoilPics - Image Handling
//!
//! Format hints, decoding, thumbnail geometry and the magic-byte MIME
//! probe. Everything pixel-shaped goes through the `image` crate.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};

use crate::error::{VaultError, VaultResult};

/// Decoder hint derived from a recorded content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Bmp,
    Gif,
    Jpeg,
    Png,
    Svg,
    Tiff,
    Pbm,
    Pgm,
    Ppm,
}

impl FormatHint {
    /// The decoder format, if the platform decoder knows one. SVG has no
    /// raster decoder here; it falls through to auto-detection and fails.
    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            FormatHint::Bmp => Some(ImageFormat::Bmp),
            FormatHint::Gif => Some(ImageFormat::Gif),
            FormatHint::Jpeg => Some(ImageFormat::Jpeg),
            FormatHint::Png => Some(ImageFormat::Png),
            FormatHint::Svg => None,
            FormatHint::Tiff => Some(ImageFormat::Tiff),
            FormatHint::Pbm | FormatHint::Pgm | FormatHint::Ppm => Some(ImageFormat::Pnm),
        }
    }
}

// Sorted by content type.
const FORMAT_MAP: &[(&str, FormatHint)] = &[
    ("image/bmp", FormatHint::Bmp),
    ("image/gif", FormatHint::Gif),
    ("image/jpeg", FormatHint::Jpeg),
    ("image/jpg", FormatHint::Jpeg),
    ("image/png", FormatHint::Png),
    ("image/svg+xml", FormatHint::Svg),
    ("image/tif", FormatHint::Tiff),
    ("image/tiff", FormatHint::Tiff),
    ("image/x-bmp", FormatHint::Bmp),
    ("image/x-portable-bitmap", FormatHint::Pbm),
    ("image/x-portable-graymap", FormatHint::Pgm),
    ("image/x-portable-pixmap", FormatHint::Ppm),
];

/// Exact, case-sensitive lookup. A miss means "let the decoder
/// auto-detect", so `image/jpeg;charset=binary` and friends fall through.
pub fn format_hint(content_type: &str) -> Option<FormatHint> {
    if content_type.is_empty() {
        return None;
    }
    match FORMAT_MAP.binary_search_by(|(ct, _)| (*ct).cmp(content_type)) {
        Ok(i) => Some(FORMAT_MAP[i].1),
        Err(_) => {
            log::debug!("Unknown content type {content_type}");
            None
        }
    }
}

/// Decodes `bytes` using the hint when one resolves to a decoder format.
pub fn decode(bytes: &[u8], hint: Option<FormatHint>) -> VaultResult<DynamicImage> {
    match hint.and_then(FormatHint::image_format) {
        Some(format) => Ok(image::load_from_memory_with_format(bytes, format)?),
        None => Ok(image::load_from_memory(bytes)?),
    }
}

/// Encodes pixels under the source's format hint, falling back to PNG.
/// The netpbm formats have no encoder here, so their thumbnails are PNG;
/// thumbnail decoding auto-detects and does not mind.
pub fn encode(pixels: &RgbaImage, hint: Option<FormatHint>) -> VaultResult<Vec<u8>> {
    let format = match hint.and_then(FormatHint::image_format) {
        Some(ImageFormat::Pnm) | None => ImageFormat::Png,
        Some(format) => format,
    };
    let image = if format == ImageFormat::Jpeg {
        // JPEG has no alpha channel
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(pixels.clone()).to_rgb8())
    } else {
        DynamicImage::ImageRgba8(pixels.clone())
    };
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), format)
        .map_err(|e| VaultError::EncodeFailed(e.to_string()))?;
    Ok(out)
}

/// Builds the gallery thumbnail: scale so the cover axis matches `size`,
/// center-crop to the exact `size`x`size` square, then rotate the crop by
/// `-orientation` degrees.
pub fn thumbnail(image: &DynamicImage, size: u32, orientation: i32) -> RgbaImage {
    let (w, h) = image.dimensions();
    let size = size.max(1);
    let (sw, sh) = if (w as u64) * (size as u64) > (size as u64) * (h as u64) {
        let sw = ((w as f64 * size as f64 / h as f64).round() as u32).max(size);
        (sw, size)
    } else {
        let sh = ((h as f64 * size as f64 / w as f64).round() as u32).max(size);
        (size, sh)
    };
    let scaled = image.resize_exact(sw, sh, FilterType::Lanczos3);
    let x = (sw - size) / 2;
    let y = (sh - size) / 2;
    let cropped = scaled.crop_imm(x, y, size, size);
    let rotated = match orientation.rem_euclid(360) {
        90 => cropped.rotate270(),
        180 => cropped.rotate180(),
        270 => cropped.rotate90(),
        _ => cropped,
    };
    rotated.to_rgba8()
}

/// MIME probe contract. The gallery deployment plugs in the platform
/// database; the default sniffs magic bytes.
pub trait MimeProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Option<String>;
}

/// Magic-byte probe covering the formats in the hint table.
pub struct MagicMimeProbe;

impl MimeProbe for MagicMimeProbe {
    fn probe(&self, path: &Path) -> Option<String> {
        let mut head = [0u8; 12];
        let mut file = File::open(path).ok()?;
        let n = file.read(&mut head).ok()?;
        sniff(&head[..n]).map(str::to_string)
    }
}

fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.len() < 2 {
        return None;
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if head.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some("image/png");
    }
    if head.starts_with(b"GIF8") {
        return Some("image/gif");
    }
    if head.starts_with(b"BM") {
        return Some("image/bmp");
    }
    if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        return Some("image/tiff");
    }
    if head[0] == b'P' && head.len() >= 2 {
        match head[1] {
            b'1' | b'4' => return Some("image/x-portable-bitmap"),
            b'2' | b'5' => return Some("image/x-portable-graymap"),
            b'3' | b'6' => return Some("image/x-portable-pixmap"),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_map_is_sorted() {
        for pair in FORMAT_MAP.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn hint_lookup_is_exact() {
        assert_eq!(format_hint("image/jpeg"), Some(FormatHint::Jpeg));
        assert_eq!(format_hint("image/jpg"), Some(FormatHint::Jpeg));
        assert_eq!(format_hint("image/x-portable-pixmap"), Some(FormatHint::Ppm));
        assert_eq!(format_hint(""), None);
        assert_eq!(format_hint("image/JPEG"), None);
        assert_eq!(format_hint("image/jpeg;charset=binary"), None);
        assert_eq!(format_hint("application/pdf"), None);
    }

    #[test]
    fn thumbnail_is_exact_size_for_any_aspect() {
        for (w, h) in [(640, 480), (480, 640), (100, 100), (1000, 50)] {
            let img = DynamicImage::new_rgb8(w, h);
            let thumb = thumbnail(&img, 32, 0);
            assert_eq!(thumb.dimensions(), (32, 32));
        }
    }

    #[test]
    fn thumbnail_rotation_keeps_square() {
        let img = DynamicImage::new_rgb8(300, 200);
        for orientation in [0, 90, 180, 270] {
            let thumb = thumbnail(&img, 48, orientation);
            assert_eq!(thumb.dimensions(), (48, 48));
        }
    }

    #[test]
    fn thumbnail_rotation_moves_pixels() {
        // Paint the left half white; rotating by 180 must move it right.
        let mut buf = RgbaImage::new(64, 64);
        for (x, _, px) in buf.enumerate_pixels_mut() {
            *px = if x < 32 {
                image::Rgba([255, 255, 255, 255])
            } else {
                image::Rgba([0, 0, 0, 255])
            };
        }
        let img = DynamicImage::ImageRgba8(buf);
        let plain = thumbnail(&img, 64, 0);
        let flipped = thumbnail(&img, 64, 180);
        assert_eq!(plain.get_pixel(0, 32)[0], 255);
        assert_eq!(flipped.get_pixel(0, 32)[0], 0);
    }

    #[test]
    fn decode_honors_hint_and_auto_detects() {
        let img = DynamicImage::new_rgb8(8, 8);
        let mut png = Vec::new();
        img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png).unwrap();

        assert!(decode(&png, Some(FormatHint::Png)).is_ok());
        assert!(decode(&png, None).is_ok());
        // Wrong hint means the decoder is told the wrong format.
        assert!(decode(&png, Some(FormatHint::Jpeg)).is_err());
        assert!(decode(b"junk", None).is_err());
    }

    #[test]
    fn sniff_matches_the_hint_table() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(
            sniff(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]),
            Some("image/png")
        );
        assert_eq!(sniff(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff(b"P6\n12 12"), Some("image/x-portable-pixmap"));
        assert_eq!(sniff(b"\x00\x01"), None);
    }

    #[test]
    fn jpeg_encode_drops_alpha() {
        let thumb = RgbaImage::new(16, 16);
        let jpeg = encode(&thumb, Some(FormatHint::Jpeg)).unwrap();
        let back = decode(&jpeg, Some(FormatHint::Jpeg)).unwrap();
        assert_eq!(back.dimensions(), (16, 16));
    }
}
