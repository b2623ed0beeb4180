//! Image content verification (signature sniffing plus a full decode).

use crate::types::ValidationOutcome;
use image::ImageFormat;
use std::path::Path;

/// Bytes at the end of a JPEG searched for the end-of-image marker.
const JPEG_TAIL_WINDOW: usize = 1024;

/// Decides whether content is acceptable to persist.
pub trait Validator: Send + Sync + 'static {
    /// Validates an in-memory buffer. Pure; never touches the filesystem.
    fn validate(&self, bytes: &[u8]) -> ValidationOutcome;

    /// Validates a file's content. A missing or unreadable file is invalid.
    fn validate_file(&self, path: &Path) -> ValidationOutcome {
        match std::fs::read(path) {
            Ok(bytes) => self.validate(&bytes),
            Err(e) => ValidationOutcome::invalid(format!("unreadable {}: {}", path.display(), e)),
        }
    }
}

/// Image formats recognised by their leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Bmp,
}

impl ImageKind {
    fn format(self) -> ImageFormat {
        match self {
            ImageKind::Jpeg => ImageFormat::Jpeg,
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Gif => ImageFormat::Gif,
            ImageKind::Bmp => ImageFormat::Bmp,
        }
    }
}

/// Identifies the image format from its magic number.
pub fn sniff(bytes: &[u8]) -> Option<ImageKind> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageKind::Jpeg)
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some(ImageKind::Png)
    } else if bytes.starts_with(b"GIF8") {
        Some(ImageKind::Gif)
    } else if bytes.starts_with(b"BM") {
        Some(ImageKind::Bmp)
    } else {
        None
    }
}

/// Validator for JPEG, PNG, GIF and BMP content.
///
/// A header check alone lets crafted or truncated data through, so every
/// buffer that passes the signature check is decoded as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageValidator {
    min_size: u64,
}

impl ImageValidator {
    /// Creates a validator that also rejects content below `min_size` bytes.
    pub fn new(min_size: u64) -> Self {
        Self { min_size }
    }

    pub fn min_size(&self) -> u64 {
        self.min_size
    }
}

impl Validator for ImageValidator {
    fn validate(&self, bytes: &[u8]) -> ValidationOutcome {
        if bytes.is_empty() {
            return ValidationOutcome::invalid("empty content");
        }
        if (bytes.len() as u64) < self.min_size {
            return ValidationOutcome::invalid(format!(
                "{} bytes is below the {} byte minimum",
                bytes.len(),
                self.min_size
            ));
        }

        let Some(kind) = sniff(bytes) else {
            return ValidationOutcome::invalid("unrecognised image signature");
        };

        // JPEG decoders tolerate missing scan data, so check the trailer explicitly.
        if kind == ImageKind::Jpeg {
            let tail = &bytes[bytes.len().saturating_sub(JPEG_TAIL_WINDOW)..];
            if !tail.windows(2).any(|w| w == [0xFF, 0xD9]) {
                return ValidationOutcome::invalid("JPEG is missing its end-of-image marker");
            }
        }

        match image::load_from_memory_with_format(bytes, kind.format()) {
            Ok(_) => ValidationOutcome::valid(),
            Err(e) => ValidationOutcome::invalid(format!("{:?} decode failed: {}", kind, e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};
    use std::io::Cursor;

    pub(crate) const TINY_GIF: &[u8] = &[
        0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xFF, 0xFF,
        0xFF, 0x00, 0x00, 0x00, 0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2C, 0x00, 0x00,
        0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3B,
    ];

    pub(crate) fn encode(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8])
        });
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, format)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
        assert_eq!(sniff(&[0x89, b'P', b'N', b'G', 0x0D]), Some(ImageKind::Png));
        assert_eq!(sniff(b"GIF89a"), Some(ImageKind::Gif));
        assert_eq!(sniff(b"BM\x00\x00"), Some(ImageKind::Bmp));
        assert_eq!(sniff(b"<!DOCTYPE html>"), None);
        assert_eq!(sniff(&[]), None);
    }

    #[test]
    fn test_accepts_decodable_images() {
        let validator = ImageValidator::default();
        for format in [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Bmp] {
            let bytes = encode(format, 32, 24);
            let outcome = validator.validate(&bytes);
            assert!(outcome.is_valid(), "{:?}: {:?}", format, outcome.reason);
        }
        assert!(validator.validate(TINY_GIF).is_valid());
    }

    #[test]
    fn test_rejects_empty_and_small() {
        assert!(!ImageValidator::default().validate(&[]).is_valid());

        let bytes = encode(ImageFormat::Png, 8, 8);
        let strict = ImageValidator::new(bytes.len() as u64 + 1);
        let outcome = strict.validate(&bytes);
        assert!(!outcome.is_valid());
        assert!(outcome.reason.unwrap().contains("minimum"));
    }

    #[test]
    fn test_rejects_html_error_page() {
        let page = b"<!DOCTYPE html><html><head><title>404</title></head></html>";
        let outcome = ImageValidator::default().validate(page);
        assert!(!outcome.is_valid());
        assert_eq!(outcome.reason.as_deref(), Some("unrecognised image signature"));
    }

    #[test]
    fn test_rejects_header_only_garbage() {
        let mut crafted = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        crafted.extend_from_slice(&[0u8; 256]);
        assert!(!ImageValidator::default().validate(&crafted).is_valid());

        let mut crafted = vec![0xFF, 0xD8, 0xFF, 0xE0];
        crafted.extend_from_slice(&[0x11u8; 256]);
        crafted.extend_from_slice(&[0xFF, 0xD9]);
        assert!(!ImageValidator::default().validate(&crafted).is_valid());
    }

    #[test]
    fn test_rejects_truncated_images() {
        let validator = ImageValidator::default();

        let png = encode(ImageFormat::Png, 64, 64);
        assert!(!validator.validate(&png[..png.len() / 2]).is_valid());

        let jpeg = encode(ImageFormat::Jpeg, 64, 64);
        assert!(!validator.validate(&jpeg[..jpeg.len() / 2]).is_valid());
    }

    #[test]
    fn test_validate_file() {
        let dir = tempfile::tempdir().unwrap();
        let validator = ImageValidator::default();

        let missing = dir.path().join("missing.png");
        assert!(!validator.validate_file(&missing).is_valid());

        let good = dir.path().join("good.png");
        std::fs::write(&good, encode(ImageFormat::Png, 16, 16)).unwrap();
        assert!(validator.validate_file(&good).is_valid());

        let bad = dir.path().join("bad.jpg");
        std::fs::write(&bad, b"<html>oops</html>").unwrap();
        assert!(!validator.validate_file(&bad).is_valid());
    }
}
