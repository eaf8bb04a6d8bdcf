//! Signature classifier: decide what a response body is from its bytes alone.
//!
//! Some deployments send binary images with `Content-Type: application/json`,
//! so the declared content type is ignored. The rules, first match wins:
//!
//! 1. empty or whitespace-only body → [`FluxscaleError::EmptyBody`]
//! 2. PNG magic (`89 50 4E 47 0D 0A 1A 0A`) → binary PNG
//! 3. JPEG start-of-image (`FF D8 FF`) → binary JPEG
//! 4. first non-whitespace byte is not `{` or `[` → binary, assumed PNG
//! 5. otherwise → JSON
//!
//! Rule 1 deliberately differs from a plain length check: a body of blanks
//! would otherwise fall through rule 4 and be stored as a PNG.

use crate::error::FluxscaleError;
use image::ImageFormat;
use tracing::debug;

/// PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// JPEG start-of-image marker.
pub const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// A response body after classification. Exactly one variant applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedPayload {
    BinaryImage { bytes: Vec<u8>, format: ImageFormat },
    Json(Vec<u8>),
}

impl ClassifiedPayload {
    pub fn is_binary(&self) -> bool {
        matches!(self, ClassifiedPayload::BinaryImage { .. })
    }
}

pub fn has_png_signature(data: &[u8]) -> bool {
    data.starts_with(&PNG_SIGNATURE)
}

pub fn has_jpeg_signature(data: &[u8]) -> bool {
    data.starts_with(&JPEG_SIGNATURE)
}

/// True when the first non-whitespace byte opens a JSON object or array.
pub fn looks_like_json(data: &[u8]) -> bool {
    matches!(
        data.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

/// Format recognised from magic bytes, if any.
pub fn sniff_format(data: &[u8]) -> Option<ImageFormat> {
    if has_png_signature(data) {
        Some(ImageFormat::Png)
    } else if has_jpeg_signature(data) {
        Some(ImageFormat::Jpeg)
    } else {
        None
    }
}

/// Classify a response body.
pub fn classify(body: Vec<u8>) -> Result<ClassifiedPayload, FluxscaleError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(FluxscaleError::EmptyBody);
    }

    if let Some(format) = sniff_format(&body) {
        debug!("Detected {:?} image data ({} bytes)", format, body.len());
        return Ok(ClassifiedPayload::BinaryImage {
            bytes: body,
            format,
        });
    }

    if !looks_like_json(&body) {
        debug!(
            "Unknown binary payload ({} bytes), defaulting to PNG",
            body.len()
        );
        return Ok(ClassifiedPayload::BinaryImage {
            bytes: body,
            format: ImageFormat::Png,
        });
    }

    Ok(ClassifiedPayload::Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_blank_bodies_are_errors() {
        assert!(matches!(classify(vec![]), Err(FluxscaleError::EmptyBody)));
        assert!(matches!(
            classify(b" \n\t".to_vec()),
            Err(FluxscaleError::EmptyBody)
        ));
    }

    #[test]
    fn png_magic_wins_over_json_tail() {
        let mut body = PNG_SIGNATURE.to_vec();
        body.extend_from_slice(br#"{"url":"http://x"}"#);
        match classify(body).unwrap() {
            ClassifiedPayload::BinaryImage { format, .. } => assert_eq!(format, ImageFormat::Png),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn jpeg_marker_detected() {
        let body = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        match classify(body).unwrap() {
            ClassifiedPayload::BinaryImage { format, .. } => assert_eq!(format, ImageFormat::Jpeg),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_binary_defaults_to_png() {
        let body = b"RIFF\x00\x00WEBPVP8 ".to_vec();
        match classify(body).unwrap() {
            ClassifiedPayload::BinaryImage { format, bytes } => {
                assert_eq!(format, ImageFormat::Png);
                assert!(bytes.starts_with(b"RIFF"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn json_bodies_never_classify_as_binary() {
        for body in [
            &b"{}"[..],
            b"[]",
            b"  \n {\"id\":\"job-1\"}",
            b"\t[\"http://x/a.png\"]",
            b"{\"success\":true,\"image\":\"data:image/png;base64,AAAA\"}",
        ] {
            let classified = classify(body.to_vec()).unwrap();
            assert!(!classified.is_binary(), "{:?}", String::from_utf8_lossy(body));
        }
    }

    #[test]
    fn short_prefixes_do_not_match() {
        assert!(!has_png_signature(&PNG_SIGNATURE[..7]));
        assert!(!has_jpeg_signature(&[0xFF, 0xD8]));
        assert_eq!(sniff_format(b"GIF89a"), None);
    }
}
