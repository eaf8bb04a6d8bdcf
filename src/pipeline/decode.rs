//! Payload decoder: turn a classified body into an image or a job ticket.
//!
//! Binary bodies are the image. JSON bodies are tried against three shapes,
//! in order:
//!
//! 1. **Direct URL**: `url`, `image_url`, `output_url`, then `result` when it
//!    is an absolute `http(s)` URL. An async mode with a job id present still
//!    yields a ticket: the URL is only a placeholder until the job finishes.
//! 2. **Nested base64**: `success: true` plus a data-URL whose payload is
//!    base64 of a JSON object, which holds the base64 of the real image.
//!    Both layers are decoded strictly; any failure is reported with the
//!    layer that broke.
//! 3. **Job ticket**: an `id` / `job_id` with nothing else usable.
//!
//! Anything else is a [`FluxscaleError::NoUsableResult`] carrying the body.

use crate::config::UpscaleMode;
use crate::error::{body_context, FluxscaleError};
use crate::output::ImageLocation;
use crate::pipeline::materialize::materialize_bytes;
use crate::pipeline::signature::{sniff_format, ClassifiedPayload};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use serde_json::{Map, Value};
use tracing::debug;

/// URL fields in priority order; `result` is handled separately.
const URL_FIELDS: [&str; 3] = ["url", "image_url", "output_url"];

/// Job id fields in priority order.
const JOB_ID_FIELDS: [&str; 2] = ["id", "job_id"];

/// Outer fields that may carry the data-URL of a nested-base64 envelope.
const DATA_URL_FIELDS: [&str; 4] = ["image", "data", "result", "output"];

/// Inner fields that may carry the final base64 image.
const INNER_IMAGE_FIELDS: [&str; 4] = ["image", "base64", "b64_json", "data"];

const BASE64_MARKER: &str = ";base64,";

/// What one upscale response resolved to.
#[derive(Debug)]
pub enum DecodedResult {
    ImmediateImage {
        location: ImageLocation,
        format: ImageFormat,
    },
    JobTicket(String),
}

/// JSON interpretation before any file is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonShape {
    DirectUrl(String),
    NestedImage(Vec<u8>),
    JobTicket(String),
}

/// Decode a classified payload for a request made in `mode`.
pub async fn decode(
    payload: ClassifiedPayload,
    mode: UpscaleMode,
) -> Result<DecodedResult, FluxscaleError> {
    match payload {
        ClassifiedPayload::BinaryImage { bytes, format } => {
            let image = materialize_bytes(bytes, format).await?;
            Ok(DecodedResult::ImmediateImage {
                location: ImageLocation::Local(image),
                format,
            })
        }
        ClassifiedPayload::Json(body) => match interpret_json(&body, mode)? {
            JsonShape::DirectUrl(url) => {
                let format = format_from_url(&url);
                Ok(DecodedResult::ImmediateImage {
                    location: ImageLocation::Remote(url),
                    format,
                })
            }
            JsonShape::NestedImage(bytes) => {
                let format = sniff_format(&bytes).unwrap_or(ImageFormat::Png);
                let image = materialize_bytes(bytes, format).await?;
                Ok(DecodedResult::ImmediateImage {
                    location: ImageLocation::Local(image),
                    format,
                })
            }
            JsonShape::JobTicket(id) => Ok(DecodedResult::JobTicket(id)),
        },
    }
}

/// Match a JSON body against the known envelope shapes.
pub fn interpret_json(body: &[u8], mode: UpscaleMode) -> Result<JsonShape, FluxscaleError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FluxscaleError::malformed("JSON response", e, body))?;
    let Some(obj) = value.as_object() else {
        return Err(FluxscaleError::NoUsableResult {
            body: body_context(body),
        });
    };

    let job_id = resolve_job_id(obj);

    if let Some(url) = resolve_url(obj) {
        if mode.requires_prompt() {
            if let Some(id) = job_id {
                debug!("{} response carries job id {}; polling instead of {}", mode, id, url);
                return Ok(JsonShape::JobTicket(id));
            }
        }
        debug!("Direct image URL in response: {}", url);
        return Ok(JsonShape::DirectUrl(url));
    }

    if let Some(data_url) = nested_data_url(obj) {
        let bytes = decode_nested_base64(data_url, body)?;
        debug!("Decoded nested base64 image ({} bytes)", bytes.len());
        return Ok(JsonShape::NestedImage(bytes));
    }

    if let Some(id) = job_id {
        return Ok(JsonShape::JobTicket(id));
    }

    Err(FluxscaleError::NoUsableResult {
        body: body_context(body),
    })
}

/// First usable image URL by field priority.
pub fn resolve_url(obj: &Map<String, Value>) -> Option<String> {
    URL_FIELDS
        .iter()
        .find_map(|k| str_field(obj, k))
        .or_else(|| str_field(obj, "result").filter(|r| is_http_url(r)))
        .map(str::to_string)
}

/// Job identifier, accepting string or numeric ids.
pub fn resolve_job_id(obj: &Map<String, Value>) -> Option<String> {
    JOB_ID_FIELDS.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Non-empty, trimmed string field.
pub(crate) fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn is_http_url(s: &str) -> bool {
    let lower = s.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_data_url(s: &str) -> bool {
    s.get(..5)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("data:"))
}

fn is_success(obj: &Map<String, Value>) -> bool {
    match obj.get("success") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// The data-URL of a nested-base64 envelope, if this is one.
fn nested_data_url(obj: &Map<String, Value>) -> Option<&str> {
    if !is_success(obj) {
        return None;
    }
    DATA_URL_FIELDS
        .iter()
        .find_map(|k| str_field(obj, k).filter(|v| is_data_url(v)))
        .or_else(|| {
            obj.get("data")
                .and_then(Value::as_object)
                .and_then(|inner| str_field(inner, "image"))
                .filter(|v| is_data_url(v))
        })
}

/// Unwrap `data:<mime>;base64,<b64(json{image: b64(bytes)})>` into raw bytes.
pub fn decode_nested_base64(data_url: &str, body: &[u8]) -> Result<Vec<u8>, FluxscaleError> {
    let (_, outer_b64) = data_url.split_once(BASE64_MARKER).ok_or_else(|| {
        FluxscaleError::malformed("data-URL", "missing ';base64,' marker", body)
    })?;

    let inner_json = STANDARD
        .decode(outer_b64.trim())
        .map_err(|e| FluxscaleError::malformed("outer base64 layer", e, body))?;

    let inner: Value = serde_json::from_slice(&inner_json)
        .map_err(|e| FluxscaleError::malformed("inner JSON layer", e, body))?;

    let inner_b64 = inner
        .as_object()
        .and_then(|o| INNER_IMAGE_FIELDS.iter().find_map(|k| str_field(o, k)))
        .ok_or_else(|| {
            FluxscaleError::malformed(
                "inner JSON layer",
                format!("no base64 image field (expected one of {INNER_IMAGE_FIELDS:?})"),
                body,
            )
        })?;
    let inner_b64 = match inner_b64.split_once(BASE64_MARKER) {
        Some((_, payload)) if is_data_url(inner_b64) => payload,
        _ => inner_b64,
    };

    let bytes = STANDARD
        .decode(inner_b64.trim())
        .map_err(|e| FluxscaleError::malformed("inner base64 layer", e, body))?;
    if bytes.is_empty() {
        return Err(FluxscaleError::malformed(
            "inner base64 layer",
            "decoded image is empty",
            body,
        ));
    }
    Ok(bytes)
}

/// Image format implied by a URL's path extension; PNG when unknown.
pub fn format_from_url(url: &str) -> ImageFormat {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    ImageFormat::from_path(path).unwrap_or(ImageFormat::Png)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::signature::PNG_SIGNATURE;
    use serde_json::json;

    fn nested_envelope(image: &[u8]) -> Vec<u8> {
        let inner = json!({ "image": STANDARD.encode(image) }).to_string();
        let data_url = format!("data:application/json;base64,{}", STANDARD.encode(inner));
        json!({ "success": true, "image": data_url }).to_string().into_bytes()
    }

    #[test]
    fn url_priority_order() {
        let body = json!({
            "output_url": "http://c/3.png",
            "image_url": "http://b/2.png",
            "url": "http://a/1.png",
        })
        .to_string();
        assert_eq!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast).unwrap(),
            JsonShape::DirectUrl("http://a/1.png".into())
        );

        let body = json!({ "url": "", "image_url": " ", "output_url": "http://c/3.png" }).to_string();
        assert_eq!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast).unwrap(),
            JsonShape::DirectUrl("http://c/3.png".into())
        );
    }

    #[test]
    fn result_field_only_counts_as_absolute_url() {
        let body = json!({ "result": "https://cdn/x.jpg" }).to_string();
        assert_eq!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast).unwrap(),
            JsonShape::DirectUrl("https://cdn/x.jpg".into())
        );

        let body = json!({ "result": "queued" }).to_string();
        assert!(matches!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast),
            Err(FluxscaleError::NoUsableResult { .. })
        ));
    }

    #[test]
    fn async_mode_with_id_prefers_ticket_over_url() {
        let body = json!({ "id": "job-7", "url": "http://placeholder/p.png" }).to_string();
        assert_eq!(
            interpret_json(body.as_bytes(), UpscaleMode::Conservative).unwrap(),
            JsonShape::JobTicket("job-7".into())
        );
        assert_eq!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast).unwrap(),
            JsonShape::DirectUrl("http://placeholder/p.png".into())
        );
    }

    #[test]
    fn bare_id_is_a_ticket() {
        let body = br#"{"id":"job-1"}"#;
        assert_eq!(
            interpret_json(body, UpscaleMode::Creative).unwrap(),
            JsonShape::JobTicket("job-1".into())
        );
        let body = br#"{"job_id": 42}"#;
        assert_eq!(
            interpret_json(body, UpscaleMode::Fast).unwrap(),
            JsonShape::JobTicket("42".into())
        );
    }

    #[test]
    fn nested_base64_round_trip() {
        let mut image = PNG_SIGNATURE.to_vec();
        image.extend((0..=255u8).cycle().take(1000));
        let body = nested_envelope(&image);
        match interpret_json(&body, UpscaleMode::Fast).unwrap() {
            JsonShape::NestedImage(bytes) => {
                assert_eq!(bytes, image);
                assert_eq!(STANDARD.encode(&bytes), STANDARD.encode(&image));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn nested_envelope_under_data_object() {
        let inner = json!({ "base64": STANDARD.encode(b"\xFF\xD8\xFFjpeg") }).to_string();
        let data_url = format!("data:text/plain;base64,{}", STANDARD.encode(inner));
        let body = json!({ "success": true, "data": { "image": data_url } }).to_string();
        assert_eq!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast).unwrap(),
            JsonShape::NestedImage(b"\xFF\xD8\xFFjpeg".to_vec())
        );
    }

    #[test]
    fn nested_envelope_requires_success_flag() {
        let inner = json!({ "image": STANDARD.encode(b"x") }).to_string();
        let data_url = format!("data:application/json;base64,{}", STANDARD.encode(inner));
        let body = json!({ "success": false, "image": data_url }).to_string();
        assert!(matches!(
            interpret_json(body.as_bytes(), UpscaleMode::Fast),
            Err(FluxscaleError::NoUsableResult { .. })
        ));
    }

    #[test]
    fn each_broken_layer_is_named() {
        let wrap = |inner: &str| format!("data:image/png;base64,{}", STANDARD.encode(inner));
        let cases = vec![
            ("data:image/png,notbase64".to_string(), "data-URL"),
            (
                "data:image/png;base64,!!!not-base64!!!".to_string(),
                "outer base64 layer",
            ),
            (wrap("not json"), "inner JSON layer"),
            (wrap(r#"{"other":"x"}"#), "inner JSON layer"),
            (wrap(r#"{"image":"%%%"}"#), "inner base64 layer"),
        ];
        for (data_url, expected) in cases {
            let body = json!({ "success": true, "image": data_url }).to_string();
            match interpret_json(body.as_bytes(), UpscaleMode::Fast) {
                Err(FluxscaleError::MalformedPayload { layer, body, .. }) => {
                    assert_eq!(layer, expected, "for {data_url}");
                    assert!(body.contains("success"));
                }
                other => panic!("{data_url}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unusable_json_keeps_body() {
        let body = br#"{"message":"nothing here"}"#;
        match interpret_json(body, UpscaleMode::Fast) {
            Err(FluxscaleError::NoUsableResult { body }) => assert!(body.contains("nothing here")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            interpret_json(b"[1,2]", UpscaleMode::Fast),
            Err(FluxscaleError::NoUsableResult { .. })
        ));
        assert!(matches!(
            interpret_json(b"{not json", UpscaleMode::Fast),
            Err(FluxscaleError::MalformedPayload { layer: "JSON response", .. })
        ));
    }

    #[test]
    fn url_format_guess() {
        assert_eq!(format_from_url("https://x/a.jpg?sig=1"), ImageFormat::Jpeg);
        assert_eq!(format_from_url("https://x/a.png#frag"), ImageFormat::Png);
        assert_eq!(format_from_url("https://x/result/123"), ImageFormat::Png);
    }

    #[tokio::test]
    async fn binary_payload_is_materialized() {
        let mut bytes = PNG_SIGNATURE.to_vec();
        bytes.extend_from_slice(b"rest");
        let decoded = decode(
            ClassifiedPayload::BinaryImage {
                bytes: bytes.clone(),
                format: ImageFormat::Png,
            },
            UpscaleMode::Fast,
        )
        .await
        .unwrap();
        match decoded {
            DecodedResult::ImmediateImage {
                location: ImageLocation::Local(img),
                format,
            } => {
                assert_eq!(format, ImageFormat::Png);
                assert_eq!(std::fs::read(img.path()).unwrap(), bytes);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
