//! Upscale requests: local validation and multipart construction.
//!
//! Validation runs before anything touches the network. An oversize image, an
//! empty image, or an async mode without a prompt is rejected here and the
//! transport is never called.

use crate::config::UpscaleMode;
use crate::error::FluxscaleError;
use crate::pipeline::materialize::is_supported_image_path;
use crate::pipeline::signature::sniff_format;
use crate::transport::{FilePart, MultipartBody};
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

/// Everything about an upscale except the image itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpscaleOptions {
    pub mode: UpscaleMode,
    /// Required for conservative and creative modes.
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
    /// Creativity level, sent with two decimals.
    pub creativity: Option<f32>,
    /// `png`, `jpeg` or `webp`.
    pub output_format: Option<String>,
    pub style_preset: Option<String>,
}

impl UpscaleOptions {
    pub fn new(mode: UpscaleMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn negative_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(prompt.into());
        self
    }

    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn creativity(mut self, creativity: f32) -> Self {
        self.creativity = Some(creativity);
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into().to_lowercase());
        self
    }

    pub fn style_preset(mut self, preset: impl Into<String>) -> Self {
        self.style_preset = Some(preset.into());
        self
    }

    /// Check the mode/prompt invariant.
    pub fn validate(&self) -> Result<(), FluxscaleError> {
        if self.mode.requires_prompt() && non_empty(&self.prompt).is_none() {
            return Err(FluxscaleError::PromptRequired { mode: self.mode });
        }
        Ok(())
    }

    /// Form fields in wire order: `type` first, then every option that is set.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![("type".to_string(), self.mode.as_str().to_string())];
        let mut push = |name: &str, value: Option<String>| {
            if let Some(v) = value {
                fields.push((name.to_string(), v));
            }
        };
        push("prompt", non_empty(&self.prompt));
        push("negative_prompt", non_empty(&self.negative_prompt));
        push("seed", self.seed.map(|s| s.to_string()));
        push("creativity", self.creativity.map(|c| format!("{c:.2}")));
        push("output_format", non_empty(&self.output_format));
        push("style_preset", non_empty(&self.style_preset));
        fields
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Source image plus options for one upscale.
#[derive(Clone, PartialEq)]
pub struct UpscaleRequest {
    pub image: Vec<u8>,
    /// File name reported in the multipart part.
    pub file_name: String,
    pub options: UpscaleOptions,
}

impl std::fmt::Debug for UpscaleRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpscaleRequest")
            .field("image_len", &self.image.len())
            .field("file_name", &self.file_name)
            .field("options", &self.options)
            .finish()
    }
}

impl UpscaleRequest {
    pub fn new(image: Vec<u8>, options: UpscaleOptions) -> Self {
        let ext = sniff_format(&image)
            .map(crate::output::extension_for)
            .unwrap_or("png");
        Self {
            image,
            file_name: format!("image.{ext}"),
            options,
        }
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = name.into();
        self
    }

    /// Read an image file, enforcing `max_bytes` from metadata before reading.
    pub async fn from_path(
        path: impl AsRef<Path>,
        options: UpscaleOptions,
        max_bytes: u64,
    ) -> Result<Self, FluxscaleError> {
        let path = path.as_ref();
        if !is_supported_image_path(path) {
            return Err(FluxscaleError::UnsupportedImage {
                path: path.to_path_buf(),
            });
        }

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| FluxscaleError::io(path, e))?;
        check_size(meta.len(), max_bytes)?;

        let image = tokio::fs::read(path)
            .await
            .map_err(|e| FluxscaleError::io(path, e))?;
        debug!("Image file: {}, size: {} bytes", path.display(), image.len());

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image.png".to_string());
        Ok(Self {
            image,
            file_name,
            options,
        })
    }

    /// Validate everything that can be checked without the network.
    pub fn validate(&self, max_bytes: u64) -> Result<(), FluxscaleError> {
        check_size(self.image.len() as u64, max_bytes)?;
        self.options.validate()
    }

    /// MIME type of the file part: sniffed, then guessed from the name.
    pub fn mime_type(&self) -> &'static str {
        sniff_format(&self.image)
            .or_else(|| ImageFormat::from_path(&self.file_name).ok())
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream")
    }

    /// Build the `multipart/form-data` body.
    pub fn to_multipart(&self) -> MultipartBody {
        MultipartBody {
            file: FilePart {
                field: IMAGE_FIELD.to_string(),
                file_name: self.file_name.clone(),
                mime_type: self.mime_type().to_string(),
                bytes: self.image.clone(),
            },
            fields: self.options.form_fields(),
        }
    }
}

fn check_size(size: u64, max_bytes: u64) -> Result<(), FluxscaleError> {
    if size == 0 {
        return Err(FluxscaleError::EmptyImage);
    }
    if size > max_bytes {
        return Err(FluxscaleError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::signature::PNG_SIGNATURE;
    use tempfile::TempDir;

    fn png_bytes() -> Vec<u8> {
        let mut v = PNG_SIGNATURE.to_vec();
        v.extend_from_slice(&[0u8; 16]);
        v
    }

    #[test]
    fn async_modes_require_prompt() {
        for mode in [UpscaleMode::Conservative, UpscaleMode::Creative] {
            let err = UpscaleOptions::new(mode).validate().unwrap_err();
            assert!(matches!(err, FluxscaleError::PromptRequired { .. }));
            let err = UpscaleOptions::new(mode).prompt("   ").validate().unwrap_err();
            assert!(matches!(err, FluxscaleError::PromptRequired { .. }));
            assert!(UpscaleOptions::new(mode).prompt("cat").validate().is_ok());
        }
        assert!(UpscaleOptions::new(UpscaleMode::Fast).validate().is_ok());
    }

    #[test]
    fn only_set_fields_are_sent() {
        let fields = UpscaleOptions::new(UpscaleMode::Fast).form_fields();
        assert_eq!(fields, vec![("type".to_string(), "fast".to_string())]);

        let opts = UpscaleOptions::new(UpscaleMode::Creative)
            .prompt("a cat")
            .negative_prompt("blurry")
            .seed(42)
            .creativity(0.3)
            .output_format("WEBP")
            .style_preset("photographic");
        let req = UpscaleRequest::new(png_bytes(), opts);
        let body = req.to_multipart();
        assert_eq!(body.field("type"), Some("creative"));
        assert_eq!(body.field("prompt"), Some("a cat"));
        assert_eq!(body.field("negative_prompt"), Some("blurry"));
        assert_eq!(body.field("seed"), Some("42"));
        assert_eq!(body.field("creativity"), Some("0.30"));
        assert_eq!(body.field("output_format"), Some("webp"));
        assert_eq!(body.field("style_preset"), Some("photographic"));
        assert_eq!(body.file.field, "image");
        assert_eq!(body.file.mime_type, "image/png");
        assert_eq!(body.file.file_name, "image.png");
    }

    #[test]
    fn oversize_and_empty_images_rejected() {
        let req = UpscaleRequest::new(vec![0u8; 11], UpscaleOptions::default());
        assert!(matches!(
            req.validate(10),
            Err(FluxscaleError::TooLarge { size: 11, limit: 10 })
        ));
        let req = UpscaleRequest::new(Vec::new(), UpscaleOptions::default());
        assert!(matches!(req.validate(10), Err(FluxscaleError::EmptyImage)));
    }

    #[tokio::test]
    async fn from_path_checks_size_before_reading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.png");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let err = UpscaleRequest::from_path(&path, UpscaleOptions::default(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::TooLarge { size: 2048, .. }));
    }

    #[tokio::test]
    async fn from_path_reads_name_and_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("photo.PNG");
        std::fs::write(&path, png_bytes()).unwrap();
        let req = UpscaleRequest::from_path(&path, UpscaleOptions::default(), 1024)
            .await
            .unwrap();
        assert_eq!(req.file_name, "photo.PNG");
        assert_eq!(req.image, png_bytes());
    }

    #[tokio::test]
    async fn from_path_rejects_unsupported_extension() {
        let err = UpscaleRequest::from_path("notes.txt", UpscaleOptions::default(), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::UnsupportedImage { .. }));
    }
}
