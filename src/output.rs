//! Result types handed to callers.
//!
//! [`UpscaleResult`] is the single canonical shape produced by every decode
//! path. Its fields are private: the only constructors live in
//! [`crate::pipeline::normalize`], which refuses to build a completed result
//! without a usable location.
//!
//! Local images are owned through [`MaterializedImage`], which deletes its
//! temporary file on drop. Whoever holds the value last (usually the caller,
//! after displaying or saving it) is the one that cleans up, on every exit
//! path including panics.

use crate::error::FluxscaleError;
use crate::pipeline::materialize;
use image::ImageFormat;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Image bytes written to a temporary file owned by this value.
pub struct MaterializedImage {
    path: TempPath,
    format: ImageFormat,
    len: u64,
}

impl MaterializedImage {
    pub(crate) fn new(path: TempPath, format: ImageFormat, len: u64) -> Self {
        Self { path, format, len }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the image back into memory.
    pub async fn read(&self) -> Result<Vec<u8>, FluxscaleError> {
        tokio::fs::read(self.path())
            .await
            .map_err(|e| FluxscaleError::io(self.path(), e))
    }

    /// Copy the image to `dest` atomically; the temporary file stays owned by `self`.
    ///
    /// A destination without a known image extension gets `.png` appended.
    /// Returns the final path.
    pub async fn save_to(&self, dest: impl AsRef<Path>) -> Result<PathBuf, FluxscaleError> {
        let bytes = self.read().await?;
        materialize::save_bytes_atomic(bytes, dest.as_ref()).await
    }

    /// Stop managing the file and return its path; it will no longer be deleted.
    pub fn keep(self) -> Result<PathBuf, FluxscaleError> {
        let path = self.path.to_path_buf();
        self.path
            .keep()
            .map_err(|e| FluxscaleError::io(path, e.error))
    }
}

impl fmt::Debug for MaterializedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedImage")
            .field("path", &self.path())
            .field("format", &self.format)
            .field("len", &self.len)
            .finish()
    }
}

/// Where the finished image can be fetched from.
#[derive(Debug)]
pub enum ImageLocation {
    /// Bytes already on local disk.
    Local(MaterializedImage),
    /// Absolute `http(s)` URL served by the upscaler.
    Remote(String),
}

impl ImageLocation {
    pub fn is_local(&self) -> bool {
        matches!(self, ImageLocation::Local(_))
    }

    /// True when there is nothing to fetch.
    pub fn is_empty(&self) -> bool {
        match self {
            ImageLocation::Local(img) => img.path().as_os_str().is_empty(),
            ImageLocation::Remote(url) => url.trim().is_empty(),
        }
    }

    pub fn remote_url(&self) -> Option<&str> {
        match self {
            ImageLocation::Remote(url) => Some(url),
            ImageLocation::Local(_) => None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ImageLocation::Local(img) => Some(img.path()),
            ImageLocation::Remote(_) => None,
        }
    }
}

impl fmt::Display for ImageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageLocation::Local(img) => write!(f, "{}", img.path().display()),
            ImageLocation::Remote(url) => f.write_str(url),
        }
    }
}

/// Canonical outcome of one upscale operation.
#[derive(Debug)]
pub struct UpscaleResult {
    location: ImageLocation,
    format: ImageFormat,
    job_id: Option<String>,
    completed: bool,
}

impl UpscaleResult {
    /// Only [`crate::pipeline::normalize`] builds results.
    pub(crate) fn completed(
        location: ImageLocation,
        format: ImageFormat,
        job_id: Option<String>,
    ) -> Self {
        Self {
            location,
            format,
            job_id,
            completed: true,
        }
    }

    pub fn location(&self) -> &ImageLocation {
        &self.location
    }

    pub fn into_location(self) -> ImageLocation {
        self.location
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Image format (declared by signature, URL extension, or PNG by default).
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Job that produced the image, when it went through polling.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }
}

/// URLs returned by the generation endpoint for one prompt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GeneratedImages {
    pub prompt: String,
    pub urls: Vec<String>,
}

/// File extension (without dot) conventionally used for `format`.
pub fn extension_for(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("png")
}
