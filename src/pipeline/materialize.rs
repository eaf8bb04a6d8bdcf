//! Moving image bytes between memory, temporary files and their final home.
//!
//! Every file written here goes through `tempfile`: results live in a
//! self-deleting [`MaterializedImage`], and saves are written next to the
//! destination and renamed into place so a crash never leaves a half-written
//! image at the user's chosen path.

use crate::error::{body_context, FluxscaleError};
use crate::output::{extension_for, MaterializedImage};
use crate::pipeline::signature::{classify, ClassifiedPayload};
use crate::transport::{ensure_success, HttpTransport, OutgoingRequest};
use image::ImageFormat;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Extensions accepted as upscaler input.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

/// True when `path` ends with a supported image extension (case-insensitive).
pub fn is_supported_image_path(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Append `.png` unless `path` already has a supported image extension.
pub fn with_image_extension(path: &Path) -> PathBuf {
    if is_supported_image_path(path) {
        path.to_path_buf()
    } else {
        let mut s = path.as_os_str().to_owned();
        s.push(".png");
        PathBuf::from(s)
    }
}

/// Write `bytes` to a new self-deleting temp file named `upscaled-*.{ext}`.
pub async fn materialize_bytes(
    bytes: Vec<u8>,
    format: ImageFormat,
) -> Result<MaterializedImage, FluxscaleError> {
    let suffix = format!(".{}", extension_for(format));
    let len = bytes.len() as u64;

    let path = tokio::task::spawn_blocking(move || -> Result<tempfile::TempPath, FluxscaleError> {
        let mut file = tempfile::Builder::new()
            .prefix("upscaled-")
            .suffix(&suffix)
            .tempfile()
            .map_err(|e| FluxscaleError::io(std::env::temp_dir(), e))?;
        file.write_all(&bytes)
            .and_then(|_| file.flush())
            .map_err(|e| FluxscaleError::io(file.path(), e))?;
        Ok(file.into_temp_path())
    })
    .await
    .map_err(|e| FluxscaleError::Internal(format!("materialize task: {e}")))??;

    info!("Image stored at {} ({} bytes)", path.display(), len);
    Ok(MaterializedImage::new(path, format, len))
}

/// Download an image with a single GET and keep it in a temp file.
///
/// The body goes through the signature classifier; a JSON body is rejected.
pub async fn download(
    transport: &dyn HttpTransport,
    url: &str,
    cancel: &CancellationToken,
) -> Result<MaterializedImage, FluxscaleError> {
    debug!("Downloading image from {}", url);
    let request = OutgoingRequest::get(url);
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(FluxscaleError::Cancelled),
        r = transport.send(&request) => r?,
    };
    let response = ensure_success(response, url)?;

    match classify(response.body)? {
        ClassifiedPayload::BinaryImage { bytes, format } => materialize_bytes(bytes, format).await,
        ClassifiedPayload::Json(body) => Err(FluxscaleError::MalformedPayload {
            layer: "downloaded image",
            detail: format!("expected image bytes from '{url}', got JSON"),
            body: body_context(&body),
        }),
    }
}

/// Write `bytes` to `dest` via a sibling temp file and an atomic rename.
///
/// Parent directories are created. Returns the final path (see
/// [`with_image_extension`]).
pub async fn save_bytes_atomic(bytes: Vec<u8>, dest: &Path) -> Result<PathBuf, FluxscaleError> {
    let dest = with_image_extension(dest);
    let target = dest.clone();

    tokio::task::spawn_blocking(move || -> Result<(), FluxscaleError> {
        let parent = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| FluxscaleError::io(&parent, e))?;

        let mut tmp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| FluxscaleError::io(&parent, e))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.flush())
            .map_err(|e| FluxscaleError::io(tmp.path(), e))?;
        tmp.persist(&target)
            .map_err(|e| FluxscaleError::io(&target, e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| FluxscaleError::Internal(format!("save task: {e}")))??;

    info!("Image saved to {}", dest.display());
    Ok(dest)
}
