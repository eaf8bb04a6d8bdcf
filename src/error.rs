//! Error types for the fluxscale library.
//!
//! Every failure surfaces as a single [`FluxscaleError`]. The variants are
//! grouped by how a caller should react to them, and [`FluxscaleError::kind`]
//! collapses them into an [`ErrorKind`] for presentation code that only needs
//! the coarse category:
//!
//! * **Configuration**: endpoint or credentials missing. Fatal, never retried.
//! * **Validation**: the request is unusable (empty prompt, oversize image).
//!   Detected locally; nothing is sent over the wire.
//! * **Transport**: network failure or non-2xx status. 5xx responses have
//!   already been retried by the time one of these reaches the caller.
//! * **Decode**: the response shape was not recognised. The raw body is kept
//!   (truncated) so the failure can be diagnosed.
//! * **PollTimeout / JobFailed**: terminal states of an asynchronous job.
//!
//! Transient conditions (a 5xx, a single failed poll tick) are recovered
//! inside the engine and never show up here.

use std::path::PathBuf;
use thiserror::Error;

/// Longest slice of a response body kept inside an error value.
pub const MAX_BODY_CONTEXT: usize = 2048;

/// All errors returned by the fluxscale library.
#[derive(Debug, Error)]
pub enum FluxscaleError {
    // ── Configuration errors ─────────────────────────────────────────────
    /// A required service endpoint was not configured.
    #[error("{service} endpoint is not configured.\nSet {env_var} in your environment or .env file.")]
    MissingEndpoint {
        service: &'static str,
        env_var: &'static str,
    },

    /// The upscaler API key is missing.
    #[error("Upscaler credentials are not configured.\nSet UPSCALER_API_KEY (and UPSCALER_APP_ID) in your environment or .env file.")]
    MissingCredentials,

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Validation errors ────────────────────────────────────────────────
    /// Generation prompt was empty.
    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    /// Conservative and creative upscaling need a prompt to guide them.
    #[error("A prompt is required for {mode} upscaling")]
    PromptRequired { mode: crate::config::UpscaleMode },

    /// The source image has no bytes.
    #[error("Source image is empty")]
    EmptyImage,

    /// The source image exceeds the client-side upload ceiling.
    #[error("Image is too large ({size} bytes). Maximum size is {limit} bytes.\nResize the image before upscaling.")]
    TooLarge { size: u64, limit: u64 },

    /// File extension is not one of the supported image formats.
    #[error("Not a supported image format: '{path}' (expected png, jpg, jpeg or webp)")]
    UnsupportedImage { path: PathBuf },

    // ── Transport errors ─────────────────────────────────────────────────
    /// The request never produced a response.
    #[error("Request to '{url}' failed: {reason}")]
    Network { url: String, reason: String },

    /// The request exceeded the per-request timeout.
    #[error("Request to '{url}' timed out after {secs}s")]
    RequestTimeout { url: String, secs: u64 },

    /// The service answered with a non-success status.
    #[error("API returned error status {status} for '{url}': {body}")]
    HttpStatus { status: u16, url: String, body: String },

    /// HTTP 502 after every retry; the service is overloaded or down.
    #[error("Service temporarily unavailable (502 Bad Gateway) at '{url}'.\nThe upscaler might be down or overloaded. Please try again later.")]
    ServiceUnavailable { url: String },

    // ── Decode errors ────────────────────────────────────────────────────
    /// The response body had zero bytes.
    #[error("Response body is empty")]
    EmptyBody,

    /// None of the known response shapes matched.
    #[error("No usable result in response: {body}")]
    NoUsableResult { body: String },

    /// One layer of an envelope failed to parse.
    #[error("Malformed {layer}: {detail}\nBody: {body}")]
    MalformedPayload {
        layer: &'static str,
        detail: String,
        body: String,
    },

    // ── Job errors ───────────────────────────────────────────────────────
    /// The job did not reach a terminal state within the poll ceiling.
    #[error("Upscale job '{job_id}' did not finish within {secs}s.\nThe service may still be working on it; try again later.")]
    PollTimeout { job_id: String, secs: u64 },

    /// The service reported the job as failed.
    #[error("Upscale job '{job_id}' failed: {message}")]
    JobFailed { job_id: String, message: String },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    // ── I/O errors ───────────────────────────────────────────────────────
    /// Reading or writing a local file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Transport,
    Decode,
    PollTimeout,
    JobFailed,
    Cancelled,
    Internal,
}

impl FluxscaleError {
    pub fn kind(&self) -> ErrorKind {
        use FluxscaleError::*;
        match self {
            MissingEndpoint { .. } | MissingCredentials | InvalidConfig(_) => {
                ErrorKind::Configuration
            }
            EmptyPrompt | PromptRequired { .. } | EmptyImage | TooLarge { .. }
            | UnsupportedImage { .. } => ErrorKind::Validation,
            Network { .. } | RequestTimeout { .. } | HttpStatus { .. }
            | ServiceUnavailable { .. } => ErrorKind::Transport,
            EmptyBody | NoUsableResult { .. } | MalformedPayload { .. } => ErrorKind::Decode,
            PollTimeout { .. } => ErrorKind::PollTimeout,
            JobFailed { .. } => ErrorKind::JobFailed,
            Cancelled => ErrorKind::Cancelled,
            Io { .. } | Internal(_) => ErrorKind::Internal,
        }
    }

    /// Build a [`FluxscaleError::Io`] for `path`.
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FluxscaleError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(layer: &'static str, detail: impl ToString, body: &[u8]) -> Self {
        FluxscaleError::MalformedPayload {
            layer,
            detail: detail.to_string(),
            body: body_context(body),
        }
    }
}

/// Lossy, truncated rendering of a response body for error messages.
pub fn body_context(body: &[u8]) -> String {
    if body.len() <= MAX_BODY_CONTEXT {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format!(
            "{}… ({} bytes total)",
            String::from_utf8_lossy(&body[..MAX_BODY_CONTEXT]),
            body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpscaleMode;

    #[test]
    fn prompt_required_names_mode() {
        let e = FluxscaleError::PromptRequired {
            mode: UpscaleMode::Creative,
        };
        assert!(e.to_string().contains("creative"), "got: {e}");
        assert_eq!(e.kind(), ErrorKind::Validation);
    }

    #[test]
    fn too_large_display() {
        let e = FluxscaleError::TooLarge {
            size: 6_000_000,
            limit: 5_242_880,
        };
        let msg = e.to_string();
        assert!(msg.contains("6000000"));
        assert!(msg.contains("5242880"));
    }

    #[test]
    fn service_unavailable_is_transport() {
        let e = FluxscaleError::ServiceUnavailable {
            url: "http://x/api/v1/upscale".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Transport);
        assert!(e.to_string().contains("502"));
    }

    #[test]
    fn poll_timeout_has_its_own_kind() {
        let e = FluxscaleError::PollTimeout {
            job_id: "job-1".into(),
            secs: 300,
        };
        assert_eq!(e.kind(), ErrorKind::PollTimeout);
        assert!(e.to_string().contains("try again later"));
    }

    #[test]
    fn body_context_truncates_long_bodies() {
        let body = vec![b'a'; MAX_BODY_CONTEXT + 10];
        let ctx = body_context(&body);
        assert!(ctx.ends_with(&format!("({} bytes total)", MAX_BODY_CONTEXT + 10)));
        assert_eq!(body_context(b"{\"x\":1}"), "{\"x\":1}");
    }
}
