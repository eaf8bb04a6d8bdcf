//! Upscale entry points.
//!
//! ```text
//! image ──▶ validate ──▶ POST multipart ──▶ classify ──▶ decode
//!                       (retry on 5xx)                   │
//!                           ┌────────────────────────────┤
//!                           ▼                            ▼
//!                     immediate image               job ticket ──▶ poll
//!                           │                                       │
//!                           └─────────────▶ normalize ◀─────────────┘
//! ```
//!
//! Exactly one of the immediate path or the polling path runs per request,
//! and every path ends in [`crate::pipeline::normalize`].

use crate::config::ClientConfig;
use crate::error::FluxscaleError;
use crate::output::{ImageLocation, MaterializedImage, UpscaleResult};
use crate::pipeline::decode::{self, DecodedResult};
use crate::pipeline::materialize;
use crate::pipeline::normalize;
use crate::pipeline::poll::JobPoller;
use crate::pipeline::request::{UpscaleOptions, UpscaleRequest};
use crate::pipeline::signature::classify;
use crate::transport::{
    ensure_success, hex_preview, send_with_retry, HttpTransport, OutgoingRequest,
    ReqwestTransport, RetryPolicy,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Client for the upscaling service.
///
/// Cheap to clone; clones share the underlying connection pool.
///
/// # Example
/// ```rust,no_run
/// use fluxscale::{ClientConfig, UpscaleClient, UpscaleOptions, UpscaleMode};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = UpscaleClient::new(ClientConfig::from_env())?;
/// let options = UpscaleOptions::new(UpscaleMode::Creative).prompt("a red fox");
/// let result = client.upscale_path("fox.png", options).await?;
/// let local = client.fetch_local(result).await?;
/// local.save_to("fox-4x.png").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UpscaleClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
}

impl UpscaleClient {
    /// Client backed by `reqwest` with the configured request timeout.
    pub fn new(config: ClientConfig) -> Result<Self, FluxscaleError> {
        let transport = ReqwestTransport::from_config(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Client over any transport, e.g. a scripted one in tests.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Upscale in-memory image bytes.
    pub async fn upscale(&self, request: UpscaleRequest) -> Result<UpscaleResult, FluxscaleError> {
        self.upscale_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Read `path` (size-checked before reading) and upscale it.
    pub async fn upscale_path(
        &self,
        path: impl AsRef<Path>,
        options: UpscaleOptions,
    ) -> Result<UpscaleResult, FluxscaleError> {
        let request =
            UpscaleRequest::from_path(path, options, self.config.max_upload_bytes).await?;
        self.upscale(request).await
    }

    /// Full upscale flow; `cancel` interrupts any in-flight request, backoff or poll.
    pub async fn upscale_with_cancel(
        &self,
        mut request: UpscaleRequest,
        cancel: &CancellationToken,
    ) -> Result<UpscaleResult, FluxscaleError> {
        let start = Instant::now();

        // ── Step 1: Validate locally ─────────────────────────────────────
        self.config.require_upscaler()?;
        request.validate(self.config.max_upload_bytes)?;
        if request.options.output_format.is_none() {
            request.options.output_format = Some(self.config.upscale_output_format.clone());
        }
        let mode = request.options.mode;
        info!(
            "Upscaling {} ({} bytes) in {} mode",
            request.file_name,
            request.image.len(),
            mode
        );

        // ── Step 2: Upload with retry on 5xx ─────────────────────────────
        let url = self.config.upscaler_url.as_str();
        let outgoing = OutgoingRequest::post_multipart(url, request.to_multipart())
            .with_upscaler_auth(&self.config)
            .header("Accept", "*/*");
        let policy = RetryPolicy::from_config(&self.config);
        let response = send_with_retry(self.transport.as_ref(), &outgoing, &policy, cancel).await?;
        let response = ensure_success(response, url)?;
        debug!(
            "Upscale response: {} bytes, content-type {:?}, first bytes: {}",
            response.body.len(),
            response.content_type(),
            hex_preview(&response.body)
        );

        // ── Step 3: Classify and decode ──────────────────────────────────
        let payload = classify(response.body)?;
        let decoded = decode::decode(payload, mode).await?;

        // ── Step 4: Immediate result or poll ─────────────────────────────
        let result = match decoded {
            DecodedResult::ImmediateImage { location, format } => {
                normalize::from_immediate(location, format)?
            }
            DecodedResult::JobTicket(job_id) => {
                info!("Upscale queued as job {}", job_id);
                let report = JobPoller::new(self.transport.as_ref(), &self.config)
                    .run(&job_id, cancel)
                    .await;
                normalize::from_poll_report(report, self.config.poll_timeout_secs)?
            }
        };

        info!(
            "Upscale finished in {}ms: {}",
            start.elapsed().as_millis(),
            result.location()
        );
        Ok(result)
    }

    /// Download the source image from `source_url`, then upscale it.
    ///
    /// Configuration and options are checked before the download starts.
    pub async fn upscale_from_url(
        &self,
        source_url: &str,
        options: UpscaleOptions,
        cancel: &CancellationToken,
    ) -> Result<UpscaleResult, FluxscaleError> {
        self.config.require_upscaler()?;
        options.validate()?;

        let source = materialize::download(self.transport.as_ref(), source_url, cancel).await?;
        let image = source.read().await?;
        drop(source);

        let mut request = UpscaleRequest::new(image, options);
        if let Some(name) = file_name_from_url(source_url) {
            request = request.with_file_name(name);
        }
        self.upscale_with_cancel(request, cancel).await
    }

    /// Make sure the result is on local disk, downloading a remote location.
    pub async fn fetch_local(
        &self,
        result: UpscaleResult,
    ) -> Result<MaterializedImage, FluxscaleError> {
        self.fetch_local_with_cancel(result, &CancellationToken::new())
            .await
    }

    pub async fn fetch_local_with_cancel(
        &self,
        result: UpscaleResult,
        cancel: &CancellationToken,
    ) -> Result<MaterializedImage, FluxscaleError> {
        match result.into_location() {
            ImageLocation::Local(image) => Ok(image),
            ImageLocation::Remote(url) => {
                materialize::download(self.transport.as_ref(), &url, cancel).await
            }
        }
    }
}

/// Last path segment of `url` when it names a supported image file.
fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    materialize::is_supported_image_path(name).then(|| name.to_string())
}

impl std::fmt::Debug for UpscaleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpscaleClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpscaleMode;
    use crate::transport::RawResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for CountingTransport {
        async fn send(&self, _r: &OutgoingRequest) -> Result<RawResponse, FluxscaleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawResponse::new(200, r#"{"url":"http://x/a.png"}"#))
        }
    }

    fn client(key: &str) -> (UpscaleClient, Arc<CountingTransport>) {
        let t = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
        });
        let config = ClientConfig::builder()
            .upscaler_api_key(key)
            .max_upload_bytes(1024)
            .build()
            .unwrap();
        (UpscaleClient::with_transport(config, t.clone()), t)
    }

    #[tokio::test]
    async fn missing_credentials_never_reach_the_wire() {
        let (c, t) = client("");
        let err = c
            .upscale(UpscaleRequest::new(vec![1, 2, 3], UpscaleOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::MissingCredentials));
        assert_eq!(t.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validation_failures_never_reach_the_wire() {
        let (c, t) = client("sk-test");
        let err = c
            .upscale(UpscaleRequest::new(vec![0; 2048], UpscaleOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::TooLarge { .. }));

        let err = c
            .upscale(UpscaleRequest::new(
                vec![1],
                UpscaleOptions::new(UpscaleMode::Creative),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::PromptRequired { .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn source_file_name_from_url() {
        assert_eq!(
            file_name_from_url("https://cdn/x/photo.jpg?sig=abc"),
            Some("photo.jpg".to_string())
        );
        assert_eq!(file_name_from_url("https://cdn/x/render"), None);
    }

    #[tokio::test]
    async fn direct_url_is_returned_as_remote() {
        let (c, t) = client("sk-test");
        let result = c
            .upscale(UpscaleRequest::new(vec![1], UpscaleOptions::default()))
            .await
            .unwrap();
        assert!(result.is_completed());
        assert_eq!(result.location().remote_url(), Some("http://x/a.png"));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }
}
