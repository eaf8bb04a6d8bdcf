//! Image generation client.
//!
//! One POST per prompt, no retry. The service answers with a JSON array of
//! image URLs; [`GenerationClient::download_all`] fetches them to disk.

use crate::config::{ClientConfig, SUPPORTED_ASPECT_RATIOS};
use crate::error::{body_context, FluxscaleError};
use crate::output::{extension_for, GeneratedImages};
use crate::pipeline::decode::is_http_url;
use crate::pipeline::materialize;
use crate::transport::{
    send_with_retry, HttpTransport, OutgoingRequest, ReqwestTransport, RetryPolicy,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call generation settings. Defaults come from [`ClientConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateOptions {
    pub num_outputs: u32,
    pub aspect_ratio: String,
    pub output_format: String,
    pub output_quality: u32,
    pub disable_safety_checker: bool,
    pub seed: Option<i64>,
}

impl GenerateOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            num_outputs: config.num_outputs,
            aspect_ratio: config.aspect_ratio.clone(),
            output_format: config.output_format.clone(),
            output_quality: config.output_quality,
            disable_safety_checker: config.disable_safety_checker,
            seed: None,
        }
    }
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

#[derive(Debug, Serialize)]
struct GenerationInput<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    num_outputs: u32,
    aspect_ratio: &'a str,
    output_format: &'a str,
    output_quality: u32,
    disable_safety_checker: bool,
}

#[derive(Debug, Serialize)]
struct GenerationBody<'a> {
    input: GenerationInput<'a>,
}

/// Client for the text-to-image endpoint.
#[derive(Clone)]
pub struct GenerationClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn HttpTransport>,
}

impl GenerationClient {
    pub fn new(config: ClientConfig) -> Result<Self, FluxscaleError> {
        let transport = ReqwestTransport::from_config(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Generate with the configured defaults.
    pub async fn generate(&self, prompt: &str) -> Result<GeneratedImages, FluxscaleError> {
        let options = GenerateOptions::from_config(&self.config);
        self.generate_with_options(prompt, &options, &CancellationToken::new())
            .await
    }

    /// Generate images for `prompt`.
    ///
    /// Fails with [`FluxscaleError::EmptyPrompt`] before any I/O when the
    /// prompt is blank. Only HTTP 200 counts as success.
    pub async fn generate_with_options(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<GeneratedImages, FluxscaleError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(FluxscaleError::EmptyPrompt);
        }
        let url = self.config.require_generation_url()?;
        if !SUPPORTED_ASPECT_RATIOS.contains(&options.aspect_ratio.as_str()) {
            warn!(
                "Aspect ratio {} is not one of {:?}; sending it anyway",
                options.aspect_ratio, SUPPORTED_ASPECT_RATIOS
            );
        }

        let body = GenerationBody {
            input: GenerationInput {
                prompt,
                seed: options.seed,
                num_outputs: options.num_outputs,
                aspect_ratio: &options.aspect_ratio,
                output_format: &options.output_format,
                output_quality: options.output_quality,
                disable_safety_checker: options.disable_safety_checker,
            },
        };
        let json = serde_json::to_value(&body)
            .map_err(|e| FluxscaleError::Internal(format!("serialize generation body: {e}")))?;
        info!(
            "Generating {} image(s), aspect {}",
            options.num_outputs, options.aspect_ratio
        );

        let request = OutgoingRequest::post_json(url, json);
        let response =
            send_with_retry(self.transport.as_ref(), &request, &RetryPolicy::none(), cancel)
                .await?;

        if response.status == StatusCode::BAD_GATEWAY {
            return Err(FluxscaleError::ServiceUnavailable {
                url: url.to_string(),
            });
        }
        if response.status != StatusCode::OK {
            return Err(FluxscaleError::HttpStatus {
                status: response.status.as_u16(),
                url: url.to_string(),
                body: body_context(&response.body),
            });
        }

        let urls = parse_url_list(&response.body)?;
        info!("Generated {} image(s)", urls.len());
        Ok(GeneratedImages {
            prompt: prompt.to_string(),
            urls,
        })
    }

    /// Save every URL into `dir`, at most `concurrency` downloads at a time.
    ///
    /// Files are named `image_<n>.<ext>` in input order. The first failure
    /// aborts the remaining downloads.
    pub async fn download_all(
        &self,
        urls: &[String],
        dir: impl AsRef<Path>,
        concurrency: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, FluxscaleError> {
        let dir = dir.as_ref();
        let transport = self.transport.as_ref();
        debug!(
            "Downloading {} image(s) into {} ({} at a time)",
            urls.len(),
            dir.display(),
            concurrency.max(1)
        );

        stream::iter(urls.iter().enumerate())
            .map(|(i, url)| async move {
                let image = materialize::download(transport, url, cancel).await?;
                let dest = dir.join(format!("image_{}.{}", i + 1, extension_for(image.format())));
                image.save_to(&dest).await
            })
            .buffered(concurrency.max(1))
            .try_collect()
            .await
    }
}

impl std::fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Parse the `["https://…", …]` success body.
fn parse_url_list(body: &[u8]) -> Result<Vec<String>, FluxscaleError> {
    let urls: Vec<String> = serde_json::from_slice(body)
        .map_err(|e| FluxscaleError::malformed("generation response", e, body))?;
    let urls: Vec<String> = urls
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| is_http_url(u))
        .collect();
    if urls.is_empty() {
        return Err(FluxscaleError::NoUsableResult {
            body: body_context(body),
        });
    }
    Ok(urls)
}
