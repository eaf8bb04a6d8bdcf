//! Configuration for the generation and upscaling clients.
//!
//! Everything the engine reads at runtime lives in [`ClientConfig`]: endpoints,
//! credentials, timeouts and limits. The config is immutable once built and
//! cheap to clone, so every concurrent request gets its own copy and no state
//! is shared between them.
//!
//! Values come from three layers, later layers overriding earlier ones:
//!
//! 1. Built-in defaults ([`ClientConfig::default`]).
//! 2. Environment variables, optionally seeded from a `.env` file
//!    ([`load_dotenv`], [`ClientConfig::from_env`]).
//! 3. Explicit builder calls (CLI flags).

use crate::error::FluxscaleError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, warn};

/// Upscaler endpoint used when `UPSCALER_API_URL` is not set.
pub const DEFAULT_UPSCALER_URL: &str = "https://stability-go.fly.dev/api/v1/upscale";

/// Aspect ratios accepted by the generation endpoint.
pub const SUPPORTED_ASPECT_RATIOS: &[&str] = &["1:1", "4:3", "3:4", "16:9", "9:16"];

/// Output formats accepted by the upscaler.
pub const SUPPORTED_OUTPUT_FORMATS: &[&str] = &["png", "jpeg", "webp"];

/// Configuration shared (read-only) by every request.
///
/// Built via [`ClientConfig::builder()`], [`ClientConfig::from_env()`] or
/// [`ClientConfig::default()`].
///
/// # Example
/// ```rust
/// use fluxscale::{ClientConfig, UpscaleMode};
///
/// let config = ClientConfig::builder()
///     .upscaler_api_key("sk-test")
///     .default_mode(UpscaleMode::Creative)
///     .poll_timeout_secs(120)
///     .build()
///     .unwrap();
/// assert!(config.is_upscaler_configured());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    // ── Generation ───────────────────────────────────────────────────────
    /// Generation endpoint (`FLUX_API_URL`). Required for generation.
    pub generation_url: Option<String>,

    /// Images requested per prompt. Default: 4.
    pub num_outputs: u32,

    /// Default aspect ratio. Default: "1:1".
    pub aspect_ratio: String,

    /// Default generation output format. Default: "png".
    pub output_format: String,

    /// Default generation output quality. Default: 1.
    pub output_quality: u32,

    /// Ask the service to skip its safety checker. Default: true.
    pub disable_safety_checker: bool,

    // ── Upscaling ────────────────────────────────────────────────────────
    /// Full upscale endpoint URL. Default: [`DEFAULT_UPSCALER_URL`].
    pub upscaler_url: String,

    /// Bearer token for the upscaler.
    pub upscaler_api_key: String,

    /// Value of the `X-App-ID` header.
    pub upscaler_app_id: String,

    /// Mode used when a caller does not pick one. Default: fast.
    pub default_mode: UpscaleMode,

    /// Upscaler output format used when a request does not set one. Default: "png".
    pub upscale_output_format: String,

    // ── Limits & timers ──────────────────────────────────────────────────
    /// Per-request HTTP timeout in seconds. Default: 30.
    pub request_timeout_secs: u64,

    /// Delay between two job status requests, in milliseconds. Default: 2000.
    pub poll_interval_ms: u64,

    /// Wall-clock ceiling for one polling loop, in seconds. Default: 300.
    pub poll_timeout_secs: u64,

    /// Largest source image accepted for upload, in bytes. Default: 5 MiB.
    pub max_upload_bytes: u64,

    /// Total attempts for an upload answered with 5xx. Default: 3.
    pub max_attempts: u32,

    /// Linear backoff step in milliseconds; attempt `n` waits `n × step`. Default: 1000.
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            generation_url: None,
            num_outputs: 4,
            aspect_ratio: "1:1".to_string(),
            output_format: "png".to_string(),
            output_quality: 1,
            disable_safety_checker: true,
            upscaler_url: DEFAULT_UPSCALER_URL.to_string(),
            upscaler_api_key: String::new(),
            upscaler_app_id: String::new(),
            default_mode: UpscaleMode::Fast,
            upscale_output_format: "png".to_string(),
            request_timeout_secs: 30,
            poll_interval_ms: 2000,
            poll_timeout_secs: 300,
            max_upload_bytes: 5 * 1024 * 1024,
            max_attempts: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("generation_url", &self.generation_url)
            .field("num_outputs", &self.num_outputs)
            .field("aspect_ratio", &self.aspect_ratio)
            .field("output_format", &self.output_format)
            .field("upscaler_url", &self.upscaler_url)
            .field("upscaler_api_key", &redact(&self.upscaler_api_key))
            .field("upscaler_app_id", &self.upscaler_app_id)
            .field("default_mode", &self.default_mode)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Show at most the first five characters of a secret.
pub(crate) fn redact(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let prefix: String = secret.chars().take(5).collect();
    format!("{prefix}...")
}

impl ClientConfig {
    /// Create a new builder for `ClientConfig`.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known variable.
    ///
    /// Unparseable numeric values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        cfg.generation_url = get("FLUX_API_URL");
        if let Some(n) = parse_positive(&get, "FLUX_NUM_OUTPUTS") {
            cfg.num_outputs = n as u32;
        }
        if let Some(v) = get("FLUX_ASPECT_RATIO") {
            cfg.aspect_ratio = v;
        }
        if let Some(v) = get("FLUX_FORMAT") {
            cfg.output_format = v.to_lowercase();
        }
        if let Some(q) = parse_positive(&get, "FLUX_QUALITY") {
            cfg.output_quality = q as u32;
        }
        if let Some(v) = get("FLUX_DISABLE_SAFETY") {
            cfg.disable_safety_checker = matches!(v.as_str(), "true" | "1" | "yes");
        }

        if let Some(v) = get("UPSCALER_API_URL") {
            cfg.upscaler_url = v;
        }
        if let Some(v) = get("UPSCALER_API_KEY") {
            cfg.upscaler_api_key = v;
        }
        if let Some(v) = get("UPSCALER_APP_ID") {
            cfg.upscaler_app_id = v;
        }
        if let Some(v) = get("UPSCALER_TYPE") {
            match v.parse::<UpscaleMode>() {
                Ok(mode) => cfg.default_mode = mode,
                Err(e) => warn!("Ignoring UPSCALER_TYPE: {}", e),
            }
        }
        if let Some(v) = parse_positive(&get, "UPSCALER_TIMEOUT_SECS") {
            cfg.request_timeout_secs = v;
        }
        if let Some(v) = parse_positive(&get, "UPSCALER_POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = v;
        }
        if let Some(v) = parse_positive(&get, "UPSCALER_POLL_TIMEOUT_SECS") {
            cfg.poll_timeout_secs = v;
        }
        if let Some(v) = parse_positive(&get, "UPSCALER_MAX_UPLOAD_BYTES") {
            cfg.max_upload_bytes = v;
        }

        debug!("Loaded config: {:?}", cfg);
        cfg
    }

    /// True when both the upscaler URL and API key are set.
    pub fn is_upscaler_configured(&self) -> bool {
        !self.upscaler_url.trim().is_empty() && !self.upscaler_api_key.trim().is_empty()
    }

    /// Fail with a configuration error unless the upscaler can be called.
    pub fn require_upscaler(&self) -> Result<(), FluxscaleError> {
        if self.upscaler_url.trim().is_empty() {
            return Err(FluxscaleError::MissingEndpoint {
                service: "Upscaler",
                env_var: "UPSCALER_API_URL",
            });
        }
        if self.upscaler_api_key.trim().is_empty() {
            return Err(FluxscaleError::MissingCredentials);
        }
        Ok(())
    }

    /// The generation endpoint, or a configuration error.
    pub fn require_generation_url(&self) -> Result<&str, FluxscaleError> {
        self.generation_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(FluxscaleError::MissingEndpoint {
                service: "Generation",
                env_var: "FLUX_API_URL",
            })
    }
}

fn parse_positive<G>(get: &G, key: &str) -> Option<u64>
where
    G: Fn(&str) -> Option<String>,
{
    let raw = get(key)?;
    match raw.parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!("Ignoring {}={:?}: expected a positive integer", key, raw);
            None
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Start from an existing config (e.g. one loaded from the environment).
    pub fn from_config(config: ClientConfig) -> Self {
        Self { config }
    }

    pub fn generation_url(mut self, url: impl Into<String>) -> Self {
        self.config.generation_url = Some(url.into());
        self
    }

    pub fn num_outputs(mut self, n: u32) -> Self {
        self.config.num_outputs = n.max(1);
        self
    }

    pub fn aspect_ratio(mut self, ratio: impl Into<String>) -> Self {
        self.config.aspect_ratio = ratio.into();
        self
    }

    pub fn output_format(mut self, format: impl Into<String>) -> Self {
        self.config.output_format = format.into().to_lowercase();
        self
    }

    pub fn output_quality(mut self, quality: u32) -> Self {
        self.config.output_quality = quality;
        self
    }

    pub fn disable_safety_checker(mut self, v: bool) -> Self {
        self.config.disable_safety_checker = v;
        self
    }

    pub fn upscaler_url(mut self, url: impl Into<String>) -> Self {
        self.config.upscaler_url = url.into();
        self
    }

    pub fn upscaler_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.upscaler_api_key = key.into();
        self
    }

    pub fn upscaler_app_id(mut self, id: impl Into<String>) -> Self {
        self.config.upscaler_app_id = id.into();
        self
    }

    pub fn default_mode(mut self, mode: UpscaleMode) -> Self {
        self.config.default_mode = mode;
        self
    }

    pub fn upscale_output_format(mut self, format: impl Into<String>) -> Self {
        self.config.upscale_output_format = format.into().to_lowercase();
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_timeout_secs(mut self, secs: u64) -> Self {
        self.config.poll_timeout_secs = secs;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: u64) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ClientConfig, FluxscaleError> {
        let c = &self.config;
        if c.request_timeout_secs == 0 {
            return Err(FluxscaleError::InvalidConfig(
                "Request timeout must be ≥ 1s".into(),
            ));
        }
        if c.poll_interval_ms == 0 {
            return Err(FluxscaleError::InvalidConfig(
                "Poll interval must be ≥ 1ms".into(),
            ));
        }
        if c.poll_interval_ms > c.poll_timeout_secs.saturating_mul(1000) {
            return Err(FluxscaleError::InvalidConfig(format!(
                "Poll interval ({}ms) exceeds poll timeout ({}s)",
                c.poll_interval_ms, c.poll_timeout_secs
            )));
        }
        if c.max_attempts == 0 {
            return Err(FluxscaleError::InvalidConfig(
                "Max attempts must be ≥ 1".into(),
            ));
        }
        if c.max_upload_bytes == 0 {
            return Err(FluxscaleError::InvalidConfig(
                "Max upload size must be > 0".into(),
            ));
        }
        if !SUPPORTED_OUTPUT_FORMATS.contains(&c.upscale_output_format.as_str()) {
            return Err(FluxscaleError::InvalidConfig(format!(
                "Unsupported upscale output format '{}' (expected one of {})",
                c.upscale_output_format,
                SUPPORTED_OUTPUT_FORMATS.join(", ")
            )));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Upscaling method offered by the service.
///
/// | Mode | Prompt | Response |
/// |------|--------|----------|
/// | `fast` | ignored | usually an immediate image |
/// | `conservative` | required | job ticket, polled |
/// | `creative` | required | job ticket, polled |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscaleMode {
    #[default]
    Fast,
    Conservative,
    Creative,
}

impl UpscaleMode {
    pub const ALL: [UpscaleMode; 3] = [
        UpscaleMode::Fast,
        UpscaleMode::Conservative,
        UpscaleMode::Creative,
    ];

    /// Wire value of the `type` form field.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpscaleMode::Fast => "fast",
            UpscaleMode::Conservative => "conservative",
            UpscaleMode::Creative => "creative",
        }
    }

    /// Conservative and creative modes need a prompt and run asynchronously.
    pub fn requires_prompt(&self) -> bool {
        matches!(self, UpscaleMode::Conservative | UpscaleMode::Creative)
    }
}

impl fmt::Display for UpscaleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpscaleMode {
    type Err = FluxscaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(UpscaleMode::Fast),
            "conservative" => Ok(UpscaleMode::Conservative),
            "creative" => Ok(UpscaleMode::Creative),
            other => Err(FluxscaleError::InvalidConfig(format!(
                "Unknown upscale mode '{other}' (expected fast, conservative or creative)"
            ))),
        }
    }
}

// ── .env discovery ───────────────────────────────────────────────────────

/// Candidate `.env` locations, in search order.
pub fn dotenv_candidates() -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from(".env")];
    let home = dirs::home_dir();
    if let Some(ref home) = home {
        out.push(home.join(".fluxscale").join(".env"));
    }
    let xdg = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| !p.as_os_str().is_empty())
        .or_else(|| home.as_ref().map(|h| h.join(".config")));
    if let Some(xdg) = xdg {
        out.push(xdg.join("fluxscale").join(".env"));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            out.push(dir.join(".env"));
        }
    }
    out
}

/// Load the first `.env` file found among [`dotenv_candidates`].
///
/// Existing environment variables are never overwritten. Returns the path that
/// was loaded, or `None` when no file was found.
pub fn load_dotenv() -> Option<PathBuf> {
    for path in dotenv_candidates() {
        if !path.is_file() {
            continue;
        }
        match dotenvy::from_path(&path) {
            Ok(()) => {
                debug!("Loaded environment from {}", path.display());
                return Some(path);
            }
            Err(e) => warn!("Failed to load {}: {}", path.display(), e),
        }
    }
    warn!("No .env file found; using process environment only");
    None
}
