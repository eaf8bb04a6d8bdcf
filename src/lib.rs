//! # fluxscale
//!
//! Text-to-image generation and image upscaling against remote HTTP services.
//!
//! ## Why this crate?
//!
//! The upscaling service answers the same request in several incompatible
//! ways: raw PNG/JPEG bytes (sometimes labelled `application/json`), a JSON
//! object pointing at a URL, a base64 envelope wrapped inside another base64
//! envelope, or a job ticket that has to be polled. This crate sniffs the
//! bytes, decodes whichever shape arrived and hands back one
//! [`UpscaleResult`].
//!
//! ## Pipeline Overview
//!
//! ```text
//! image
//!  │
//!  ├─ 1. Request    validate size/prompt, build multipart body
//!  ├─ 2. Transport  POST with linear-backoff retry on 5xx
//!  ├─ 3. Signature  PNG magic → JPEG magic → non-JSON binary → JSON
//!  ├─ 4. Decode     direct URL | nested base64 | job ticket
//!  ├─ 5. Poll       every 2 s, up to 5 min, cancellable
//!  └─ 6. Normalize  one UpscaleResult, never completed without a location
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxscale::{ClientConfig, UpscaleClient, UpscaleMode, UpscaleOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // UPSCALER_API_KEY / UPSCALER_APP_ID from the environment
//!     let client = UpscaleClient::new(ClientConfig::from_env())?;
//!     let options = UpscaleOptions::new(UpscaleMode::Conservative).prompt("sharp details");
//!     let result = client.upscale_path("photo.jpg", options).await?;
//!     let image = client.fetch_local(result).await?;
//!     image.save_to("photo-upscaled.png").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `fluxscale` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! fluxscale = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod generate;
pub mod output;
pub mod pipeline;
pub mod transport;
pub mod upscale;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{load_dotenv, ClientConfig, ClientConfigBuilder, UpscaleMode};
pub use error::{ErrorKind, FluxscaleError};
pub use generate::{GenerateOptions, GenerationClient};
pub use output::{GeneratedImages, ImageLocation, MaterializedImage, UpscaleResult};
pub use pipeline::request::{UpscaleOptions, UpscaleRequest};
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpTransport, OutgoingRequest, RawResponse, ReqwestTransport};
pub use upscale::UpscaleClient;
