//! CLI binary for fluxscale.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ClientConfig` / request options and prints results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fluxscale::pipeline::decode::is_http_url;
use fluxscale::{
    load_dotenv, CancellationToken, ClientConfig, ClientConfigBuilder, GenerateOptions,
    GenerationClient, UpscaleClient, UpscaleMode, UpscaleOptions, UpscaleRequest,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"CONFIGURATION:
  Settings are read from the environment. The first .env file found is loaded:
  ./.env, ~/.fluxscale/.env, $XDG_CONFIG_HOME/fluxscale/.env, <binary dir>/.env

  FLUX_API_URL            Generation endpoint (required for `generate`)
  UPSCALER_API_URL        Upscale endpoint
  UPSCALER_API_KEY        Upscaler bearer token (required for `upscale`)
  UPSCALER_APP_ID         Sent as X-App-ID

EXAMPLES:
  fluxscale generate "a lighthouse at dusk" --num-outputs 2 --save-dir out/
  fluxscale upscale photo.jpg -o photo-4x.png
  fluxscale upscale https://example.com/cat.png --mode creative --prompt "a fluffy cat"
"#;

/// Generate images from prompts and upscale existing ones.
#[derive(Parser, Debug)]
#[command(
    name = "fluxscale",
    version,
    about = "Generate images from prompts and upscale existing ones",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, global = true, env = "FLUXSCALE_TIMEOUT")]
    timeout: Option<u64>,

    /// Disable the spinner.
    #[arg(long, global = true, env = "FLUXSCALE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "FLUXSCALE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and results.
    #[arg(short, long, global = true, env = "FLUXSCALE_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate images from a text prompt.
    Generate {
        /// Text prompt.
        prompt: String,

        /// Number of images to request.
        #[arg(long)]
        num_outputs: Option<u32>,

        /// Aspect ratio, e.g. 1:1, 16:9.
        #[arg(long)]
        aspect_ratio: Option<String>,

        /// Output format: png, jpeg, webp.
        #[arg(long)]
        format: Option<String>,

        /// Output quality.
        #[arg(long)]
        quality: Option<u32>,

        /// Seed for reproducible results.
        #[arg(long)]
        seed: Option<i64>,

        /// Download every image into this directory.
        #[arg(long)]
        save_dir: Option<PathBuf>,

        /// Parallel downloads when saving.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Upscale a local image file or an image URL.
    Upscale {
        /// Local image path or HTTP/HTTPS URL.
        input: String,

        /// Upscale mode: fast, conservative, creative.
        #[arg(long)]
        mode: Option<UpscaleMode>,

        /// Prompt guiding conservative and creative upscales.
        #[arg(long)]
        prompt: Option<String>,

        #[arg(long)]
        negative_prompt: Option<String>,

        #[arg(long)]
        seed: Option<i64>,

        /// Creativity level (0.0 to 1.0).
        #[arg(long)]
        creativity: Option<f32>,

        /// Output format: png, jpeg, webp.
        #[arg(long)]
        format: Option<String>,

        #[arg(long)]
        style_preset: Option<String>,

        /// Save the upscaled image here; otherwise the location is printed.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner provides the feedback, so library logs drop to ERROR
    // while it is active.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    load_dotenv();
    let config = build_config(&cli)?;

    // ── Ctrl-C cancels whatever is in flight ─────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Generate {
            ref prompt,
            num_outputs,
            ref aspect_ratio,
            ref format,
            quality,
            seed,
            ref save_dir,
            concurrency,
            json,
        } => {
            let client = GenerationClient::new(config).context("Failed to create HTTP client")?;
            let mut options = GenerateOptions::from_config(client.config());
            if let Some(n) = num_outputs {
                options.num_outputs = n;
            }
            if let Some(r) = aspect_ratio {
                options.aspect_ratio = r.clone();
            }
            if let Some(f) = format {
                options.output_format = f.to_lowercase();
            }
            if let Some(q) = quality {
                options.output_quality = q;
            }
            options.seed = seed;

            let images = with_spinner(
                show_progress,
                "Generating…",
                client.generate_with_options(prompt, &options, &cancel),
            )
            .await
            .context("Generation failed")?;

            if json {
                let out =
                    serde_json::to_string_pretty(&images).context("Failed to serialise output")?;
                println!("{out}");
            } else {
                for url in &images.urls {
                    println!("{url}");
                }
            }

            if let Some(dir) = save_dir {
                let saved = with_spinner(
                    show_progress,
                    "Downloading…",
                    client.download_all(&images.urls, dir, concurrency, &cancel),
                )
                .await
                .context("Failed to download generated images")?;
                if !cli.quiet {
                    for path in &saved {
                        eprintln!("{}  {}", green("✔"), bold(&path.display().to_string()));
                    }
                }
            }
        }

        Command::Upscale {
            ref input,
            mode,
            ref prompt,
            ref negative_prompt,
            seed,
            creativity,
            ref format,
            ref style_preset,
            ref output,
        } => {
            let client = UpscaleClient::new(config).context("Failed to create HTTP client")?;
            let mut options = UpscaleOptions::new(mode.unwrap_or(client.config().default_mode));
            options.prompt = prompt.clone();
            options.negative_prompt = negative_prompt.clone();
            options.seed = seed;
            options.creativity = creativity;
            options.style_preset = style_preset.clone();
            if let Some(f) = format {
                options = options.output_format(f.as_str());
            }

            let result = with_spinner(show_progress, "Upscaling…", async {
                if is_http_url(input) {
                    client.upscale_from_url(input, options, &cancel).await
                } else {
                    let max_bytes = client.config().max_upload_bytes;
                    match UpscaleRequest::from_path(input, options, max_bytes).await {
                        Ok(request) => client.upscale_with_cancel(request, &cancel).await,
                        Err(e) => Err(e),
                    }
                }
            })
            .await
            .with_context(|| format!("Failed to upscale {input}"))?;

            if let Some(job) = result.job_id() {
                if !cli.quiet {
                    eprintln!("   {}", dim(&format!("job {job}")));
                }
            }

            match output {
                Some(dest) => {
                    let image = client
                        .fetch_local_with_cancel(result, &cancel)
                        .await
                        .context("Failed to fetch upscaled image")?;
                    let saved = image
                        .save_to(dest)
                        .await
                        .with_context(|| format!("Failed to save to {}", dest.display()))?;
                    if !cli.quiet {
                        eprintln!(
                            "{}  {} bytes  →  {}",
                            green("✔"),
                            image.len(),
                            bold(&saved.display().to_string())
                        );
                    }
                }
                None => {
                    let location = result.into_location();
                    match location {
                        fluxscale::ImageLocation::Remote(url) => println!("{url}"),
                        fluxscale::ImageLocation::Local(image) => {
                            let path = image.keep().context("Failed to keep upscaled image")?;
                            println!("{}", path.display());
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

/// Map environment plus CLI flags to a validated `ClientConfig`.
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut builder = ClientConfigBuilder::from_config(ClientConfig::from_env());
    if let Some(secs) = cli.timeout {
        builder = builder.request_timeout_secs(secs);
    }
    builder.build().context("Invalid configuration")
}

/// Drive `fut` while showing a spinner with `message`.
async fn with_spinner<T>(show: bool, message: &str, fut: impl Future<Output = T>) -> T {
    if !show {
        return fut.await;
    }
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(80));
    let out = fut.await;
    bar.finish_and_clear();
    out
}
