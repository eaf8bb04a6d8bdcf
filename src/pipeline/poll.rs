//! Async poller for upscale jobs.
//!
//! ```text
//!            tick (every poll_interval)
//!   Pending ──────────────────────────▶ Pending
//!      │ error field / failed status      │ completed + URL
//!      ▼                                  ▼
//!   Failed                            Completed
//!
//!   ceiling reached ─▶ TimedOut      cancel ─▶ Cancelled
//! ```
//!
//! The first status request goes out one interval after the ticket arrives.
//! A tick that fails (network error, non-2xx, a body that is neither JSON nor
//! a PNG/JPEG image) is logged and the loop keeps going; only the ceiling or
//! the caller's token stop it early. At most one request is in flight at a time.

use crate::config::ClientConfig;
use crate::error::FluxscaleError;
use crate::output::ImageLocation;
use crate::pipeline::decode::{format_from_url, resolve_url, str_field};
use crate::pipeline::materialize::materialize_bytes;
use crate::pipeline::signature::{looks_like_json, sniff_format};
use crate::transport::{ensure_success, HttpTransport, OutgoingRequest};
use image::ImageFormat;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMPLETED_STATUSES: [&str; 2] = ["completed", "done"];
const FAILED_STATUSES: [&str; 4] = ["failed", "error", "canceled", "cancelled"];

/// Path segment that marks the upscale route in the configured URL.
const UPSCALE_ROUTE: &str = "/api/v1/upscale";

/// Result of one status request.
#[derive(Debug)]
pub enum PollOutcome {
    Pending,
    Completed {
        location: ImageLocation,
        format: ImageFormat,
    },
    Failed(String),
}

/// Terminal state of a polling loop.
#[derive(Debug)]
pub enum JobState {
    Completed {
        location: ImageLocation,
        format: ImageFormat,
    },
    Failed(String),
    TimedOut,
    Cancelled,
}

/// What a polling loop ended with, and how long it took to get there.
#[derive(Debug)]
pub struct PollReport {
    pub job_id: String,
    pub state: JobState,
    /// Status requests sent, including failed ones.
    pub ticks: u32,
    pub elapsed: Duration,
}

/// Status URL for `job_id`, derived from the configured upscale endpoint.
pub fn result_url(upscaler_url: &str, job_id: &str) -> String {
    match upscaler_url.find(UPSCALE_ROUTE) {
        Some(idx) => format!("{}{}/result/{}", &upscaler_url[..idx], UPSCALE_ROUTE, job_id),
        None => format!("{}/result/{}", upscaler_url.trim_end_matches('/'), job_id),
    }
}

/// Polls one job until it reaches a terminal state.
pub struct JobPoller<'a> {
    transport: &'a dyn HttpTransport,
    config: &'a ClientConfig,
    interval: Duration,
    ceiling: Duration,
}

impl<'a> JobPoller<'a> {
    pub fn new(transport: &'a dyn HttpTransport, config: &'a ClientConfig) -> Self {
        Self {
            transport,
            config,
            // tokio rejects a zero period.
            interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            ceiling: Duration::from_secs(config.poll_timeout_secs),
        }
    }

    /// Run the loop. Always returns a report; the caller decides which
    /// terminal states are errors.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) -> PollReport {
        let url = result_url(&self.config.upscaler_url, job_id);
        let start = Instant::now();
        let deadline = start + self.ceiling;
        let mut ticker = interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u32;

        info!(
            "Polling job {} every {:?} (ceiling {:?})",
            job_id, self.interval, self.ceiling
        );

        let state = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break JobState::Cancelled,
                _ = sleep_until(deadline) => break JobState::TimedOut,
                _ = ticker.tick() => {}
            }

            ticks += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break JobState::Cancelled,
                _ = sleep_until(deadline) => break JobState::TimedOut,
                r = self.poll_once(&url) => r,
            };

            match outcome {
                Ok(PollOutcome::Pending) => {
                    debug!("Job {} still pending after {} checks", job_id, ticks);
                }
                Ok(PollOutcome::Completed { location, format }) => {
                    break JobState::Completed { location, format };
                }
                Ok(PollOutcome::Failed(message)) => break JobState::Failed(message),
                Err(e) => {
                    warn!("Status check {} for job {} failed: {}", ticks, job_id, e);
                }
            }
        };

        let elapsed = start.elapsed();
        match &state {
            JobState::Completed { location, .. } => {
                info!("Job {} completed in {:?}: {}", job_id, elapsed, location)
            }
            JobState::Failed(msg) => warn!("Job {} failed: {}", job_id, msg),
            JobState::TimedOut => warn!("Job {} timed out after {:?}", job_id, elapsed),
            JobState::Cancelled => info!("Polling of job {} cancelled", job_id),
        }

        PollReport {
            job_id: job_id.to_string(),
            state,
            ticks,
            elapsed,
        }
    }

    /// One status request.
    pub async fn poll_once(&self, url: &str) -> Result<PollOutcome, FluxscaleError> {
        let request = OutgoingRequest::get(url)
            .with_upscaler_auth(self.config)
            .header("Accept", "*/*");
        let response = ensure_success(self.transport.send(&request).await?, url)?;

        let body = response.body;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(FluxscaleError::EmptyBody);
        }
        // Only a recognised image signature counts as a binary result here.
        if let Some(format) = sniff_format(&body) {
            let image = materialize_bytes(body, format).await?;
            return Ok(PollOutcome::Completed {
                location: ImageLocation::Local(image),
                format,
            });
        }
        if !looks_like_json(&body) {
            return Err(FluxscaleError::malformed("job status", "expected JSON", &body));
        }
        interpret_status(&body)
    }
}

/// Read a JSON status document.
pub fn interpret_status(body: &[u8]) -> Result<PollOutcome, FluxscaleError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| FluxscaleError::malformed("job status", e, body))?;
    let Some(obj) = value.as_object() else {
        return Err(FluxscaleError::malformed(
            "job status",
            "expected a JSON object",
            body,
        ));
    };

    if let Some(message) = error_message(obj) {
        return Ok(PollOutcome::Failed(message));
    }

    let status = str_field(obj, "status").map(str::to_ascii_lowercase);
    if let Some(s) = status.as_deref() {
        if FAILED_STATUSES.contains(&s) {
            let message = str_field(obj, "message").unwrap_or(s).to_string();
            return Ok(PollOutcome::Failed(message));
        }
    }

    let flagged = obj
        .get("is_completed")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let by_status = status
        .as_deref()
        .map(|s| COMPLETED_STATUSES.contains(&s))
        .unwrap_or(false);

    if flagged || by_status {
        match resolve_url(obj) {
            Some(url) => {
                let format = format_from_url(&url);
                return Ok(PollOutcome::Completed {
                    location: ImageLocation::Remote(url),
                    format,
                });
            }
            None => warn!("Job reported completed without a result URL; still waiting"),
        }
    }

    Ok(PollOutcome::Pending)
}

fn error_message(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("error")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(inner) => Some(
            str_field(inner, "message")
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(inner.clone()).to_string()),
        ),
        _ => None,
    }
}
