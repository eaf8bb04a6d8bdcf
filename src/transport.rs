//! HTTP transport: one request in, one fully-buffered response out.
//!
//! The engine never talks to `reqwest` directly. It builds an
//! [`OutgoingRequest`] (a plain value that can be re-sent any number of times)
//! and hands it to an [`HttpTransport`]. Production code uses
//! [`ReqwestTransport`]; tests plug in a scripted transport and count calls.
//!
//! ## Retry Strategy
//!
//! [`send_with_retry`] re-sends on 5xx only, with linear backoff
//! (`attempt × step`, so 1 s → 2 s with the default step and 3 attempts).
//! 2xx and 4xx responses are returned on the first attempt. A network failure
//! is surfaced immediately: a request that never reached the server is not
//! assumed to be transient. Attempts are strictly sequential.

use crate::config::ClientConfig;
use crate::error::{body_context, FluxscaleError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of leading body bytes shown in debug previews.
const PREVIEW_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// The file part of a multipart upload.
#[derive(Clone)]
pub struct FilePart {
    /// Form field name (`image` for the upscaler).
    pub field: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for FilePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePart")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A `multipart/form-data` body: one file plus text fields, in order.
#[derive(Debug, Clone)]
pub struct MultipartBody {
    pub file: FilePart,
    pub fields: Vec<(String, String)>,
}

impl MultipartBody {
    /// Value of the first text field called `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Multipart(MultipartBody),
}

/// A request description that can be sent repeatedly.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl OutgoingRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    pub fn post_multipart(url: impl Into<String>, body: MultipartBody) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Multipart(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach the upscaler's `Authorization` and `X-App-ID` headers.
    pub fn with_upscaler_auth(self, config: &ClientConfig) -> Self {
        self.header(
            "Authorization",
            format!("Bearer {}", config.upscaler_api_key),
        )
        .header("X-App-ID", config.upscaler_app_id.clone())
    }
}

/// A fully received response. Consumed once by the classifier.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Response with no headers; mainly for scripted transports.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Declared content type. Informational only: classification trusts the body.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

/// Sends a single HTTP request.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &OutgoingRequest) -> Result<RawResponse, FluxscaleError>;
}

/// [`HttpTransport`] backed by a pooled `reqwest::Client` with a fixed timeout.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new(timeout_secs: u64) -> Result<Self, FluxscaleError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| FluxscaleError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, FluxscaleError> {
        Self::new(config.request_timeout_secs)
    }

    fn map_error(&self, url: &str, e: reqwest::Error) -> FluxscaleError {
        if e.is_timeout() {
            FluxscaleError::RequestTimeout {
                url: url.to_string(),
                secs: self.timeout_secs,
            }
        } else {
            FluxscaleError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &OutgoingRequest) -> Result<RawResponse, FluxscaleError> {
        let url = request.url.as_str();
        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart(body) => {
                let part = reqwest::multipart::Part::bytes(body.file.bytes.clone())
                    .file_name(body.file.file_name.clone())
                    .mime_str(&body.file.mime_type)
                    .map_err(|e| {
                        FluxscaleError::Internal(format!(
                            "invalid MIME type {:?} for {}: {e}",
                            body.file.mime_type, body.file.file_name
                        ))
                    })?;
                let mut form = reqwest::multipart::Form::new().part(body.file.field.clone(), part);
                for (name, value) in &body.fields {
                    form = form.text(name.clone(), value.clone());
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await.map_err(|e| self.map_error(url, e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(url, e))?
            .to_vec();

        debug!(
            "{:?} {} → {} ({} bytes, content-type {:?})",
            request.method,
            url,
            status,
            body.len(),
            headers.get(CONTENT_TYPE)
        );

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// How many times, and how patiently, to re-send on 5xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always ≥ 1.
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `n × backoff_step`.
    pub backoff_step: Duration,
}

impl RetryPolicy {
    /// One attempt, no retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff_step: Duration::ZERO,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_step: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_secs(1),
        }
    }
}

/// Send `request`, re-sending on 5xx according to `policy`.
///
/// Returns the last response received, whatever its status; pair with
/// [`ensure_success`] to turn a final non-2xx into an error.
pub async fn send_with_retry(
    transport: &dyn HttpTransport,
    request: &OutgoingRequest,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<RawResponse, FluxscaleError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FluxscaleError::Cancelled),
            r = transport.send(request) => r?,
        };

        if response.status.is_server_error() && attempt < max_attempts {
            let backoff = policy.backoff_after(attempt);
            warn!(
                "Got server error {} from {}, retrying ({}/{}) after {:?}",
                response.status.as_u16(),
                request.url,
                attempt,
                max_attempts,
                backoff
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FluxscaleError::Cancelled),
                _ = sleep(backoff) => {}
            }
            attempt += 1;
            continue;
        }

        debug!(
            "{} answered {} on attempt {}/{}",
            request.url, response.status, attempt, max_attempts
        );
        return Ok(response);
    }
}

/// Map a non-2xx response to the matching transport error.
pub fn ensure_success(response: RawResponse, url: &str) -> Result<RawResponse, FluxscaleError> {
    if response.status.is_success() {
        return Ok(response);
    }
    if response.status == StatusCode::BAD_GATEWAY {
        return Err(FluxscaleError::ServiceUnavailable {
            url: url.to_string(),
        });
    }
    Err(FluxscaleError::HttpStatus {
        status: response.status.as_u16(),
        url: url.to_string(),
        body: body_context(&response.body),
    })
}

/// Hex preview of the first bytes of a body, for debug logs.
pub fn hex_preview(body: &[u8]) -> String {
    body.iter()
        .take(PREVIEW_BYTES)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<VecDeque<Result<RawResponse, FluxscaleError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<RawResponse, FluxscaleError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, _request: &OutgoingRequest) -> Result<RawResponse, FluxscaleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(RawResponse::new(200, "")))
        }
    }

    fn req() -> OutgoingRequest {
        OutgoingRequest::get("http://svc/api/v1/upscale")
    }

    #[tokio::test(start_paused = true)]
    async fn retries_502_then_returns_200() {
        let t = Scripted::new(vec![
            Ok(RawResponse::new(502, "bad gateway")),
            Ok(RawResponse::new(502, "bad gateway")),
            Ok(RawResponse::new(200, "ok")),
        ]);
        let start = tokio::time::Instant::now();
        let resp = send_with_retry(&t, &req(), &RetryPolicy::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
        // 1s + 2s of linear backoff
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let t = Scripted::new(vec![
            Ok(RawResponse::new(503, "")),
            Ok(RawResponse::new(503, "")),
            Ok(RawResponse::new(503, "")),
            Ok(RawResponse::new(200, "")),
        ]);
        let resp = send_with_retry(&t, &req(), &RetryPolicy::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status.as_u16(), 503);
        assert_eq!(t.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let t = Scripted::new(vec![Ok(RawResponse::new(400, "bad"))]);
        let resp = send_with_retry(&t, &req(), &RetryPolicy::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status.as_u16(), 400);
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_errors_are_not_retried() {
        let t = Scripted::new(vec![Err(FluxscaleError::Network {
            url: "http://svc".into(),
            reason: "connection refused".into(),
        })]);
        let err = send_with_retry(&t, &req(), &RetryPolicy::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::Network { .. }));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_sending() {
        let t = Scripted::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = send_with_retry(&t, &req(), &RetryPolicy::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FluxscaleError::Cancelled));
        assert_eq!(t.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ensure_success_distinguishes_502() {
        let err = ensure_success(RawResponse::new(502, "x"), "http://svc").unwrap_err();
        assert!(matches!(err, FluxscaleError::ServiceUnavailable { .. }));

        let err = ensure_success(RawResponse::new(500, "boom"), "http://svc").unwrap_err();
        match err {
            FluxscaleError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(ensure_success(RawResponse::new(202, "{}"), "http://svc").is_ok());
    }

    #[test]
    fn auth_headers_attached() {
        let cfg = ClientConfig::builder()
            .upscaler_api_key("sk-1")
            .upscaler_app_id("app-9")
            .build()
            .unwrap();
        let r = req().with_upscaler_auth(&cfg);
        assert!(r
            .headers
            .contains(&("Authorization".to_string(), "Bearer sk-1".to_string())));
        assert!(r
            .headers
            .contains(&("X-App-ID".to_string(), "app-9".to_string())));
    }

    #[test]
    fn hex_preview_is_bounded() {
        let p = hex_preview(&[0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(p, "89 50 4e 47");
        assert_eq!(hex_preview(&[0u8; 100]).split(' ').count(), PREVIEW_BYTES);
    }

    #[tokio::test]
    async fn bad_mime_type_is_an_internal_error() {
        let transport = ReqwestTransport::new(5).unwrap();
        let body = MultipartBody {
            file: FilePart {
                field: "image".into(),
                file_name: "x.png".into(),
                mime_type: "not a mime type".into(),
                bytes: vec![1, 2, 3],
            },
            fields: Vec::new(),
        };
        let request = OutgoingRequest::post_multipart("http://127.0.0.1:9/api/v1/upscale", body);
        let err = transport.send(&request).await.unwrap_err();
        assert!(matches!(err, FluxscaleError::Internal(_)), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
