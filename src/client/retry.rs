use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// Decides whether a response is worth another attempt.
pub type RetryPredicate = fn(StatusCode) -> bool;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of sends, including the first one.
    pub max_retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_on: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            retry_on: is_error_response,
        }
    }
}

/// Any 4xx or 5xx is retried.
pub fn is_error_response(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}

/// Execute a request, retrying retryable responses with exponential backoff.
///
/// The body is a shared immutable buffer: every attempt sends the same bytes from
/// the start. A transport error (no response at all) aborts immediately. When the
/// attempt budget runs out the last response is returned as-is so the caller can
/// classify its status.
pub async fn robust_request(
    client: &Client,
    method: Method,
    url: &Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    config: &RetryConfig,
) -> Result<Response, reqwest::Error> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let mut builder = client
            .request(method.clone(), url.clone())
            .headers(headers.clone());
        if let Some(body) = &body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();

        if !(config.retry_on)(status) {
            return Ok(response);
        }

        if attempt >= config.max_retries {
            debug!(
                %method,
                %url,
                %status,
                attempts = attempt,
                "retries exhausted"
            );
            return Ok(response);
        }

        let wait_duration = calculate_backoff(config, attempt);
        warn!(
            %method,
            %url,
            %status,
            attempt,
            max_attempts = config.max_retries,
            backoff_ms = wait_duration.as_millis() as u64,
            "retrying the request"
        );

        sleep(wait_duration).await;
    }
}

/// `clamp(2^attempt seconds, min, max)`.
pub fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = Duration::from_secs(2u64.saturating_pow(attempt));
    raw.max(config.min_backoff).min(config.max_backoff)
}
