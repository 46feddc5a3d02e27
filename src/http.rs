//! JSON requests to hosted APIs with retry and backoff.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::error::ApiError;

/// A JSON request to one endpoint of a hosted service.
pub struct JsonRequest<'a> {
    /// Service label used in errors and logs (e.g. `"Jina"`).
    pub service: &'a str,
    pub method: Method,
    pub url: &'a str,
    pub headers: HeaderMap,
    pub body: Option<&'a Value>,
}

impl<'a> JsonRequest<'a> {
    pub fn post(service: &'a str, url: &'a str, body: &'a Value) -> Self {
        Self {
            service,
            method: Method::POST,
            url,
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }

    pub fn new(service: &'a str, method: Method, url: &'a str) -> Self {
        Self {
            service,
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("authorization", &format!("Bearer {}", token))
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = value.parse() {
            self.headers.insert(name, v);
        }
        self
    }
}

/// Delay before retry `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// Send a request once and decode the JSON body.
pub async fn send_json(client: &reqwest::Client, req: &JsonRequest<'_>) -> Result<Value, ApiError> {
    let mut builder = client
        .request(req.method.clone(), req.url)
        .headers(req.headers.clone());
    if let Some(body) = req.body {
        builder = builder.json(body);
    }
    send_request(req.service, builder).await
}

/// Send a prepared request and decode its JSON body.
///
/// A success response whose body is not JSON is an
/// [`ApiError::InvalidResponse`]: the call went through, so it is not
/// retried.
pub async fn send_request(
    service: &str,
    builder: reqwest::RequestBuilder,
) -> Result<Value, ApiError> {
    let transport = |e: reqwest::Error| ApiError::Transport {
        service: service.to_string(),
        source: e,
    };

    let response = builder.send().await.map_err(transport)?;
    let status = response.status();
    let body = response.text().await.map_err(transport)?;

    if !status.is_success() {
        return Err(ApiError::Status {
            service: service.to_string(),
            status: status.as_u16(),
            body,
        });
    }
    serde_json::from_str(&body).map_err(|e| {
        ApiError::invalid_response(service, format!("response body is not JSON: {}", e))
    })
}

/// Send a request, retrying retryable failures up to `max_retries` times.
pub async fn send_with_retry(
    client: &reqwest::Client,
    req: &JsonRequest<'_>,
    max_retries: u32,
) -> Result<Value, ApiError> {
    retry(req.service, max_retries, || send_json(client, req)).await
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or
/// `max_retries` retries are used up.
///
/// For requests that can't be replayed from a [`JsonRequest`], such as
/// multipart uploads, which are rebuilt on every attempt.
pub async fn retry<F, Fut>(
    service: &str,
    max_retries: u32,
    mut attempt: F,
) -> Result<Value, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, ApiError>>,
{
    let mut retries = 0;
    loop {
        if retries > 0 {
            tokio::time::sleep(backoff_delay(retries)).await;
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && retries < max_retries => {
                retries += 1;
                warn!(
                    service,
                    attempt = retries,
                    max_retries,
                    "request failed, retrying: {}",
                    e
                );
            }
            Err(e) => {
                if retries > 0 {
                    error!(service, attempts = retries + 1, "retry failed: {}", e);
                }
                return Err(e);
            }
        }
    }
}

/// Build a client with the given timeout.
pub fn client_with_timeout(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}
