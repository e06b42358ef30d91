// SPDX-License-Identifier: MIT
//! Proxy Engine — forwards inference requests to GPU workers.
//!
//! One shared pooled HTTP client serves every upstream. Unary requests are
//! retried with bounded exponential backoff; streams are never retried once
//! response headers have been observed. A per-endpoint circuit breaker
//! rejects calls to failing workers before they burn a connection.
//!
//! Streaming responses are relayed in 4 KiB chunks as they arrive, with an
//! [`sse::SseScanner`] watching the same bytes for the final `usage` object.
//! Cancellation propagates both ways: a departed client tears down the
//! upstream call, a dead upstream ends the client stream.

pub mod breaker;
pub mod headers;
pub mod retry;
pub mod sse;

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use futures_util::StreamExt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ApiError;
use breaker::{BreakerConfig, BreakerRegistry};
use retry::RetryPolicy;
use sse::{SseScanner, UpstreamUsage};

/// Forwarded chunk size for streaming responses.
const STREAM_CHUNK: usize = 4096;

/// Channel depth between the upstream pump and the client-facing stream.
const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// TCP connect timeout to a worker.
    pub connect_timeout: Duration,
    /// End-to-end deadline for a unary request (including retries).
    pub request_timeout: Duration,
    /// Deadline for receiving response headers on a stream.
    pub stream_header_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    /// Node-scoped credential substituted for the caller's bearer when the
    /// worker fleet requires auth.
    pub node_bearer: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(120),
            stream_header_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            node_bearer: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream timed out")]
    Timeout,
    #[error("circuit open for upstream")]
    CircuitOpen,
    #[error("upstream refused the connection")]
    Refused,
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("upstream kept failing with status {0}")]
    Exhausted(StatusCode),
}

impl From<ProxyError> for ApiError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Timeout => ApiError::UpstreamTimeout,
            ProxyError::CircuitOpen
            | ProxyError::Refused
            | ProxyError::Exhausted(_) => ApiError::UpstreamUnavailable,
            ProxyError::Transport(msg) => ApiError::UpstreamProtocolError(msg),
            ProxyError::Protocol(msg) => ApiError::UpstreamProtocolError(msg),
        }
    }
}

/// A completed unary exchange.
#[derive(Debug)]
pub struct UnaryResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Usage parsed from the response body, when present and consistent.
    pub usage: Option<UpstreamUsage>,
}

/// Reported once per stream, after the last byte has been relayed (or the
/// pipe broke).
#[derive(Debug)]
pub struct StreamOutcome {
    pub usage: Option<UpstreamUsage>,
    pub stream_bytes: u64,
    /// True when the stream ended cleanly (sentinel or upstream EOF).
    pub completed: bool,
}

/// An accepted stream: relay `body_rx` to the client; `outcome` resolves
/// when the relay finishes.
pub struct StreamStart {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body_rx: mpsc::Receiver<Result<Bytes, std::io::Error>>,
    pub outcome: oneshot::Receiver<StreamOutcome>,
}

/// An upstream response that should be passed through verbatim (client
/// errors from the worker, e.g. context-length violations).
#[derive(Debug)]
pub struct Passthrough {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub enum StreamDecision {
    Stream(StreamStart),
    Passthrough(Passthrough),
}

pub struct ProxyEngine {
    client: reqwest::Client,
    breakers: BreakerRegistry,
    config: ProxyConfig,
}

impl ProxyEngine {
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            breakers: BreakerRegistry::new(config.breaker.clone()),
            config,
        })
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Node-scoped credential substituted for the caller's bearer.
    pub fn node_bearer(&self) -> Option<&str> {
        self.config.node_bearer.as_deref()
    }

    /// Forward a unary request. Retries transport failures and retryable
    /// statuses (429/502/503/504) with backoff, capped by the deadline;
    /// never retries after response headers were observed. Non-retryable
    /// upstream statuses are returned to the caller untouched.
    pub async fn forward(
        &self,
        endpoint: &str,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UnaryResponse, ProxyError> {
        let breaker = self.breakers.for_endpoint(endpoint).await;
        if !breaker.acquire().await {
            return Err(ProxyError::CircuitOpen);
        }

        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        let deadline = Instant::now() + self.config.request_timeout;
        let mut last_err = ProxyError::Timeout;

        for attempt in 0..self.config.retry.max_attempts {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                break;
            };

            let send = self
                .client
                .post(&url)
                .headers(headers.clone())
                .body(body.clone())
                .timeout(remaining)
                .send();

            match send.await {
                Ok(resp) => {
                    let status = resp.status();
                    if is_retryable_status(status) {
                        breaker.record_failure().await;
                        last_err = ProxyError::Exhausted(status);
                        debug!(%url, %status, attempt, "retryable upstream status");
                    } else {
                        // Headers observed and status is final: read the body.
                        let resp_headers = headers::response_headers(resp.headers());
                        let bytes = resp
                            .bytes()
                            .await
                            .map_err(|e| ProxyError::Transport(e.to_string()))?;
                        if status.is_server_error() {
                            breaker.record_failure().await;
                        } else {
                            breaker.record_success().await;
                        }
                        let usage = extract_unary_usage(&bytes)?;
                        return Ok(UnaryResponse {
                            status,
                            headers: resp_headers,
                            body: bytes,
                            usage,
                        });
                    }
                }
                Err(e) => {
                    breaker.record_failure().await;
                    last_err = classify_reqwest(&e);
                    debug!(%url, err = %e, attempt, "upstream send failed");
                }
            }

            if attempt + 1 < self.config.retry.max_attempts {
                let delay = self.config.retry.delay(attempt).min(
                    deadline
                        .checked_duration_since(Instant::now())
                        .unwrap_or(Duration::ZERO),
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_err)
    }

    /// Open a streaming exchange. Connection-phase failures are retried like
    /// unary ones; once response headers arrive there is no second attempt.
    pub async fn stream(
        &self,
        endpoint: &str,
        path: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<StreamDecision, ProxyError> {
        let breaker = self.breakers.for_endpoint(endpoint).await;
        if !breaker.acquire().await {
            return Err(ProxyError::CircuitOpen);
        }

        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        let mut last_err = ProxyError::Timeout;

        for attempt in 0..self.config.retry.max_attempts {
            let send = self
                .client
                .post(&url)
                .headers(headers.clone())
                .body(body.clone())
                .send();

            let resp = match tokio::time::timeout(self.config.stream_header_timeout, send).await {
                Err(_) => {
                    breaker.record_failure().await;
                    last_err = ProxyError::Timeout;
                    continue;
                }
                Ok(Err(e)) => {
                    breaker.record_failure().await;
                    last_err = classify_reqwest(&e);
                    if attempt + 1 < self.config.retry.max_attempts {
                        tokio::time::sleep(self.config.retry.delay(attempt)).await;
                    }
                    continue;
                }
                Ok(Ok(resp)) => resp,
            };

            let status = resp.status();
            if is_retryable_status(status) {
                breaker.record_failure().await;
                last_err = ProxyError::Exhausted(status);
                if attempt + 1 < self.config.retry.max_attempts {
                    tokio::time::sleep(self.config.retry.delay(attempt)).await;
                }
                continue;
            }

            let resp_headers = headers::response_headers(resp.headers());
            if !status.is_success() {
                // Worker-side error: relay it verbatim, no retry.
                if status.is_server_error() {
                    breaker.record_failure().await;
                } else {
                    breaker.record_success().await;
                }
                let bytes = resp
                    .bytes()
                    .await
                    .map_err(|e| ProxyError::Transport(e.to_string()))?;
                return Ok(StreamDecision::Passthrough(Passthrough {
                    status,
                    headers: resp_headers,
                    body: bytes,
                }));
            }

            breaker.record_success().await;
            let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_BUFFER);
            let (otx, orx) = oneshot::channel();
            tokio::spawn(pump_stream(resp, tx, otx));

            return Ok(StreamDecision::Stream(StreamStart {
                status,
                headers: resp_headers,
                body_rx: rx,
                outcome: orx,
            }));
        }

        Err(last_err)
    }
}

/// Relay the upstream body to the client channel in 4 KiB pieces, feeding
/// the usage scanner on the side. Dropping the receiver (client went away)
/// aborts the relay, which drops the upstream response and cancels it.
async fn pump_stream(
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    otx: oneshot::Sender<StreamOutcome>,
) {
    let mut scanner = SseScanner::new();
    let mut broke = false;
    let mut stream = resp.bytes_stream();

    'relay: while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                scanner.feed(&chunk);
                let mut offset = 0;
                while offset < chunk.len() {
                    let end = (offset + STREAM_CHUNK).min(chunk.len());
                    if tx.send(Ok(chunk.slice(offset..end))).await.is_err() {
                        // Client cancelled — stop reading upstream too.
                        broke = true;
                        break 'relay;
                    }
                    offset = end;
                }
            }
            Err(e) => {
                warn!(err = %e, "upstream stream broke mid-flight");
                let _ = tx
                    .send(Err(std::io::Error::other(e.to_string())))
                    .await;
                broke = true;
                break;
            }
        }
    }

    let _ = otx.send(StreamOutcome {
        usage: scanner.latest_usage(),
        stream_bytes: scanner.stream_bytes(),
        completed: !broke,
    });
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 502 | 503 | 504)
}

fn classify_reqwest(e: &reqwest::Error) -> ProxyError {
    if e.is_timeout() {
        ProxyError::Timeout
    } else if e.is_connect() {
        ProxyError::Refused
    } else {
        ProxyError::Transport(e.to_string())
    }
}

/// Pull `usage` out of a unary JSON body. An inconsistent triple is upstream
/// corruption and becomes a protocol error (surfaced as 502).
fn extract_unary_usage(body: &[u8]) -> Result<Option<UpstreamUsage>, ProxyError> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return Ok(None);
    };
    let Some(usage_value) = value.get("usage") else {
        return Ok(None);
    };
    match serde_json::from_value::<UpstreamUsage>(usage_value.clone()) {
        Ok(usage) if usage.consistent() => Ok(Some(usage)),
        Ok(usage) => Err(ProxyError::Protocol(format!(
            "usage sum mismatch: {} + {} != {}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        ))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::OK));
    }

    #[test]
    fn unary_usage_extraction() {
        let body = br#"{"id":"x","usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#;
        let usage = extract_unary_usage(body).unwrap().unwrap();
        assert_eq!(usage.total_tokens, 7);

        // Missing usage is fine (estimate kicks in later).
        assert!(extract_unary_usage(br#"{"id":"x"}"#).unwrap().is_none());
        // Not JSON at all is fine too.
        assert!(extract_unary_usage(b"plain text").unwrap().is_none());
    }

    #[test]
    fn corrupt_usage_is_a_protocol_error() {
        let body = br#"{"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":9}}"#;
        assert!(matches!(
            extract_unary_usage(body),
            Err(ProxyError::Protocol(_))
        ));
    }
}
