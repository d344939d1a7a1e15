//! Segment downloader: typed results over a shared HTTP client.
//!
//! The fetcher returns whole bodies as bytes and never interprets them.
//! 404 is reported as its own variant so live sessions can treat it as
//! "segment not yet available"; other 4xx are fatal for the segment; 5xx
//! and transport failures are retried with exponential backoff and jitter.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::{GatewayError, Result};

const MAX_REDIRECTS: usize = 5;

/// Backoff shape for transient download failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied around each delay, e.g. 0.2 for +/-20 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay before retry number `attempt` (1-based), without
    /// jitter: base * 2^(attempt-1), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        exp.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(factor)
    }
}

/// Builds the per-session HTTP client: keep-alive connection reuse, bounded
/// redirects, per-request timeout, and the caller's headers on every request.
pub fn build_client(headers: &HashMap<String, String>, timeout: Duration) -> Result<Client> {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_str(name)
            .map_err(|e| GatewayError::Config(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GatewayError::Config(format!("invalid header value for {name:?}: {e}")))?;
        header_map.insert(name, value);
    }

    Ok(Client::builder()
        .default_headers(header_map)
        .redirect(redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(timeout)
        .build()?)
}

pub struct SegmentFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl SegmentFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Downloads the full response body.
    pub async fn fetch_bytes(&self, url: &Url) -> Result<Bytes> {
        let mut attempt = 1u32;
        loop {
            match self.try_fetch(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(Transient::No(err)) => return Err(err),
                Err(Transient::Yes(reason)) => {
                    if attempt >= self.policy.max_attempts {
                        return Err(GatewayError::Network {
                            url: url.clone(),
                            reason: format!("{reason} (after {attempt} attempts)"),
                        });
                    }
                    let delay = self.policy.jittered(self.policy.delay_for_attempt(attempt));
                    warn!(%url, attempt, ?delay, %reason, "transient download failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Downloads a body expected to be UTF-8 text (manifests).
    pub async fn fetch_text(&self, url: &Url) -> Result<String> {
        let bytes = self.fetch_bytes(url).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| GatewayError::Network {
            url: url.clone(),
            reason: format!("response is not valid UTF-8: {e}"),
        })
    }

    async fn try_fetch(&self, url: &Url) -> std::result::Result<Bytes, Transient> {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return Err(Transient::Yes(format!("request failed: {e}"))),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Transient::No(GatewayError::NotFound(url.clone())));
        }
        if status.is_client_error() {
            return Err(Transient::No(GatewayError::Client {
                status,
                url: url.clone(),
            }));
        }
        if status.is_server_error() {
            return Err(Transient::Yes(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(Transient::No(GatewayError::Network {
                url: url.clone(),
                reason: format!("unexpected status {status}"),
            }));
        }

        match response.bytes().await {
            Ok(bytes) => {
                debug!(%url, len = bytes.len(), "downloaded");
                Ok(bytes)
            }
            Err(e) => Err(Transient::Yes(format!("body read failed: {e}"))),
        }
    }
}

enum Transient {
    Yes(String),
    No(GatewayError),
}
