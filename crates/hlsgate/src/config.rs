use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{GatewayError, Result};

pub const DEFAULT_POLL_INTERVAL: f64 = 4.0;
pub const DEFAULT_WINDOW_SIZE: usize = 6;
pub const DEFAULT_HISTORY_SIZE: usize = 128;
pub const DEFAULT_HTTP_TIMEOUT: f64 = 15.0;

/// Configuration accepted when creating a stream, both over the REST control
/// plane (JSON body) and programmatically.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Source DASH manifest URL.
    pub mpd_url: String,

    /// Single CENC key, 32 hex chars. Requires a KID, either from `kid` or
    /// inferred from the manifest's ContentProtection.
    #[serde(default)]
    pub key: Option<String>,

    /// KID for `key`, 32 hex chars (hyphenated GUIDs accepted).
    #[serde(default)]
    pub kid: Option<String>,

    /// Multi-key map, KID -> key. Takes precedence over `key`/`kid`.
    #[serde(default, alias = "keys")]
    pub key_map: Option<HashMap<String, String>>,

    /// Decryption binary. Defaults to `mp4decrypt` on PATH.
    #[serde(default)]
    pub mp4decrypt_path: Option<PathBuf>,

    /// Force a specific representation instead of automatic selection.
    #[serde(default)]
    pub representation_id: Option<String>,

    /// Display label surfaced in stream listings.
    #[serde(default)]
    pub label: Option<String>,

    /// Manifest refresh cadence in seconds (live only).
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    /// Sliding playlist window length (live only).
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Capacity of the processed-segment history.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Extra HTTP headers sent with every manifest and segment request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Override the per-stream output directory.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,

    /// Per-request HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: f64,
}

fn default_poll_interval() -> f64 {
    DEFAULT_POLL_INTERVAL
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_history_size() -> usize {
    DEFAULT_HISTORY_SIZE
}

fn default_http_timeout() -> f64 {
    DEFAULT_HTTP_TIMEOUT
}

impl StreamConfig {
    pub fn new(mpd_url: impl Into<String>) -> Self {
        Self {
            mpd_url: mpd_url.into(),
            key: None,
            kid: None,
            key_map: None,
            mp4decrypt_path: None,
            representation_id: None,
            label: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            window_size: DEFAULT_WINDOW_SIZE,
            history_size: DEFAULT_HISTORY_SIZE,
            headers: HashMap::new(),
            output_dir: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Validates everything that can be checked without the manifest.
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.mpd_url)
            .map_err(|e| GatewayError::Config(format!("invalid mpd_url: {e}")))?;

        if let Some(key) = &self.key {
            normalize_hex128(key, "key")?;
        }
        if let Some(kid) = &self.kid {
            normalize_hex128(kid, "kid")?;
        }
        if let Some(map) = &self.key_map {
            for (kid, key) in map {
                normalize_hex128(kid, "kid")?;
                normalize_hex128(key, "key")?;
            }
        }
        if self.key_map.as_ref().is_some_and(|m| m.is_empty()) {
            return Err(GatewayError::Config("key_map must not be empty".into()));
        }
        if self.window_size == 0 {
            return Err(GatewayError::Config("window_size must be at least 1".into()));
        }
        if self.history_size == 0 {
            return Err(GatewayError::Config(
                "history_size must be at least 1".into(),
            ));
        }
        if !self.poll_interval.is_finite() || self.poll_interval <= 0.0 {
            return Err(GatewayError::Config(
                "poll_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn mpd_url(&self) -> Result<Url> {
        Url::parse(&self.mpd_url)
            .map_err(|e| GatewayError::Config(format!("invalid mpd_url: {e}")))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout.max(0.1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval.max(0.1))
    }

    pub fn wants_decryption(&self) -> bool {
        self.key.is_some() || self.key_map.is_some()
    }

    /// Builds the normalized KID -> key map for the decryptor.
    ///
    /// A single `key` without an explicit `kid` uses `default_kid`, the KID
    /// advertised by the selected representation's ContentProtection.
    pub fn decryption_keys(&self, default_kid: Option<&str>) -> Result<BTreeMap<String, String>> {
        if let Some(map) = &self.key_map {
            return map
                .iter()
                .map(|(kid, key)| {
                    Ok((
                        normalize_hex128(kid, "kid")?,
                        normalize_hex128(key, "key")?,
                    ))
                })
                .collect();
        }

        let Some(key) = &self.key else {
            return Ok(BTreeMap::new());
        };
        let key = normalize_hex128(key, "key")?;
        let kid = match (&self.kid, default_kid) {
            (Some(kid), _) => normalize_hex128(kid, "kid")?,
            (None, Some(kid)) => normalize_hex128(kid, "kid")?,
            (None, None) => {
                return Err(GatewayError::Config(
                    "a key was supplied but no KID was given and the manifest carries none".into(),
                ))
            }
        };

        let mut keys = BTreeMap::new();
        keys.insert(kid, key);
        Ok(keys)
    }
}

/// Normalizes a 16-byte hex value: strips `0x`, hyphens and case, then
/// checks for exactly 32 hex digits.
pub fn normalize_hex128(value: &str, what: &str) -> Result<String> {
    let trimmed = value.trim();
    let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let normalized: String = trimmed
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if normalized.len() != 32 || hex::decode(&normalized).is_err() {
        return Err(GatewayError::Config(format!(
            "{what} must be 32 hex characters, got {value:?}"
        )));
    }
    Ok(normalized)
}
