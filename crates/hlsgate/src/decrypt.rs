//! CENC decryption through an external `mp4decrypt`-compatible binary.
//!
//! The tool is always driven through temporary files, never stdin/stdout:
//! pipe handling differs between tool versions and fails with the
//! characteristic "cannot open input file (-)" on some of them. Both temp
//! files are removed on every exit path.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};

const DEFAULT_PROGRAM: &str = "mp4decrypt";
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);
const OUTPUT_EXCERPT_LEN: usize = 256;

pub enum Decryptor {
    /// No keys configured: downloaded bytes pass through unchanged.
    Passthrough,
    Mp4Decrypt(Mp4DecryptTool),
}

impl Decryptor {
    pub fn passthrough() -> Self {
        Decryptor::Passthrough
    }

    /// Builds a tool-backed decryptor from a normalized KID -> key map.
    pub fn mp4decrypt(keys: BTreeMap<String, String>, program: Option<PathBuf>) -> Result<Self> {
        if keys.is_empty() {
            return Err(GatewayError::Config(
                "decryption requested but no keys supplied".into(),
            ));
        }
        Ok(Decryptor::Mp4Decrypt(Mp4DecryptTool {
            keys,
            program: program.unwrap_or_else(|| PathBuf::from(DEFAULT_PROGRAM)),
            timeout: SUBPROCESS_TIMEOUT,
        }))
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Decryptor::Passthrough)
    }

    pub async fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Decryptor::Passthrough => Ok(data.to_vec()),
            Decryptor::Mp4Decrypt(tool) => tool.decrypt(data).await,
        }
    }
}

pub struct Mp4DecryptTool {
    keys: BTreeMap<String, String>,
    program: PathBuf,
    timeout: Duration,
}

impl Mp4DecryptTool {
    #[cfg(test)]
    pub(crate) fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(GatewayError::Decryption("no input bytes".into()));
        }

        // NamedTempFile deletes on drop, which covers every return below.
        let input = tempfile::Builder::new()
            .prefix("hlsgate-in-")
            .suffix(".mp4")
            .tempfile()?;
        let output = tempfile::Builder::new()
            .prefix("hlsgate-out-")
            .suffix(".mp4")
            .tempfile()?;

        tokio::fs::write(input.path(), data).await?;

        let mut command = Command::new(&self.program);
        for (kid, key) in &self.keys {
            command.arg("--key").arg(format!("{kid}:{key}"));
        }
        command.arg(input.path()).arg(output.path());
        command.kill_on_drop(true);

        debug!(program = %self.program.display(), len = data.len(), "invoking decryption tool");

        let result = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result,
            Err(_) => {
                return Err(GatewayError::Decryption(format!(
                    "{} timed out after {:?}",
                    self.program.display(),
                    self.timeout
                )))
            }
        };
        let out = result.map_err(|e| {
            GatewayError::Decryption(format!("spawning {}: {e}", self.program.display()))
        })?;

        if !out.status.success() {
            let stderr = excerpt(&out.stderr);
            warn!(status = %out.status, stderr, "decryption tool failed");
            return Err(GatewayError::Decryption(format!(
                "{} exited with {}{}",
                self.program.display(),
                out.status,
                if stderr.is_empty() {
                    String::new()
                } else {
                    format!(": {stderr}")
                }
            )));
        }

        let plain = tokio::fs::read(output.path()).await?;
        if plain.is_empty() {
            return Err(GatewayError::Decryption(format!(
                "{} produced empty output",
                self.program.display()
            )));
        }
        Ok(plain)
    }
}

fn excerpt(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    let text = text.trim();
    if text.len() <= OUTPUT_EXCERPT_LEN {
        text.to_string()
    } else {
        let mut end = OUTPUT_EXCERPT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &text[..end])
    }
}
