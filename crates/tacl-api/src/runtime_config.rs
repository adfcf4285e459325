//! Process-level transfer knobs (chunk size, thresholds, retry budget, refresh windows).
//!
//! Distinct from the domain config/session files owned by [`crate::token::store`]: those are
//! data (api keys, token pairs), this is process configuration loaded `ConfigManager`-style -
//! JSON-or-defaults, `#[serde(default)]` for forward compatibility.

use crate::environment::Environment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MEGABYTE: u64 = 1024 * 1024;
const GIGABYTE: u64 = 1024 * MEGABYTE;

/// Process-wide transfer configuration. Cloned cheaply and threaded through a
/// [`crate::transport::TransferContext`] rather than read from a global on every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Chunk size used by the resumable PATCH protocol. Default 50 MB.
    pub chunk_size_bytes: u64,
    /// Files at or below this size use the single streaming PUT path. Default 1 GB.
    pub resumable_threshold_bytes: u64,
    /// Retry wrapper's starting attempt counter.
    pub retry_attempts: u32,
    /// Sleep duration between a connection failure and the rebuilt-pool retry.
    pub retry_sleep: Duration,
    /// Connect timeout applied to the underlying HTTP client.
    pub connect_timeout: Duration,
    /// Window before `refresh_target` during which `maybe_refresh` will proactively refresh.
    pub refresh_before: Duration,
    /// Window after `refresh_target` during which `maybe_refresh` will still refresh.
    pub refresh_after: Duration,
    /// Page size requested from paginated listing endpoints.
    pub list_page_size: u32,
    /// Overrides every environment's resolved API base URL when set. Not part of the on-disk
    /// config's documented surface - left `None` in every serialized default - but threaded
    /// through so integration tests can point a `DirectorySyncRequest`/`UploadRequest`/
    /// `DownloadRequest` at a `wiremock` server instead of a real `Environment` host.
    #[serde(skip)]
    pub base_url_override: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 50 * MEGABYTE,
            resumable_threshold_bytes: GIGABYTE,
            retry_attempts: 5,
            retry_sleep: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            refresh_before: Duration::from_secs(5 * 60),
            refresh_after: Duration::from_secs(10 * 60),
            list_page_size: 100,
            base_url_override: None,
        }
    }
}

impl RuntimeConfig {
    /// The API base URL a caller should build requests against for `env`: `base_url_override`
    /// with `/v1` appended when set, otherwise `env.api_base()` (which already ends in `/v1`).
    /// Every URL-building helper in `upload`, `download`, `transport`, and `crypto` goes through
    /// this rather than calling `env.api_base()` directly, so a test can point a real
    /// `Environment` at a `wiremock` server and still build the same `/v1/...` paths production
    /// code would.
    pub fn api_base(&self, env: Environment) -> String {
        match &self.base_url_override {
            Some(base) => format!("{base}/v1"),
            None => env.api_base(),
        }
    }

    /// An instance with `base_url_override` set to `base`, otherwise identical. For tests that
    /// want to exercise production request-building code against a mock server.
    pub fn with_base_url_override(mut self, base: impl Into<String>) -> Self {
        self.base_url_override = Some(base.into());
        self
    }

    /// Load from `path`, falling back to defaults for a missing file or missing fields.
    pub fn load_from_path(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "runtime config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content).unwrap_or_else(|err| {
            tracing::warn!(target: "config", %err, "failed to parse runtime config, using defaults");
            Self::default()
        });
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tacl").join("runtime.json"))
    }
}
