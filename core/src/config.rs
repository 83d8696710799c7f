//! Transfer options.
//!
//! # Design
//! `TransferOptions` is the typed replacement for per-handle option ids: an
//! embedding layer maps its own named constants onto these fields. It
//! (de)serializes with camelCase keys so a host can also hand over a JSON
//! object such as `{"connectTimeoutMs": 2000, "followRedirects": true}`.
//! Every field has a default, so partial objects are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Redirect cap applied when `follow_redirects` is on.
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Connect timeout used unless the caller overrides it.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// What to do with trailer fields that follow a chunked body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrailerPolicy {
    #[default]
    Discard,
    /// Keep trailers and report them in `TransferResult::trailers`.
    Merge,
}

/// Options for one `fetch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferOptions {
    /// Per-connection connect timeout in milliseconds; 0 disables it.
    pub connect_timeout_ms: u64,
    /// Deadline for the whole fetch, redirects included; 0 disables it.
    pub total_timeout_ms: u64,
    pub follow_redirects: bool,
    /// Upper bound on requests issued for one redirect chain.
    pub max_redirects: u32,
    pub user_agent: Option<String>,
    /// Extra request headers, sent in order after `Host`.
    pub headers: Vec<(String, String)>,
    pub trailers: TrailerPolicy,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            total_timeout_ms: 0,
            follow_redirects: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            user_agent: Some(default_user_agent()),
            headers: Vec::new(),
            trailers: TrailerPolicy::Discard,
        }
    }
}

impl TransferOptions {
    pub fn from_json(json: &str) -> Result<Self, OptionsError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout_ms)
    }

    pub fn total_timeout(&self) -> Option<Duration> {
        millis(self.total_timeout_ms)
    }
}

/// Error loading `TransferOptions` from JSON.
#[derive(Debug, Error)]
#[error("invalid transfer options: {0}")]
pub struct OptionsError(#[from] serde_json::Error);

pub fn default_user_agent() -> String {
    format!("transfer-core/{}", env!("CARGO_PKG_VERSION"))
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
