//! Settings file for `gk-bootstrap`.

use garagekit_core::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Admin API connection and run settings for `gk-bootstrap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminSettings {
    /// Admin API base URL.
    pub endpoint: String,
    /// Bearer token. Usually supplied through the environment instead.
    pub token: Option<String>,
    /// Timeout for a single call.
    pub request_timeout_secs: u64,
    /// How long to wait for the cluster before a run.
    pub ready_timeout_secs: u64,
    /// Poll interval while waiting.
    pub ready_interval_ms: u64,
    /// Wait for the health check before a run.
    pub wait_for_ready: bool,
    /// Retry policy for every call.
    pub retry: RetryConfig,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            endpoint: String::from("http://localhost:3903"),
            token: None,
            request_timeout_secs: 30,
            ready_timeout_secs: 120,
            ready_interval_ms: 2000,
            wait_for_ready: true,
            retry: RetryConfig::default(),
        }
    }
}

impl AdminSettings {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported settings file extension: {}", ext),
        }
    }
}
