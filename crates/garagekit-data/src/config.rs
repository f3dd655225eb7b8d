//! Settings for `gk-data` and `gk-connectivity`.

use garagekit_core::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::backup::DEFAULT_WORKERS;
use crate::object_store::DEFAULT_PAGE_SIZE;

/// S3 endpoint and credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    /// `host:port` or a full URL.
    pub endpoint: String,
    /// Access key id.
    pub access_key: Option<String>,
    /// Secret access key.
    pub secret_key: Option<String>,
    /// Signing region.
    pub region: String,
    /// Use https when the endpoint has no scheme.
    pub secure: bool,
    /// Timeout for a single call.
    pub timeout_secs: u64,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("region", &self.region)
            .field("secure", &self.secure)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            endpoint: String::from("localhost:3900"),
            access_key: None,
            secret_key: None,
            region: String::from("garage"),
            secure: false,
            timeout_secs: 60,
        }
    }
}

impl S3Settings {
    /// Endpoint with a scheme.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else if self.secure {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

/// Settings file for `gk-data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Object store connection.
    pub s3: S3Settings,
    /// Concurrent object transfers.
    pub workers: usize,
    /// Keys per listing page.
    pub page_size: usize,
    /// Retry policy for every object call.
    pub retry: RetryConfig,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            s3: S3Settings::default(),
            workers: DEFAULT_WORKERS,
            page_size: DEFAULT_PAGE_SIZE,
            retry: RetryConfig::default(),
        }
    }
}

impl DataSettings {
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
