//! HTTP client shared by the registry index and the downloader.
//!
//! Wraps reqwest with:
//! - Separate timeouts for short registry queries and long downloads
//! - Status-code classification into client/transient failures
//! - User-agent management

use crate::config::NetworkConfig;
use crate::error::{PretrainedError, Result};
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// How a non-success HTTP status should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx.
    Success,
    /// Worth retrying: 408, 429 and 5xx.
    Transient,
    /// Any other 4xx; retrying cannot help.
    Client,
    /// Anything else (1xx/3xx leaking through redirects).
    Unexpected,
}

/// HTTP client with request and download timeouts.
#[derive(Debug, Clone)]
pub struct HttpClient {
    /// Client for short requests (has a total timeout).
    client: Client,
    /// Client for downloads (connect timeout only, no total timeout).
    download_client: Client,
}

impl HttpClient {
    /// Create a new HTTP client with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_timeout(NetworkConfig::REQUEST_TIMEOUT)
    }

    /// Create a new HTTP client with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| PretrainedError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let download_client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| PretrainedError::Config {
                message: format!("Failed to create download client: {}", e),
            })?;

        Ok(Self {
            client,
            download_client,
        })
    }

    /// Make a GET request. Non-success statuses are returned, not mapped.
    pub async fn get(&self, url: &str) -> Result<Response> {
        debug!("GET {}", url);
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| PretrainedError::TransientNetwork {
                url: url.to_string(),
                message: format!("GET failed: {}", e),
            })
    }

    /// Start a download request, asking for bytes from `offset` onwards when non-zero.
    pub async fn get_from_offset(&self, url: &str, offset: u64) -> Result<Response> {
        let mut request = self.download_client.get(url);
        if offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", offset));
            debug!("GET {} (range from byte {})", url, offset);
        } else {
            debug!("GET {}", url);
        }

        request
            .send()
            .await
            .map_err(|e| PretrainedError::TransientNetwork {
                url: url.to_string(),
                message: format!("Download request failed: {}", e),
            })
    }

    /// Classify an HTTP status code.
    pub fn classify_status(status: StatusCode) -> StatusClass {
        match status.as_u16() {
            200..=299 => StatusClass::Success,
            408 | 429 | 500..=599 => StatusClass::Transient,
            400..=499 => StatusClass::Client,
            _ => StatusClass::Unexpected,
        }
    }
}
