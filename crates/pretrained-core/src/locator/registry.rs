//! Registry indexes listing the artifacts available for download.
//!
//! A registry index is a JSON document, either a bare array of entries or an
//! object with an `artifacts` array:
//!
//! ```json
//! {"artifacts": [
//!   {"name": "pos_tagger", "language": "en", "version": "2.3.0",
//!    "kind": "model", "url": "pos_tagger_en_2.3.0.zip",
//!    "sha256": "…", "size": 1048576, "reader": "PerceptronModel"}
//! ]}
//! ```
//!
//! Relative entry URLs are resolved against the location of the index.

use crate::config::NetworkConfig;
use crate::error::{PretrainedError, Result};
use crate::network::{retry_async, HttpClient, RetryConfig, StatusClass};
use crate::resource::ExternalResource;
use crate::types::ArtifactKind;
use async_trait::async_trait;
use mini_moka::sync::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One downloadable artifact listed by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub language: String,
    pub version: String,
    #[serde(default = "default_kind")]
    pub kind: ArtifactKind,
    pub url: String,
    pub sha256: String,
    /// Size in bytes; 0 when unknown.
    #[serde(default)]
    pub size: u64,
    /// Model class able to load the artifact, if the registry declares one.
    #[serde(default)]
    pub reader: Option<String>,
}

fn default_kind() -> ArtifactKind {
    ArtifactKind::Model
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IndexDocument {
    Entries(Vec<IndexEntry>),
    Wrapped { artifacts: Vec<IndexEntry> },
}

/// Parse an index document, resolving relative URLs against `base`.
pub fn parse_index(text: &str, base: Option<&url::Url>) -> serde_json::Result<Vec<IndexEntry>> {
    let document: IndexDocument = serde_json::from_str(text)?;
    let mut entries = match document {
        IndexDocument::Entries(entries) => entries,
        IndexDocument::Wrapped { artifacts } => artifacts,
    };
    if let Some(base) = base {
        for entry in &mut entries {
            match base.join(&entry.url) {
                Ok(resolved) => entry.url = resolved.to_string(),
                Err(e) => warn!("Cannot resolve entry URL {:?}: {}", entry.url, e),
            }
        }
    }
    Ok(entries)
}

/// Source of registry entries.
#[async_trait]
pub trait RegistryIndex: Send + Sync {
    /// Human-readable location of the index, used in errors.
    fn source(&self) -> &str;

    /// Current entries.
    ///
    /// Fails with `RegistryUnavailable` when the index cannot be reached or
    /// parsed.
    async fn entries(&self) -> Result<Arc<Vec<IndexEntry>>>;
}

/// Shared handle to a registry index.
pub type DynRegistryIndex = Arc<dyn RegistryIndex>;

/// Registry index fetched over HTTP and cached in memory with a TTL.
pub struct HttpRegistryIndex {
    url: String,
    base: Option<url::Url>,
    http: HttpClient,
    retry: RetryConfig,
    cache: Cache<String, Arc<Vec<IndexEntry>>>,
}

impl HttpRegistryIndex {
    pub fn new(url: impl Into<String>, http: HttpClient) -> Self {
        Self::with_ttl(url, http, NetworkConfig::REGISTRY_INDEX_TTL)
    }

    pub fn with_ttl(url: impl Into<String>, http: HttpClient, ttl: Duration) -> Self {
        let url = url.into();
        Self {
            base: url::Url::parse(&url).ok(),
            url,
            http,
            retry: RetryConfig::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(500)),
            cache: Cache::builder().time_to_live(ttl).max_capacity(1).build(),
        }
    }

    /// Override the retry policy used for index requests.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Drop the cached index so the next query refetches it.
    pub fn invalidate(&self) {
        self.cache.invalidate(&self.url);
    }

    async fn fetch(&self) -> Result<Vec<IndexEntry>> {
        let url = self.url.clone();
        let http = self.http.clone();

        let (result, stats) = retry_async(
            &self.retry,
            || {
                let http = http.clone();
                let url = url.clone();
                async move {
                    let response = http.get(&url).await?;
                    let status = response.status();
                    match HttpClient::classify_status(status) {
                        StatusClass::Success => {}
                        StatusClass::Transient => {
                            return Err(PretrainedError::TransientNetwork {
                                url,
                                message: format!("HTTP {}", status),
                            })
                        }
                        StatusClass::Client | StatusClass::Unexpected => {
                            return Err(PretrainedError::Client {
                                url,
                                status: status.as_u16(),
                            })
                        }
                    }
                    response.text().await.map_err(|e| PretrainedError::TransientNetwork {
                        url,
                        message: format!("Failed to read index body: {}", e),
                    })
                }
            },
            |e: &PretrainedError| e.is_retryable(),
        )
        .await;

        let text = result.map_err(|e| {
            warn!(
                "Registry index {} unavailable after {} attempts: {}",
                self.url, stats.attempts, e
            );
            PretrainedError::RegistryUnavailable {
                url: self.url.clone(),
                message: e.to_string(),
            }
        })?;

        parse_index(&text, self.base.as_ref()).map_err(|e| PretrainedError::RegistryUnavailable {
            url: self.url.clone(),
            message: format!("Malformed index: {}", e),
        })
    }
}

#[async_trait]
impl RegistryIndex for HttpRegistryIndex {
    fn source(&self) -> &str {
        &self.url
    }

    async fn entries(&self) -> Result<Arc<Vec<IndexEntry>>> {
        if let Some(entries) = self.cache.get(&self.url) {
            debug!("Registry index cache hit for {}", self.url);
            return Ok(entries);
        }

        let entries = Arc::new(self.fetch().await?);
        info!("Fetched {} registry entries from {}", entries.len(), self.url);
        self.cache.insert(self.url.clone(), entries.clone());
        Ok(entries)
    }
}

/// Registry index held in memory.
#[derive(Debug, Clone)]
pub struct StaticRegistryIndex {
    source: String,
    entries: Arc<Vec<IndexEntry>>,
}

impl StaticRegistryIndex {
    pub fn new(entries: Vec<IndexEntry>) -> Self {
        Self {
            source: "static".to_string(),
            entries: Arc::new(entries),
        }
    }

    /// Load an index file described by `resource`.
    ///
    /// Relative entry URLs resolve against the file's directory, so an index
    /// can sit next to the artifacts it lists.
    pub async fn from_resource(resource: &ExternalResource) -> Result<Self> {
        let source = resource.path().display().to_string();
        let format = resource.format();
        if format != "json" {
            return Err(PretrainedError::Validation {
                field: ExternalResource::FORMAT_OPTION.to_string(),
                message: format!("unsupported registry index format {:?}", format),
            });
        }

        let unavailable = |message: String| PretrainedError::RegistryUnavailable {
            url: source.clone(),
            message,
        };

        let text = resource.read_text().await.map_err(|e| unavailable(e.to_string()))?;
        let absolute = tokio::fs::canonicalize(resource.path())
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        let base = url::Url::from_file_path(&absolute).ok();
        let entries = parse_index(&text, base.as_ref())
            .map_err(|e| unavailable(format!("Malformed index: {}", e)))?;

        debug!("Loaded {} registry entries from {}", entries.len(), source);
        Ok(Self {
            source,
            entries: Arc::new(entries),
        })
    }
}

#[async_trait]
impl RegistryIndex for StaticRegistryIndex {
    fn source(&self) -> &str {
        &self.source
    }

    async fn entries(&self) -> Result<Arc<Vec<IndexEntry>>> {
        Ok(self.entries.clone())
    }
}
