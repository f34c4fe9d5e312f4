//! Builder for configuring PretrainedApi initialization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::PretrainedApi;
use crate::config::{ConfigStore, Settings};
use crate::error::{PretrainedError, Result};
use crate::locator::{DynRegistryIndex, HttpRegistryIndex, ResourceLocator, StaticRegistryIndex};
use crate::network::{Downloader, DynTransport, HttpClient, RetryConfig, SchemeTransport};
use crate::resolution::ResolutionService;
use crate::resource::{ExternalResource, ReadAs};
use crate::types::DownloadState;

/// Builder for configuring PretrainedApi initialization.
///
/// Exactly one registry source is used, in this order of precedence:
/// [`registry_index`](Self::registry_index),
/// [`registry_resource`](Self::registry_resource), then the registry URL from
/// [`Settings`] or [`registry_url`](Self::registry_url).
///
/// # Example
///
/// ```rust,ignore
/// use pretrained_core::PretrainedApi;
///
/// let api = PretrainedApi::builder()
///     .registry_url("https://registry.example.com/index.json")
///     .cache_root("/var/cache/pretrained")
///     .build()
///     .await?;
/// ```
pub struct PretrainedApiBuilder {
    settings: Settings,
    config: Option<Arc<ConfigStore>>,
    registry: Option<DynRegistryIndex>,
    registry_resource: Option<ExternalResource>,
    transport: Option<DynTransport>,
    retry: Option<RetryConfig>,
    progress: Option<mpsc::Sender<DownloadState>>,
}

impl PretrainedApiBuilder {
    /// Create a builder seeded from environment overrides.
    pub fn new() -> Self {
        Self::from_settings(Settings::from_env())
    }

    /// Create a builder from explicit settings.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            config: None,
            registry: None,
            registry_resource: None,
            transport: None,
            retry: None,
            progress: None,
        }
    }

    /// URL of the registry index. `file://` URLs load a local index file.
    pub fn registry_url(mut self, url: impl Into<String>) -> Self {
        self.settings.registry_url = Some(url.into());
        self
    }

    /// Use an already constructed registry index.
    pub fn registry_index(mut self, index: DynRegistryIndex) -> Self {
        self.registry = Some(index);
        self
    }

    /// Load the registry index from a local resource.
    pub fn registry_resource(mut self, resource: ExternalResource) -> Self {
        self.registry_resource = Some(resource);
        self
    }

    /// Cache root for a private config store.
    ///
    /// Ignored when [`config_store`](Self::config_store) is set.
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.settings.cache_root = Some(root.into());
        self
    }

    /// Share a config store with other components.
    ///
    /// Default: a private store when a cache root is configured, otherwise
    /// [`ConfigStore::global`].
    pub fn config_store(mut self, config: Arc<ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    /// Transport used for artifact downloads.
    ///
    /// Default: HTTP(S) plus `file://`.
    pub fn transport(mut self, transport: DynTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Download retry policy. Overrides the retry fields of [`Settings`].
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Channel receiving download progress.
    pub fn progress(mut self, tx: mpsc::Sender<DownloadState>) -> Self {
        self.progress = Some(tx);
        self
    }

    fn retry_config(&self) -> RetryConfig {
        if let Some(retry) = &self.retry {
            return retry.clone();
        }
        let mut retry = RetryConfig::new();
        if let Some(attempts) = self.settings.max_attempts {
            retry = retry.with_max_attempts(attempts);
        }
        if let Some(delay_ms) = self.settings.base_delay_ms {
            retry = retry.with_base_delay(Duration::from_millis(delay_ms));
        }
        retry
    }

    async fn registry(&mut self, http: &HttpClient) -> Result<DynRegistryIndex> {
        if let Some(index) = self.registry.take() {
            return Ok(index);
        }
        if let Some(resource) = self.registry_resource.take() {
            return Ok(Arc::new(StaticRegistryIndex::from_resource(&resource).await?));
        }

        let url = self
            .settings
            .registry_url
            .clone()
            .ok_or_else(|| PretrainedError::Config {
                message: "No registry configured: set a registry URL or index".to_string(),
            })?;

        match url::Url::parse(&url) {
            Ok(parsed) if parsed.scheme() == "file" => {
                let path = parsed.to_file_path().map_err(|_| PretrainedError::Config {
                    message: format!("Invalid registry file URL: {}", url),
                })?;
                let resource = ExternalResource::new(path, ReadAs::Text);
                Ok(Arc::new(StaticRegistryIndex::from_resource(&resource).await?))
            }
            Ok(_) => Ok(Arc::new(HttpRegistryIndex::new(url, http.clone()))),
            Err(e) => Err(PretrainedError::Config {
                message: format!("Invalid registry URL {:?}: {}", url, e),
            }),
        }
    }

    /// Build the PretrainedApi instance.
    pub async fn build(mut self) -> Result<PretrainedApi> {
        let http = HttpClient::with_timeout(self.settings.request_timeout())?;
        let registry = self.registry(&http).await?;

        let config = match self.config.take() {
            Some(config) => config,
            None if self.settings.cache_root.is_some() => {
                Arc::new(ConfigStore::from_settings(&self.settings))
            }
            None => ConfigStore::global(),
        };

        let transport = self
            .transport
            .take()
            .unwrap_or_else(|| Arc::new(SchemeTransport::new(http)));
        let retry = self.retry_config();
        debug!(
            "Download retry policy: {} attempts, base delay {:?}",
            retry.max_attempts, retry.base_delay
        );

        let locator = ResourceLocator::new(registry);
        let downloader = Downloader::new(transport).with_retry(retry);
        let mut service = ResolutionService::new(config, locator, downloader);
        if let Some(tx) = self.progress.take() {
            service = service.with_progress(tx);
        }

        info!(
            "Pretrained API ready (registry: {}, cache root: {})",
            service.locator().source(),
            service.config().get().display()
        );
        Ok(PretrainedApi::from_service(service))
    }
}

impl Default for PretrainedApiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_without_registry_fails() {
        let temp_dir = TempDir::new().unwrap();
        let result = PretrainedApiBuilder::from_settings(Settings::default())
            .cache_root(temp_dir.path())
            .build()
            .await;
        assert!(matches!(result, Err(PretrainedError::Config { .. })));
    }

    #[tokio::test]
    async fn test_build_with_file_registry_url() {
        let temp_dir = TempDir::new().unwrap();
        let index = temp_dir.path().join("index.json");
        std::fs::write(&index, "[]").unwrap();
        let url = url::Url::from_file_path(&index).unwrap().to_string();

        let api = PretrainedApiBuilder::from_settings(Settings::default())
            .registry_url(url)
            .cache_root(temp_dir.path().join("cache"))
            .build()
            .await
            .unwrap();
        assert_eq!(api.get_config_path(), temp_dir.path().join("cache"));
        assert_eq!(api.service().locator().source(), index.display().to_string());
    }

    #[tokio::test]
    async fn test_invalid_registry_url() {
        let result = PretrainedApiBuilder::from_settings(Settings::default())
            .registry_url("not a url")
            .cache_root("/tmp/unused")
            .build()
            .await;
        assert!(matches!(result, Err(PretrainedError::Config { .. })));
    }

    #[test]
    fn test_retry_from_settings() {
        let settings = Settings {
            max_attempts: Some(2),
            base_delay_ms: Some(10),
            ..Settings::default()
        };
        let retry = PretrainedApiBuilder::from_settings(settings).retry_config();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.base_delay, Duration::from_millis(10));
    }
}
