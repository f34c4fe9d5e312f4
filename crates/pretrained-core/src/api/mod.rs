//! Caller-facing API.
//!
//! [`PretrainedApi`] is a thin facade over the [`ResolutionService`]: it
//! turns `(name, language, version?)` calls into requests and returns the
//! local path of the committed artifact. Cache maintenance (listing,
//! eviction, pruning) goes straight to the store for the current root.

mod builder;
mod predefined;

pub use builder::PretrainedApiBuilder;
pub use predefined::PredefinedPipeline;

use crate::cancel::CancellationToken;
use crate::error::{PretrainedError, Result};
use crate::resolution::{ResolutionReport, ResolutionService};
use crate::store::ArtifactStore;
use crate::types::{ArtifactKey, ArtifactRecord, ResolveRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Entry point for resolving and caching pretrained artifacts.
///
/// Cheap to clone; clones share in-flight resolutions.
#[derive(Clone)]
pub struct PretrainedApi {
    service: ResolutionService,
}

impl PretrainedApi {
    /// Start configuring an instance.
    pub fn builder() -> PretrainedApiBuilder {
        PretrainedApiBuilder::new()
    }

    pub(crate) fn from_service(service: ResolutionService) -> Self {
        Self { service }
    }

    /// The underlying resolution service.
    pub fn service(&self) -> &ResolutionService {
        &self.service
    }

    // ========================================
    // Resolution
    // ========================================

    /// Resolve a model, downloading it if it is not cached.
    ///
    /// `None` version means the latest release.
    pub async fn resolve_model(
        &self,
        name: &str,
        language: &str,
        version: Option<&str>,
    ) -> Result<PathBuf> {
        self.resolve_path(ResolveRequest::model(name, language, version), None)
            .await
    }

    /// Resolve a model that `reader` can load.
    pub async fn resolve_model_with_reader(
        &self,
        reader: &str,
        name: &str,
        language: &str,
        version: Option<&str>,
    ) -> Result<PathBuf> {
        let request = ResolveRequest::model(name, language, version).with_reader(reader);
        self.resolve_path(request, None).await
    }

    /// Like [`resolve_model`](Self::resolve_model), giving up with
    /// `Cancelled` once `cancel` fires.
    pub async fn resolve_model_with_cancel(
        &self,
        name: &str,
        language: &str,
        version: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.resolve_path(ResolveRequest::model(name, language, version), Some(cancel))
            .await
    }

    /// Resolve a pipeline, downloading it if it is not cached.
    pub async fn resolve_pipeline(
        &self,
        name: &str,
        language: &str,
        version: Option<&str>,
    ) -> Result<PathBuf> {
        self.resolve_path(ResolveRequest::pipeline(name, language, version), None)
            .await
    }

    /// Like [`resolve_pipeline`](Self::resolve_pipeline), giving up with
    /// `Cancelled` once `cancel` fires.
    pub async fn resolve_pipeline_with_cancel(
        &self,
        name: &str,
        language: &str,
        version: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.resolve_path(
            ResolveRequest::pipeline(name, language, version),
            Some(cancel),
        )
        .await
    }

    /// Resolve the latest release of a well-known pipeline.
    pub async fn resolve_predefined_pipeline(&self, pipeline: PredefinedPipeline) -> Result<PathBuf> {
        self.resolve_pipeline(pipeline.name(), pipeline.language(), None)
            .await
    }

    /// Resolve `request`, returning every state it went through.
    pub async fn resolve_with_report(
        &self,
        request: ResolveRequest,
        cancel: Option<&CancellationToken>,
    ) -> ResolutionReport {
        self.service.resolve_with_report(request, cancel).await
    }

    async fn resolve_path(
        &self,
        request: ResolveRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<PathBuf> {
        let record = self
            .service
            .resolve_with_report(request, cancel)
            .await
            .into_result()?;
        Ok(record.local_path)
    }

    // ========================================
    // Configuration
    // ========================================

    /// Current cache root.
    pub fn get_config_path(&self) -> PathBuf {
        self.service.config().get()
    }

    /// Change the cache root for subsequent resolutions.
    ///
    /// Fails with `InvalidPath` if the directory cannot be created or
    /// written; the previous root stays in effect.
    pub fn set_config_path(&self, path: impl AsRef<Path>) -> Result<()> {
        self.service.config().set(path)
    }

    // ========================================
    // Cache maintenance
    // ========================================

    /// Committed artifacts under the current root, least recently used first.
    pub async fn list_cached(&self) -> Result<Vec<ArtifactRecord>> {
        self.with_store(|store| {
            store.refresh()?;
            Ok(store.list())
        })
        .await
    }

    /// Remove one cached artifact. Returns whether it was cached.
    pub async fn evict(&self, name: &str, language: &str, version: &str) -> Result<bool> {
        let key = ArtifactKey::new(name, language, Some(version));
        key.validate()?;
        let evicted = self.with_store(move |store| store.evict(&key)).await?;
        if evicted {
            info!("Evicted {}/{}/{}", name, language, version);
        }
        Ok(evicted)
    }

    /// Evict least-recently-used artifacts until the cache fits `max_bytes`.
    pub async fn prune(&self, max_bytes: u64) -> Result<Vec<ArtifactKey>> {
        self.with_store(move |store| {
            store.refresh()?;
            store.evict_lru(max_bytes)
        })
        .await
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ArtifactStore) -> Result<T> + Send + 'static,
    {
        let store: Arc<ArtifactStore> = self.service.store()?;
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| PretrainedError::Other(format!("Store task failed: {}", e)))?
    }
}
