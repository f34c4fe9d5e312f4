//! Pretrained Core - resolution, download and caching of pretrained artifacts.
//!
//! This crate maps `(name, language, version?)` requests for models and
//! pipelines to concrete artifacts listed by a registry index, downloads
//! them when missing, and keeps them in an on-disk cache that is safe to
//! share between tasks and processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use pretrained_core::{PredefinedPipeline, PretrainedApi};
//!
//! #[tokio::main]
//! async fn main() -> pretrained_core::Result<()> {
//!     let api = PretrainedApi::builder()
//!         .registry_url("https://registry.example.com/index.json")
//!         .build()
//!         .await?;
//!
//!     // Latest release of a model
//!     let path = api.resolve_model("pos_tagger", "en", None).await?;
//!     println!("Model at {}", path.display());
//!
//!     // A pinned pipeline
//!     let path = api.resolve_predefined_pipeline(PredefinedPipeline::ExplainDocumentMl).await?;
//!     println!("Pipeline at {}", path.display());
//!
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod hashing;
pub mod locator;
pub mod network;
pub mod resolution;
pub mod resource;
pub mod rules;
pub mod store;
pub mod types;

mod api;

// Re-export commonly used types
pub use api::{PredefinedPipeline, PretrainedApi, PretrainedApiBuilder};
pub use cancel::{CancellationToken, CancelledError};
pub use config::{ConfigStore, Settings};
pub use error::{ErrorKind, PretrainedError, Result};
pub use locator::{
    DynRegistryIndex, HttpRegistryIndex, IndexEntry, RegistryIndex, ResourceLocator,
    StaticRegistryIndex,
};
pub use network::{Downloader, DynTransport, RetryConfig, Transport, TransportResponse};
pub use resolution::{ResolutionReport, ResolutionService, ResolutionState};
pub use resource::{ExternalResource, ReadAs};
pub use rules::RegexRule;
pub use store::ArtifactStore;
pub use types::{
    ArtifactKey, ArtifactKind, ArtifactLocation, ArtifactRecord, DownloadState, LocatedArtifact,
    ResolveRequest, LATEST_VERSION,
};
