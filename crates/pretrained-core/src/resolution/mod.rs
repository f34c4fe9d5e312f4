//! Resolution service: locator → cache lookup → downloader → store.
//!
//! Every request runs the state machine
//! `PENDING → RESOLVING → (DOWNLOADING → VERIFYING →)? COMMITTED | FAILED`.
//! Concurrent requests are collapsed twice:
//!
//! - identical requests share one *requested* flight, so the registry is
//!   queried once;
//! - requests resolving to the same concrete artifact (for example `latest`
//!   and `2.3.0`) share one *resolved* flight, so the artifact is downloaded
//!   once.
//!
//! Flight work runs in spawned tasks; callers only wait for the published
//! report. A resolved flight additionally holds a per-artifact file lock so
//! processes sharing the cache root do not download the same artifact twice.

mod flight;
mod state;

pub use state::{ResolutionReport, ResolutionState};

use crate::cancel::CancellationToken;
use crate::config::ConfigStore;
use crate::error::{PretrainedError, Result};
use crate::locator::ResourceLocator;
use crate::network::Downloader;
use crate::store::ArtifactStore;
use crate::types::{ArtifactKey, ArtifactKind, ArtifactLocation, ArtifactRecord, DownloadState, ResolveRequest};
use flight::{FlightRegistry, Joined, Listener};
use state::StateMachine;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Key of a request as the caller phrased it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestedKey {
    root: PathBuf,
    kind: ArtifactKind,
    key: ArtifactKey,
    reader: Option<String>,
}

/// Key of a concrete artifact on disk with the digest the registry lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResolvedKey {
    root: PathBuf,
    key: ArtifactKey,
    checksum: String,
}

struct ServiceInner {
    config: Arc<ConfigStore>,
    locator: ResourceLocator,
    downloader: Downloader,
    progress: Option<mpsc::Sender<DownloadState>>,
    store: Mutex<Option<Arc<ArtifactStore>>>,
    requested: Arc<FlightRegistry<RequestedKey>>,
    resolved: Arc<FlightRegistry<ResolvedKey>>,
}

/// Orchestrates artifact resolution. Cheap to clone; clones share flights.
#[derive(Clone)]
pub struct ResolutionService {
    inner: Arc<ServiceInner>,
}

impl ResolutionService {
    pub fn new(config: Arc<ConfigStore>, locator: ResourceLocator, downloader: Downloader) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                locator,
                downloader,
                progress: None,
                store: Mutex::new(None),
                requested: Arc::new(FlightRegistry::new(
                    "requested",
                    vec![ResolutionState::Pending, ResolutionState::Resolving],
                )),
                resolved: Arc::new(FlightRegistry::new(
                    "resolved",
                    vec![ResolutionState::Resolving],
                )),
            }),
        }
    }

    /// Report download progress on `tx`. Must be called before the service is cloned.
    pub fn with_progress(mut self, tx: mpsc::Sender<DownloadState>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.progress = Some(tx),
            None => warn!("Progress channel ignored: service already shared"),
        }
        self
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.inner.config
    }

    pub fn locator(&self) -> &ResourceLocator {
        &self.inner.locator
    }

    /// Store handle for the currently configured cache root.
    ///
    /// A new handle is opened when the root changed since the last call;
    /// handles obtained earlier keep their old root.
    pub fn store(&self) -> Result<Arc<ArtifactStore>> {
        self.inner.current_store()
    }

    /// Number of resolutions and downloads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.requested.len() + self.inner.resolved.len()
    }

    /// Resolve `request` to a committed artifact.
    pub async fn resolve(&self, request: ResolveRequest) -> Result<ArtifactRecord> {
        self.resolve_with_report(request, None).await.into_result()
    }

    /// Resolve `request`, returning the full state sequence.
    ///
    /// If `cancel` fires first, this caller gets `Cancelled`; other callers
    /// waiting on the same resolution are unaffected.
    pub async fn resolve_with_report(
        &self,
        request: ResolveRequest,
        cancel: Option<&CancellationToken>,
    ) -> ResolutionReport {
        let label = request_label(&request);
        let flight_key = RequestedKey {
            root: self.inner.config.get(),
            kind: request.kind,
            key: request.key.clone(),
            reader: request.reader.clone(),
        };

        let listener = match self.inner.requested.join(flight_key) {
            Ok(Joined::Leader(publisher, listener)) => {
                let inner = self.inner.clone();
                let task_label = label.clone();
                tokio::spawn(async move {
                    let abort = publisher.abort_token();
                    let report = tokio::select! {
                        report = inner.run_requested(request) => report,
                        _ = abort.cancelled() => {
                            let mut machine = StateMachine::new(task_label);
                            machine.advance(ResolutionState::Resolving);
                            machine.fail(PretrainedError::Cancelled)
                        }
                    };
                    publisher.publish(report);
                });
                listener
            }
            Ok(Joined::Follower(listener)) => listener,
            Err(e) => {
                let mut machine = StateMachine::new(label);
                machine.advance(ResolutionState::Resolving);
                return machine.fail(e);
            }
        };

        match listener.wait(cancel).await {
            Some(report) => report,
            None => {
                let mut machine = StateMachine::new(label);
                machine.advance(ResolutionState::Resolving);
                machine.fail(PretrainedError::Cancelled)
            }
        }
    }
}

impl ServiceInner {
    fn current_store(&self) -> Result<Arc<ArtifactStore>> {
        let root = self.config.get();
        let mut current = self.store.lock().map_err(|_| {
            PretrainedError::Other("Store handle lock poisoned".to_string())
        })?;
        if let Some(store) = current.as_ref() {
            if store.root() == root {
                return Ok(store.clone());
            }
            info!(
                "Cache root changed from {} to {}, opening new store",
                store.root().display(),
                root.display()
            );
        }
        let store = Arc::new(ArtifactStore::open(root)?);
        *current = Some(store.clone());
        Ok(store)
    }

    /// Leader work of a requested flight.
    async fn run_requested(self: Arc<Self>, request: ResolveRequest) -> ResolutionReport {
        let mut machine = StateMachine::new(request_label(&request));
        machine.advance(ResolutionState::Resolving);
        let result = self.resolve_requested(&request, &mut machine).await;
        let report = machine.finish(result);
        match &report.result {
            Ok(record) => info!(
                "Resolved {} {} to {}",
                request.kind,
                request.key,
                record.local_path.display()
            ),
            Err(e) => warn!("Resolution of {} {} failed: {}", request.kind, request.key, e),
        }
        report
    }

    async fn resolve_requested(
        self: &Arc<Self>,
        request: &ResolveRequest,
        machine: &mut StateMachine,
    ) -> Result<ArtifactRecord> {
        let store = self.current_store()?;
        let located = self
            .locator
            .locate(request.kind, &request.key, request.reader.as_deref())
            .await?;
        let resolved_key = request.key.with_version(&located.resolved_version);

        if let Some(record) = cached_match(&store, &resolved_key, &located.location)? {
            debug!("Cache hit for {}", resolved_key);
            let record = touch_or_keep(&store, record);
            machine.advance(ResolutionState::Committed);
            return Ok(record);
        }

        let flight_key = ResolvedKey {
            root: store.root().to_path_buf(),
            key: resolved_key.clone(),
            checksum: located.location.expected_checksum.clone(),
        };
        let listener: Listener<ResolvedKey> = match self.resolved.join(flight_key)? {
            Joined::Leader(publisher, listener) => {
                let inner = self.clone();
                let kind = request.kind;
                let location = located.location;
                tokio::spawn(async move {
                    let abort = publisher.abort_token();
                    let report = inner
                        .run_resolved(store, kind, resolved_key, location, abort)
                        .await;
                    publisher.publish(report);
                });
                listener
            }
            Joined::Follower(listener) => listener,
        };

        let report = listener.wait(None).await.ok_or(PretrainedError::Cancelled)?;
        // The resolved flight's report starts at RESOLVING, which we already hold.
        for state in report.transitions.iter().skip(1) {
            machine.advance(*state);
        }
        report.result
    }

    /// Leader work of a resolved flight: lock, re-check, download, commit.
    async fn run_resolved(
        self: Arc<Self>,
        store: Arc<ArtifactStore>,
        kind: ArtifactKind,
        key: ArtifactKey,
        location: ArtifactLocation,
        abort: CancellationToken,
    ) -> ResolutionReport {
        let mut machine = StateMachine::resume_from(key.to_string(), ResolutionState::Resolving);
        let result = self
            .download_and_commit(&store, kind, &key, &location, &abort, &mut machine)
            .await;
        machine.finish(result)
    }

    async fn download_and_commit(
        &self,
        store: &Arc<ArtifactStore>,
        kind: ArtifactKind,
        key: &ArtifactKey,
        location: &ArtifactLocation,
        abort: &CancellationToken,
        machine: &mut StateMachine,
    ) -> Result<ArtifactRecord> {
        let lock = {
            let store = store.clone();
            let key = key.clone();
            let locking = tokio::task::spawn_blocking(move || store.lock_artifact(&key));
            tokio::select! {
                joined = locking => joined
                    .map_err(|e| PretrainedError::Other(format!("Lock task failed: {}", e)))??,
                _ = abort.cancelled() => return Err(PretrainedError::Cancelled),
            }
        };

        // Another process may have committed while we waited for the lock.
        store.refresh()?;
        if let Some(record) = cached_match(store, key, location)? {
            info!("{} was committed by another process", key);
            let record = touch_or_keep(store, record);
            machine.advance(ResolutionState::Committed);
            return Ok(record);
        }

        machine.advance(ResolutionState::Downloading);
        let partial = store.partial_path(key);
        let outcome = self
            .downloader
            .fetch(key, location, &partial, abort, self.progress.clone())
            .await?;
        debug!("Fetched {} ({} bytes), verifying", key, outcome.bytes_written);

        machine.advance(ResolutionState::Verifying);
        let committed = {
            let store = store.clone();
            let key = key.clone();
            let partial = partial.clone();
            let expected = location.expected_checksum.clone();
            tokio::task::spawn_blocking(move || store.commit_staged(kind, &key, &partial, &expected))
                .await
                .map_err(|e| PretrainedError::Other(format!("Commit task failed: {}", e)))?
        };
        drop(lock);

        match committed {
            Ok(record) => {
                machine.advance(ResolutionState::Committed);
                Ok(record)
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove {}: {}", partial.display(), remove_err);
                    }
                }
                Err(e)
            }
        }
    }
}

/// Committed record for `key`, if its content is the one `location` lists.
///
/// A record with another digest (a republished version, or the other
/// catalogue's artifact in the same slot) is a miss; committing the download
/// replaces it.
fn cached_match(
    store: &ArtifactStore,
    key: &ArtifactKey,
    location: &ArtifactLocation,
) -> Result<Option<ArtifactRecord>> {
    match store.lookup(key)? {
        Some(record) if record.checksum == location.expected_checksum => Ok(Some(record)),
        Some(record) => {
            info!(
                "Cached {} {} has digest {}, registry lists {}; downloading again",
                record.kind, key, record.checksum, location.expected_checksum
            );
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Touch a cache hit; an index write failure does not fail the hit.
fn touch_or_keep(store: &ArtifactStore, record: ArtifactRecord) -> ArtifactRecord {
    match store.touch(&record.key) {
        Ok(Some(touched)) => touched,
        Ok(None) => record,
        Err(e) => {
            warn!("Failed to update last use of {}: {}", record.key, e);
            record
        }
    }
}

fn request_label(request: &ResolveRequest) -> String {
    match &request.reader {
        Some(reader) => format!("{} {} ({})", request.kind, request.key, reader),
        None => format!("{} {}", request.kind, request.key),
    }
}
