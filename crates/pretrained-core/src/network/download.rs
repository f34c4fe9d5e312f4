//! Artifact downloader with resume, retry and incremental verification.
//!
//! Provides:
//! - Streaming into a sink file with a rolling SHA-256 (no full buffering)
//! - Resume from an existing prefix via range requests
//! - Retry of transient failures with exponential backoff and jitter
//! - Removal of the partial sink on any terminal failure

use crate::cancel::CancellationToken;
use crate::config::NetworkConfig;
use crate::error::{PretrainedError, Result};
use crate::hashing::RollingChecksum;
use crate::network::client::{HttpClient, StatusClass};
use crate::network::retry::RetryConfig;
use crate::network::transport::DynTransport;
use crate::types::{ArtifactKey, ArtifactLocation, DownloadState};
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Total size of the sink after the fetch.
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of the sink contents.
    pub checksum: String,
}

/// Downloads artifacts into sink files.
pub struct Downloader {
    transport: DynTransport,
    retry: RetryConfig,
    progress_interval: Duration,
}

impl Downloader {
    /// Create a downloader with the default retry policy.
    pub fn new(transport: DynTransport) -> Self {
        Self {
            transport,
            retry: RetryConfig::default(),
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Fetch `location` into `sink`.
    ///
    /// If `sink` already holds a prefix of the artifact the transfer resumes
    /// from it. On success the sink holds exactly the verified artifact; on
    /// any failure (including cancellation) the sink is removed.
    pub async fn fetch(
        &self,
        key: &ArtifactKey,
        location: &ArtifactLocation,
        sink: &Path,
        cancel: &CancellationToken,
        progress_tx: Option<mpsc::Sender<DownloadState>>,
    ) -> Result<FetchOutcome> {
        if let Some(parent) = sink.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PretrainedError::disk("Failed to create directory", parent, e))?;
        }

        let result = self
            .fetch_with_retry(key, location, sink, cancel, progress_tx.as_ref())
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    "Downloaded {} ({} bytes) to {}",
                    key,
                    outcome.bytes_written,
                    sink.display()
                );
                Ok(outcome)
            }
            Err(e) => {
                remove_partial(sink).await;
                Err(e)
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        key: &ArtifactKey,
        location: &ArtifactLocation,
        sink: &Path,
        cancel: &CancellationToken,
        progress_tx: Option<&mpsc::Sender<DownloadState>>,
    ) -> Result<FetchOutcome> {
        let mut attempt: u32 = 0;
        loop {
            cancel.check()?;

            match self
                .download_attempt(key, location, sink, cancel, progress_tx, attempt + 1)
                .await
            {
                Ok(outcome) => {
                    if attempt > 0 {
                        debug!("Download of {} succeeded after {} attempts", key, attempt + 1);
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.calculate_delay(attempt);
                    warn!(
                        "Download attempt {}/{} for {} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        self.retry.max_attempts,
                        key,
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(PretrainedError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(
                            "All {} download attempts for {} exhausted. Last error: {}",
                            self.retry.max_attempts, key, e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Execute a single attempt, resuming from whatever `sink` already holds.
    async fn download_attempt(
        &self,
        key: &ArtifactKey,
        location: &ArtifactLocation,
        sink: &Path,
        cancel: &CancellationToken,
        progress_tx: Option<&mpsc::Sender<DownloadState>>,
        attempt: u32,
    ) -> Result<FetchOutcome> {
        let expected_size = (location.size_bytes > 0).then_some(location.size_bytes);
        let mut resume_from = match tokio::fs::metadata(sink).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if let Some(size) = expected_size {
            if resume_from > size {
                warn!(
                    "Partial file {} is larger than the artifact ({} > {}), discarding",
                    sink.display(),
                    resume_from,
                    size
                );
                remove_partial(sink).await;
                resume_from = 0;
            } else if resume_from == size {
                // A previous run finished the transfer but never committed it.
                let mut checksum = RollingChecksum::new();
                checksum.update_from_file(sink).await?;
                let actual = checksum.finalize_hex();
                if actual == location.expected_checksum {
                    debug!("Partial file {} is already complete", sink.display());
                    return Ok(FetchOutcome {
                        bytes_written: size,
                        checksum: actual,
                    });
                }
                remove_partial(sink).await;
                resume_from = 0;
            }
        }

        let response = tokio::select! {
            response = self.transport.get(&location.url, resume_from) => response?,
            _ = cancel.cancelled() => return Err(PretrainedError::Cancelled),
        };
        let status = response.status;

        let is_resuming = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT.as_u16();
        if !is_resuming {
            match status_class(status) {
                StatusClass::Success => {
                    if resume_from > 0 {
                        warn!("Server does not support range requests, restarting from zero");
                    }
                }
                _ if status == StatusCode::RANGE_NOT_SATISFIABLE.as_u16() => {
                    remove_partial(sink).await;
                    return Err(PretrainedError::TransientNetwork {
                        url: location.url.clone(),
                        message: "Range not satisfiable, restarting from zero".to_string(),
                    });
                }
                StatusClass::Transient => {
                    return Err(PretrainedError::TransientNetwork {
                        url: location.url.clone(),
                        message: format!("HTTP {}", status),
                    });
                }
                StatusClass::Client | StatusClass::Unexpected => {
                    return Err(PretrainedError::Client {
                        url: location.url.clone(),
                        status,
                    });
                }
            }
        }

        let mut checksum = RollingChecksum::new();
        let mut file = if is_resuming {
            info!("Resuming download of {} from byte {}", key, resume_from);
            checksum.update_from_file(sink).await?;
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(sink)
                .await
                .map_err(|e| PretrainedError::disk("Failed to open partial file", sink, e))?
        } else {
            tokio::fs::File::create(sink)
                .await
                .map_err(|e| PretrainedError::disk("Failed to create partial file", sink, e))?
        };

        let mut received: u64 = checksum.bytes();
        let total_bytes = expected_size.or_else(|| {
            response
                .content_length
                .map(|len| if is_resuming { len + resume_from } else { len })
        });

        let mut state = DownloadState {
            key: key.clone(),
            bytes_received: received,
            total_bytes,
            attempt,
        };
        send_progress(progress_tx, &state);

        let mut last_progress_update = Instant::now();
        let mut stream = response.body;

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel.cancelled() => return Err(PretrainedError::Cancelled),
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    // Keep what arrived so the next attempt can resume.
                    let _ = file.flush().await;
                    return Err(e);
                }
            };

            if let Some(size) = expected_size {
                if received + chunk.len() as u64 > size {
                    return Err(PretrainedError::CorruptArtifact {
                        url: location.url.clone(),
                        expected: location.expected_checksum.clone(),
                        actual: format!("more than {} bytes", size),
                    });
                }
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| PretrainedError::disk("Failed to write partial file", sink, e))?;
            checksum.update(&chunk);
            received += chunk.len() as u64;

            if last_progress_update.elapsed() >= self.progress_interval {
                state.bytes_received = received;
                send_progress(progress_tx, &state);
                last_progress_update = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| PretrainedError::disk("Failed to flush partial file", sink, e))?;
        file.sync_all()
            .await
            .map_err(|e| PretrainedError::disk("Failed to sync partial file", sink, e))?;
        drop(file);

        state.bytes_received = received;
        send_progress(progress_tx, &state);

        if let Some(size) = expected_size {
            if received < size {
                return Err(PretrainedError::TransientNetwork {
                    url: location.url.clone(),
                    message: format!("Incomplete download: got {} of {} bytes", received, size),
                });
            }
        }

        let actual = checksum.finalize_hex();
        if actual != location.expected_checksum {
            warn!(
                "Checksum mismatch for {}: expected {}, got {}",
                key, location.expected_checksum, actual
            );
            return Err(PretrainedError::CorruptArtifact {
                url: location.url.clone(),
                expected: location.expected_checksum.clone(),
                actual,
            });
        }

        Ok(FetchOutcome {
            bytes_written: received,
            checksum: actual,
        })
    }
}

fn status_class(status: u16) -> StatusClass {
    match StatusCode::from_u16(status) {
        Ok(code) => HttpClient::classify_status(code),
        Err(_) => StatusClass::Unexpected,
    }
}

fn send_progress(progress_tx: Option<&mpsc::Sender<DownloadState>>, state: &DownloadState) {
    if let Some(tx) = progress_tx {
        // Progress is advisory; a full or closed channel never stalls the transfer.
        let _ = tx.try_send(state.clone());
    }
}

async fn remove_partial(sink: &Path) {
    match tokio::fs::remove_file(sink).await {
        Ok(()) => debug!("Removed partial file {}", sink.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial file {}: {}", sink.display(), e),
    }
}
