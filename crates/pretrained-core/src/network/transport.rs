//! Byte transports used by the downloader.
//!
//! The downloader only needs "GET this URL from byte N"; the [`Transport`]
//! trait captures that so artifacts can come from HTTP(S) or from a local
//! `file://` mirror.

use crate::error::{PretrainedError, Result};
use crate::network::client::HttpClient;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Chunk size used when streaming local files.
const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Response to a transport request.
pub struct TransportResponse {
    /// HTTP-equivalent status: 200 full body, 206 partial, 404 missing,
    /// 416 range not satisfiable.
    pub status: u16,
    /// Length of `body` if known.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Source of artifact bytes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Request `url`, asking for bytes from `offset` onwards when non-zero.
    ///
    /// Implementations may ignore the offset and answer 200 with the full
    /// body; the caller then restarts from zero.
    async fn get(&self, url: &str, offset: u64) -> Result<TransportResponse>;
}

/// Shared handle to a transport.
pub type DynTransport = Arc<dyn Transport>;

/// Transport over reqwest.
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, offset: u64) -> Result<TransportResponse> {
        let response = self.http.get_from_offset(url, offset).await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let url = url.to_string();
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| PretrainedError::TransientNetwork {
                    url: url.clone(),
                    message: format!("Download stream error: {}", e),
                })
            })
            .boxed();

        Ok(TransportResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Transport serving `file://` URLs from the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct FileTransport;

impl FileTransport {
    fn path_from_url(url: &str) -> Result<PathBuf> {
        let parsed = url::Url::parse(url).map_err(|e| PretrainedError::Client {
            url: format!("{} ({})", url, e),
            status: 400,
        })?;
        parsed.to_file_path().map_err(|_| PretrainedError::Client {
            url: url.to_string(),
            status: 400,
        })
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn get(&self, url: &str, offset: u64) -> Result<TransportResponse> {
        let path = Self::path_from_url(url)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TransportResponse {
                    status: 404,
                    content_length: None,
                    body: stream::empty().boxed(),
                });
            }
            Err(e) => return Err(PretrainedError::disk_with_path(e, &path)),
        };

        let len = file
            .metadata()
            .await
            .map_err(|e| PretrainedError::disk_with_path(e, &path))?
            .len();

        if offset > 0 && offset >= len {
            return Ok(TransportResponse {
                status: 416,
                content_length: None,
                body: stream::empty().boxed(),
            });
        }

        let status = if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| PretrainedError::disk_with_path(e, &path))?;
            206
        } else {
            200
        };
        debug!("Serving {} from byte {} ({} bytes)", path.display(), offset, len - offset);

        let body = stream::unfold(Some((file, path)), |state| async move {
            let (mut file, path) = state?;
            let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
            match file.read(&mut buffer).await {
                Ok(0) => None,
                Ok(read) => {
                    buffer.truncate(read);
                    Some((Ok(Bytes::from(buffer)), Some((file, path))))
                }
                Err(e) => Some((Err(PretrainedError::disk_with_path(e, &path)), None)),
            }
        })
        .boxed();

        Ok(TransportResponse {
            status,
            content_length: Some(len - offset),
            body,
        })
    }
}

/// Dispatches by URL scheme: `file://` locally, everything else over HTTP.
pub struct SchemeTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl SchemeTransport {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http: HttpTransport::new(http),
            file: FileTransport,
        }
    }
}

#[async_trait]
impl Transport for SchemeTransport {
    async fn get(&self, url: &str, offset: u64) -> Result<TransportResponse> {
        if url.starts_with("file:") {
            self.file.get(url, offset).await
        } else {
            self.http.get(url, offset).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn collect(body: ByteStream) -> Vec<u8> {
        let chunks: Vec<Result<Bytes>> = body.collect().await;
        chunks
            .into_iter()
            .flat_map(|c| c.unwrap().to_vec())
            .collect()
    }

    fn file_url(path: &std::path::Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_file_transport_full_body() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("artifact.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let response = FileTransport.get(&file_url(&path), 0).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_length, Some(10));
        assert_eq!(collect(response.body).await, b"0123456789");
    }

    #[tokio::test]
    async fn test_file_transport_range() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("artifact.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let response = FileTransport.get(&file_url(&path), 4).await.unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.content_length, Some(6));
        assert_eq!(collect(response.body).await, b"456789");

        let past_end = FileTransport.get(&file_url(&path), 10).await.unwrap();
        assert_eq!(past_end.status, 416);
    }

    #[tokio::test]
    async fn test_file_transport_missing_is_404() {
        let temp_dir = TempDir::new().unwrap();
        let response = FileTransport
            .get(&file_url(&temp_dir.path().join("missing")), 0)
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_file_transport_rejects_non_file_url() {
        let err = FileTransport.get("https://example.com/a", 0).await.unwrap_err();
        assert!(matches!(err, PretrainedError::Client { status: 400, .. }));
    }
}
