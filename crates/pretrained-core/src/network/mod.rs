//! Network layer for registry queries and artifact transfers.
//!
//! This module provides:
//! - Retry logic with exponential backoff and jitter
//! - HTTP client with status classification
//! - Byte transports (HTTP and local `file://` mirrors)
//! - Resumable, verifying artifact downloader

mod client;
mod download;
mod retry;
mod transport;

pub use client::{HttpClient, StatusClass};
pub use download::{Downloader, FetchOutcome};
pub use retry::{retry_async, RetryConfig, RetryStats};
pub use transport::{
    ByteStream, DynTransport, FileTransport, HttpTransport, SchemeTransport, Transport,
    TransportResponse,
};
