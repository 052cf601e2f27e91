//! Abstract blob client trait.
//!
//! Every blob service client must implement [`BlobClient`].  The trait is
//! the storage façade's only view of the backend: a handle that can check,
//! describe, stream, upload, delete and list blobs in a container, and
//! build (optionally signed) URLs for them.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::time::Duration;

use crate::errors::BackendError;
use crate::sas::BlobSasPermissions;
use crate::time::Timestamp;

/// Boxed future returned by [`BlobClient`] methods.
pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Properties of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub last_modified: Timestamp,
    pub etag: Option<String>,
}

/// A blob returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    pub name: String,
    pub content_length: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// HTTP properties stored with an uploaded blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentSettings {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

/// Per-call transfer knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Upper bound on parallel requests for one transfer.
    pub max_connections: usize,
    /// Applies to each request of the transfer.
    pub timeout: Duration,
}

impl TransferOptions {
    pub fn new(max_connections: usize, timeout: Duration) -> Self {
        Self {
            max_connections: max_connections.max(1),
            timeout,
        }
    }
}

/// Async blob service contract.
///
/// Constructing a client must not perform network I/O.
pub trait BlobClient: Send + Sync + 'static {
    /// Check whether `blob` exists.
    fn exists<'a>(&'a self, container: &'a str, blob: &'a str, timeout: Duration)
        -> BlobFuture<'a, bool>;

    /// Fetch the properties of `blob`; [`BackendError::NotFound`] if absent.
    fn get_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        timeout: Duration,
    ) -> BlobFuture<'a, BlobProperties>;

    /// Stream the content of `blob` into `writer`, returning the byte count.
    fn get_to_writer<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        writer: &'a mut (dyn Write + Send),
        options: TransferOptions,
    ) -> BlobFuture<'a, u64>;

    /// Create or replace `blob` with everything `reader` yields.
    fn create_from_reader<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        reader: &'a mut (dyn Read + Send),
        settings: ContentSettings,
        options: TransferOptions,
    ) -> BlobFuture<'a, ()>;

    /// Delete `blob`; [`BackendError::NotFound`] if absent.
    fn delete<'a>(&'a self, container: &'a str, blob: &'a str, timeout: Duration)
        -> BlobFuture<'a, ()>;

    /// All blobs whose name starts with `prefix`, across every page.
    fn list<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
        timeout: Duration,
    ) -> BlobFuture<'a, Vec<BlobItem>>;

    /// A SAS token (query string without `?`) for one blob.
    fn generate_blob_sas(
        &self,
        container: &str,
        blob: &str,
        permissions: BlobSasPermissions,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<String, BackendError>;

    /// URL of `blob`, with `sas_token` appended when given.
    fn make_blob_url(&self, container: &str, blob: &str, sas_token: Option<&str>) -> String;
}
