//! In-memory blob client.
//!
//! Blobs live in a [`MemoryBlobStore`]: a `tokio::sync::RwLock<HashMap<...>>`
//! keyed by `(container, name)`.  Any number of [`MemoryBlobClient`]s can
//! share one store, the way two real clients share one storage account, so
//! a primary client and a signing client built from different options see
//! the same blobs.
//!
//! The store counts uploads and downloads and can be switched to an
//! unavailable mode in which every call fails with HTTP 503.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::backend::{
    BlobClient, BlobFuture, BlobItem, BlobProperties, ContentSettings, TransferOptions,
};
use super::options::{ClientOptions, ResolvedAccount};
use super::provider::ClientFactory;
use crate::errors::BackendError;
use crate::sas::BlobSasPermissions;

/// A stored blob.
#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    settings: ContentSettings,
    last_modified: DateTime<Utc>,
    etag: String,
}

impl StoredBlob {
    fn new(data: Bytes, settings: ContentSettings, last_modified: DateTime<Utc>) -> Self {
        let mut hasher = Md5::new();
        hasher.update(&data);
        let etag = format!("\"{}\"", BASE64_STANDARD.encode(hasher.finalize()));
        Self {
            data,
            settings,
            last_modified,
            etag,
        }
    }
}

/// Blob data shared by every [`MemoryBlobClient`] built from it.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    /// `(container, blob name)` -> blob.
    blobs: RwLock<HashMap<(String, String), StoredBlob>>,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client over this store for the account described by `options`.
    pub fn client(self: &Arc<Self>, options: &ClientOptions) -> Result<MemoryBlobClient, BackendError> {
        Ok(MemoryBlobClient {
            store: Arc::clone(self),
            account: options.resolve()?,
        })
    }

    /// A client factory handing out clients over this store.
    pub fn factory(self: &Arc<Self>) -> ClientFactory {
        let store = Arc::clone(self);
        Arc::new(move |options: &ClientOptions| {
            let client: Arc<dyn BlobClient> = Arc::new(store.client(options)?);
            Ok(client)
        })
    }

    /// Store a blob directly, with an explicit modification time.
    pub async fn insert(
        &self,
        container: &str,
        name: &str,
        data: impl Into<Bytes>,
        settings: ContentSettings,
        last_modified: DateTime<Utc>,
    ) {
        let blob = StoredBlob::new(data.into(), settings, last_modified);
        self.blobs
            .write()
            .await
            .insert((container.to_string(), name.to_string()), blob);
    }

    /// Content of a blob, if present.
    pub async fn contents(&self, container: &str, name: &str) -> Option<Bytes> {
        self.blobs
            .read()
            .await
            .get(&(container.to_string(), name.to_string()))
            .map(|b| b.data.clone())
    }

    /// Content settings stored with a blob, if present.
    pub async fn settings(&self, container: &str, name: &str) -> Option<ContentSettings> {
        self.blobs
            .read()
            .await
            .get(&(container.to_string(), name.to_string()))
            .map(|b| b.settings.clone())
    }

    /// Sorted names of every blob in `container`.
    pub async fn names(&self, container: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .read()
            .await
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, n)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Completed uploads so far.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Completed downloads so far.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with HTTP 503 (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &'static str) -> Result<(), BackendError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Http {
                operation,
                status: 503,
                body: "ServerBusy".to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, container: &str, blob: &str) -> Result<StoredBlob, BackendError> {
        self.blobs
            .read()
            .await
            .get(&(container.to_string(), blob.to_string()))
            .cloned()
            .ok_or_else(|| BackendError::NotFound {
                name: format!("{container}/{blob}"),
            })
    }
}

/// [`BlobClient`] over a [`MemoryBlobStore`].
#[derive(Clone)]
pub struct MemoryBlobClient {
    store: Arc<MemoryBlobStore>,
    account: ResolvedAccount,
}

impl MemoryBlobClient {
    pub fn account(&self) -> &ResolvedAccount {
        &self.account
    }

    pub fn store(&self) -> &Arc<MemoryBlobStore> {
        &self.store
    }
}

impl BlobClient for MemoryBlobClient {
    fn exists<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        _timeout: Duration,
    ) -> BlobFuture<'a, bool> {
        Box::pin(async move {
            self.store.check_available("exists")?;
            Ok(self
                .store
                .blobs
                .read()
                .await
                .contains_key(&(container.to_string(), blob.to_string())))
        })
    }

    fn get_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        _timeout: Duration,
    ) -> BlobFuture<'a, BlobProperties> {
        Box::pin(async move {
            self.store.check_available("get_properties")?;
            let stored = self.store.get(container, blob).await?;
            Ok(BlobProperties {
                content_length: stored.data.len() as u64,
                content_type: stored.settings.content_type,
                content_encoding: stored.settings.content_encoding,
                last_modified: stored.last_modified.into(),
                etag: Some(stored.etag),
            })
        })
    }

    fn get_to_writer<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        writer: &'a mut (dyn Write + Send),
        _options: TransferOptions,
    ) -> BlobFuture<'a, u64> {
        Box::pin(async move {
            self.store.check_available("download")?;
            let stored = self.store.get(container, blob).await?;
            writer.write_all(&stored.data)?;
            writer.flush()?;
            self.store.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(stored.data.len() as u64)
        })
    }

    fn create_from_reader<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        reader: &'a mut (dyn Read + Send),
        settings: ContentSettings,
        _options: TransferOptions,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            self.store.check_available("upload")?;
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            self.store
                .insert(container, blob, data, settings, Utc::now())
                .await;
            self.store.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        _timeout: Duration,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            self.store.check_available("delete")?;
            self.store
                .blobs
                .write()
                .await
                .remove(&(container.to_string(), blob.to_string()))
                .map(|_| ())
                .ok_or_else(|| BackendError::NotFound {
                    name: format!("{container}/{blob}"),
                })
        })
    }

    fn list<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
        _timeout: Duration,
    ) -> BlobFuture<'a, Vec<BlobItem>> {
        Box::pin(async move {
            self.store.check_available("list_blobs")?;
            let mut items: Vec<BlobItem> = self
                .store
                .blobs
                .read()
                .await
                .iter()
                .filter(|((c, name), _)| c == container && name.starts_with(prefix))
                .map(|((_, name), stored)| BlobItem {
                    name: name.clone(),
                    content_length: stored.data.len() as u64,
                    last_modified: Some(stored.last_modified),
                })
                .collect();
            items.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(items)
        })
    }

    fn generate_blob_sas(
        &self,
        container: &str,
        blob: &str,
        permissions: BlobSasPermissions,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<String, BackendError> {
        self.account
            .blob_sas(container, blob, permissions, start, expiry)
    }

    fn make_blob_url(&self, container: &str, blob: &str, sas_token: Option<&str>) -> String {
        self.account.blob_url(container, blob, sas_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use crate::time::Timestamp;
    use chrono::TimeZone;
    use std::io::Cursor;

    const T: Duration = Duration::from_secs(20);

    fn options() -> ClientOptions {
        ClientOptions {
            account_name: Some("myaccount".to_string()),
            account_key: Some(Secret::new("a2V5")),
            protocol: "https".to_string(),
            ..Default::default()
        }
    }

    fn transfer() -> TransferOptions {
        TransferOptions::new(2, T)
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let store = MemoryBlobStore::new();
        let client = store.client(&options()).unwrap();

        let mut src = Cursor::new(b"hello".to_vec());
        let settings = ContentSettings {
            content_type: Some("text/plain".to_string()),
            content_encoding: None,
        };
        client
            .create_from_reader("media", "a.txt", &mut src, settings.clone(), transfer())
            .await
            .unwrap();
        assert_eq!(store.uploads(), 1);
        assert_eq!(store.settings("media", "a.txt").await, Some(settings));

        let mut out = Vec::new();
        let n = client
            .get_to_writer("media", "a.txt", &mut out, transfer())
            .await
            .unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
        assert_eq!(store.downloads(), 1);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let store = MemoryBlobStore::new();
        let client = store.client(&options()).unwrap();

        assert!(!client.exists("media", "nope", T).await.unwrap());
        assert!(client
            .get_properties("media", "nope", T)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(client
            .delete("media", "nope", T)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_properties_and_listing() {
        let store = MemoryBlobStore::new();
        let when = Utc.with_ymd_and_hms(2022, 3, 1, 8, 12, 34).unwrap();
        store
            .insert("media", "dir/b.txt", "bb", ContentSettings::default(), when)
            .await;
        store
            .insert("media", "dir/a.txt", "a", ContentSettings::default(), when)
            .await;
        store
            .insert("media", "other.txt", "o", ContentSettings::default(), when)
            .await;
        store
            .insert("other", "dir/x.txt", "x", ContentSettings::default(), when)
            .await;
        let client = store.client(&options()).unwrap();

        let props = client.get_properties("media", "dir/b.txt", T).await.unwrap();
        assert_eq!(props.content_length, 2);
        assert_eq!(props.last_modified, Timestamp::from(when));
        assert!(props.etag.is_some());

        let names: Vec<String> = client
            .list("media", "dir/", T)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["dir/a.txt", "dir/b.txt"]);
        assert_eq!(client.list("media", "", T).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_clients_share_store() {
        let store = MemoryBlobStore::new();
        let factory = store.factory();
        let a = factory(&options()).unwrap();
        let b = factory(&options()).unwrap();

        let mut src = Cursor::new(b"x".to_vec());
        a.create_from_reader("media", "shared.txt", &mut src, ContentSettings::default(), transfer())
            .await
            .unwrap();
        assert!(b.exists("media", "shared.txt", T).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_mode() {
        let store = MemoryBlobStore::new();
        let client = store.client(&options()).unwrap();
        store.set_unavailable(true);

        match client.exists("media", "a.txt", T).await {
            Err(BackendError::Http { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected 503, got {other:?}"),
        }

        store.set_unavailable(false);
        assert!(!client.exists("media", "a.txt", T).await.unwrap());
    }

    #[test]
    fn test_urls_follow_account() {
        let store = MemoryBlobStore::new();
        let client = store.client(&options()).unwrap();
        assert_eq!(
            client.make_blob_url("media", "a b.txt", None),
            "https://myaccount.blob.core.windows.net/media/a%20b.txt"
        );
        let now = Utc::now();
        let token = client
            .generate_blob_sas("media", "a b.txt", BlobSasPermissions::READ, now, now)
            .unwrap();
        assert!(token.contains("sp=r"));
    }
}
