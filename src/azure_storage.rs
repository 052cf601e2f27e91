//! The storage façade.
//!
//! [`AzureStorage`] maps logical file operations onto one blob container.
//! Logical names are cleaned, joined under the configured `location` and
//! validated before any call reaches the service; the resulting blob name
//! is what the service sees.

use chrono::{NaiveDateTime, Utc};
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;
use tempfile::SpooledTempFile;
use tracing::debug;

use crate::config::StorageConfig;
use crate::content::{guess_type, resolve_content_type, ContentSource};
use crate::errors::{BackendError, Result, StorageError};
use crate::file::{FileHandle, OpenMode};
use crate::names::{
    alternative_name, clean_name, get_available_overwrite_name, normalize_name, split_name,
    truncate_root, AZURE_NAME_MAX_LEN, UNIQUE_SUFFIX_LEN,
};
use crate::sas::BlobSasPermissions;
use crate::storage::backend::{BlobClient, ContentSettings, TransferOptions};
use crate::storage::provider::{azure_client_factory, ClientFactory, ClientProvider};
use crate::time::{convert_modified_time, DisplayTimeZone, Timestamp};

/// Placeholder used to measure the prefix added by normalization.
const SAMPLE_NAME: &str = "foo";

/// Reads a [`ContentSource`] as a plain `Read + Send` stream.
struct SourceReader<'a>(&'a mut dyn ContentSource);

impl Read for SourceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

/// Logical file storage on one Azure blob container.
pub struct AzureStorage {
    config: Arc<StorageConfig>,
    clients: ClientProvider,
    time_zone: DisplayTimeZone,
}

impl AzureStorage {
    /// Storage talking to Azure Blob Storage.
    pub fn new(config: StorageConfig) -> Self {
        Self::with_client_factory(config, azure_client_factory())
    }

    /// Storage whose clients come from `factory`.
    pub fn with_client_factory(config: StorageConfig, factory: ClientFactory) -> Self {
        Self::from_shared(Arc::new(config), factory)
    }

    /// Storage over a config shared with other instances.
    pub fn from_shared(config: Arc<StorageConfig>, factory: ClientFactory) -> Self {
        let time_zone = config.display_time_zone();
        Self {
            clients: ClientProvider::new(Arc::clone(&config), factory),
            config,
            time_zone,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn container(&self) -> &str {
        &self.config.container
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.connection_timeout_secs)
    }

    fn client(&self) -> Result<&Arc<dyn BlobClient>> {
        Ok(self.clients.primary_client()?)
    }

    fn signing_client(&self) -> Result<&Arc<dyn BlobClient>> {
        Ok(self.clients.signing_client()?)
    }

    /// The blob name `name` is stored under.
    pub fn valid_path(&self, name: &str) -> Result<String> {
        normalize_name(name, &self.config.location)
    }

    /// Open `name` with a mode such as `"rb"`, `"wb"` or `"a"`.
    ///
    /// The mode and the name are checked here; the service is not contacted
    /// until the handle is first read or written.
    pub fn open(&self, name: &str, mode: &str) -> Result<FileHandle<'_>> {
        let mode: OpenMode = mode.parse()?;
        let blob_name = self.valid_path(name)?;
        Ok(FileHandle::new(self, name.to_string(), blob_name, mode))
    }

    /// Empty spooled buffer for a file handle.
    pub(crate) fn new_buffer(&self) -> SpooledTempFile {
        let max_size = self.config.blob_max_memory_size;
        match &self.config.file_upload_temp_dir {
            Some(dir) => SpooledTempFile::new_in(max_size, dir),
            None => SpooledTempFile::new(max_size),
        }
    }

    /// Stream a blob into `writer` over a single connection.
    pub(crate) async fn download_into(
        &self,
        blob_name: &str,
        writer: &mut (dyn Write + Send),
    ) -> Result<u64> {
        let options = TransferOptions::new(1, self.timeout());
        Ok(self
            .client()?
            .get_to_writer(self.container(), blob_name, writer, options)
            .await?)
    }

    /// Upload `content` under `name` and return the cleaned name.
    ///
    /// The content type comes from the source, a wrapped source, the file
    /// extension, or the configured default, in that order.  The content
    /// encoding is guessed from the extension.
    pub async fn store(&self, name: &str, content: &mut dyn ContentSource) -> Result<String> {
        let cleaned = clean_name(name);
        let blob_name = self.valid_path(&cleaned)?;

        let content_type =
            resolve_content_type(&*content, &blob_name, &self.config.default_content_type);
        let (_, content_encoding) = guess_type(&blob_name);
        let settings = ContentSettings {
            content_type: Some(content_type),
            content_encoding,
        };

        content.seek(SeekFrom::Start(0))?;
        let options = TransferOptions::new(self.config.upload_max_conn, self.timeout());
        self.client()?
            .create_from_reader(
                self.container(),
                &blob_name,
                &mut SourceReader(content),
                settings,
                options,
            )
            .await?;

        Ok(cleaned)
    }

    /// Pick a free name for `name`, then store `content` under it.
    pub async fn save(
        &self,
        name: &str,
        content: &mut dyn ContentSource,
        max_length: Option<usize>,
    ) -> Result<String> {
        let name = self.get_available_name(name, max_length).await?;
        self.store(&name, content).await
    }

    /// A name not taken yet, derived from `name`.
    ///
    /// With `overwrite_files` the cleaned name is returned (truncated to
    /// `max_length` if needed).  Otherwise a random suffix is appended to
    /// the file root until the name is free and fits.
    pub async fn get_available_name(&self, name: &str, max_length: Option<usize>) -> Result<String> {
        let name = clean_name(name);
        if self.config.overwrite_files {
            return get_available_overwrite_name(&name, max_length);
        }

        let (dir, root, ext) = split_name(&name);
        if dir.split('/').any(|segment| segment == "..") || matches!(root, "" | "." | "..") {
            return Err(StorageError::SuspiciousPath { name });
        }
        let (dir, mut root, ext) = (dir.to_string(), root.to_string(), ext.to_string());

        let too_long = |candidate: &str| max_length.is_some_and(|max| candidate.chars().count() > max);
        let mut candidate = name.clone();
        while too_long(&candidate) || self.exists(&candidate).await? {
            candidate = alternative_name(&dir, &root, &ext);
            if let Some(max) = max_length {
                if candidate.chars().count() > max {
                    root = truncate_root(&candidate, &root, max)?.to_string();
                    candidate = alternative_name(&dir, &root, &ext);
                }
            }
        }
        Ok(candidate)
    }

    /// Whether `name` is stored.
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let blob_name = self.valid_path(name)?;
        Ok(self
            .client()?
            .exists(self.container(), &blob_name, self.timeout())
            .await?)
    }

    /// Delete `name`.  Deleting a missing name succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let blob_name = self.valid_path(name)?;
        match self
            .client()?
            .delete(self.container(), &blob_name, self.timeout())
            .await
        {
            Ok(()) => Ok(()),
            Err(BackendError::NotFound { .. }) => {
                debug!("Delete of missing blob '{}' ignored", blob_name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Size of `name` in bytes.
    pub async fn size(&self, name: &str) -> Result<u64> {
        let blob_name = self.valid_path(name)?;
        let properties = self
            .client()?
            .get_properties(self.container(), &blob_name, self.timeout())
            .await?;
        Ok(properties.content_length)
    }

    /// URL of `name`.
    ///
    /// With an expiry (`expire`, else `url_expiration_secs`) other than zero
    /// the URL carries a read-only SAS valid from now until now + expiry.
    pub async fn url(&self, name: &str, expire: Option<u64>) -> Result<String> {
        let blob_name = self.valid_path(name)?;
        let client = self.signing_client()?;

        let sas_token = match expire.or(self.config.url_expiration_secs) {
            Some(secs) if secs > 0 => {
                let start = Utc::now();
                let expiry = i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|lifetime| start.checked_add_signed(lifetime))
                    .ok_or(StorageError::InvalidExpiry { secs })?;
                Some(client.generate_blob_sas(
                    self.container(),
                    &blob_name,
                    BlobSasPermissions::READ,
                    start,
                    expiry,
                )?)
            }
            _ => None,
        };

        Ok(client.make_blob_url(self.container(), &blob_name, sas_token.as_deref()))
    }

    /// Last modification time of `name`.
    ///
    /// Aware and in the configured zone when `use_tz` is set, naive
    /// wall-clock time in that zone otherwise.
    pub async fn get_modified_time(&self, name: &str) -> Result<Timestamp> {
        let blob_name = self.valid_path(name)?;
        let properties = self
            .client()?
            .get_properties(self.container(), &blob_name, self.timeout())
            .await?;
        Ok(convert_modified_time(
            properties.last_modified,
            self.config.use_tz,
            &self.time_zone,
        ))
    }

    /// Last modification time of `name` as naive wall-clock time.
    pub async fn modified_time(&self, name: &str) -> Result<NaiveDateTime> {
        Ok(self
            .get_modified_time(name)
            .await?
            .to_naive(&self.time_zone))
    }

    /// Listing prefix for `path`: its blob name plus `/`, or empty for the
    /// container root.
    fn list_prefix(&self, path: &str) -> Result<String> {
        if path.is_empty() && self.config.location.is_empty() {
            return Ok(String::new());
        }
        let mut prefix = self.valid_path(path)?;
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Ok(prefix)
    }

    /// Every blob name under `path`.
    pub async fn list_all(&self, path: &str) -> Result<Vec<String>> {
        let prefix = self.list_prefix(path)?;
        let items = self
            .client()?
            .list(self.container(), &prefix, self.timeout())
            .await?;
        Ok(items.into_iter().map(|item| item.name).collect())
    }

    /// Immediate subdirectories and files under `path`.
    pub async fn listdir(&self, path: &str) -> Result<(BTreeSet<String>, Vec<String>)> {
        let prefix = self.list_prefix(path)?;
        let items = self
            .client()?
            .list(self.container(), &prefix, self.timeout())
            .await?;

        let mut dirs = BTreeSet::new();
        let mut files = Vec::new();
        for item in items {
            let rest = item.name.strip_prefix(&prefix).unwrap_or(&item.name);
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(dir.to_string());
                }
                None => files.push(rest.to_string()),
            }
        }
        Ok((dirs, files))
    }

    /// Longest logical name that still fits the service limit.
    ///
    /// Accounts for the `location` prefix and, unless files are
    /// overwritten, the `_xxxxxxx` suffix of an alternative name.  The
    /// bound is advisory: names that normalize differently from a plain
    /// file name may gain or lose a few characters.
    pub fn get_name_max_len(&self) -> Result<usize> {
        let sample = self.valid_path(SAMPLE_NAME)?;
        let overhead = sample.chars().count() - SAMPLE_NAME.len();
        let mut max_len = AZURE_NAME_MAX_LEN.saturating_sub(overhead);
        if !self.config.overwrite_files {
            max_len = max_len.saturating_sub(UNIQUE_SUFFIX_LEN + 1);
        }
        Ok(max_len)
    }
}
