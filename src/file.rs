//! Buffered file handles.
//!
//! A [`FileHandle`] reads and writes a blob through a local spooled buffer.
//! Nothing touches the service until the first access: read and append
//! modes then pull the blob into the buffer, write modes start empty.
//! Writes mark the handle dirty; [`FileHandle::close`] uploads a dirty
//! buffer through the owning storage and releases it.
//!
//! ```text
//! Unbuffered --first access--> Buffered { dirty: false }
//!                  write ---> Buffered { dirty: true }
//!     close (upload if dirty) --> Closed
//! ```

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::str::FromStr;
use tempfile::SpooledTempFile;
use tracing::{debug, warn};

use crate::azure_storage::AzureStorage;
use crate::errors::{Result, StorageError};

/// A parsed `open` mode string such as `"rb"`, `"w"` or `"a+"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMode {
    raw: String,
    read: bool,
    write: bool,
    append: bool,
    update: bool,
}

impl FromStr for OpenMode {
    type Err = StorageError;

    /// Exactly one of `r`, `w`, `a`; optionally `+`; optionally `b` or `t`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || StorageError::InvalidMode(s.to_string());
        let count = |c: char| s.chars().filter(|x| *x == c).count();

        if s.chars().any(|c| !"rwa+bt".contains(c)) {
            return Err(invalid());
        }
        if count('r') + count('w') + count('a') != 1 || count('+') > 1 {
            return Err(invalid());
        }
        if count('b') + count('t') > 1 {
            return Err(invalid());
        }

        Ok(Self {
            raw: s.to_string(),
            read: s.contains('r'),
            write: s.contains('w'),
            append: s.contains('a'),
            update: s.contains('+'),
        })
    }
}

impl OpenMode {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `read` is allowed in `r` and `a` modes.
    pub fn can_read(&self) -> bool {
        self.read || self.append
    }

    /// `write` is allowed in `w`, `a` and any `+` mode.
    pub fn can_write(&self) -> bool {
        self.write || self.update || self.append
    }

    /// Whether the current blob content is pulled into the buffer.
    fn fetches(&self) -> bool {
        self.read || self.append
    }

    /// Whether the buffer starts at offset 0 after the fetch.
    fn rewinds(&self) -> bool {
        self.read
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

enum HandleState {
    Unbuffered,
    Buffered {
        buffer: SpooledTempFile,
        dirty: bool,
    },
    Closed,
}

/// File-like access to one blob.
///
/// Obtained from [`AzureStorage::open`].  Single use: once closed, open
/// the name again.
pub struct FileHandle<'s> {
    name: String,
    blob_name: String,
    mode: OpenMode,
    storage: &'s AzureStorage,
    state: HandleState,
}

impl<'s> FileHandle<'s> {
    pub(crate) fn new(storage: &'s AzureStorage, name: String, blob_name: String, mode: OpenMode) -> Self {
        Self {
            name,
            blob_name,
            mode,
            storage,
            state: HandleState::Unbuffered,
        }
    }

    /// The logical name the handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The normalized blob name.
    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    pub fn mode(&self) -> &OpenMode {
        &self.mode
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self.state, HandleState::Buffered { dirty: true, .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, HandleState::Closed)
    }

    /// The buffer and its dirty flag, materialized on first use.
    async fn buffer(&mut self) -> Result<(&mut SpooledTempFile, &mut bool)> {
        if let HandleState::Unbuffered = self.state {
            let mut buffer = self.storage.new_buffer();
            if self.mode.fetches() {
                let n = self.storage.download_into(&self.blob_name, &mut buffer).await?;
                debug!("Buffered {} bytes of '{}'", n, self.blob_name);
            }
            if self.mode.rewinds() {
                buffer.seek(SeekFrom::Start(0))?;
            }
            self.state = HandleState::Buffered {
                buffer,
                dirty: false,
            };
        }

        match &mut self.state {
            HandleState::Buffered { buffer, dirty } => Ok((buffer, dirty)),
            _ => Err(StorageError::Closed {
                name: self.name.clone(),
            }),
        }
    }

    /// Read up to `size` bytes, or everything left when `size` is `None`.
    pub async fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        if !self.mode.can_read() {
            return Err(StorageError::Mode {
                mode: self.mode.to_string(),
                required: "read",
            });
        }
        let (buffer, _) = self.buffer().await?;
        let mut out = Vec::new();
        match size {
            Some(n) => buffer.take(n as u64).read_to_end(&mut out)?,
            None => buffer.read_to_end(&mut out)?,
        };
        Ok(out)
    }

    /// Read everything from the current position to the end.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        self.read(None).await
    }

    /// Write `content` at the current position; returns the byte count.
    pub async fn write(&mut self, content: impl AsRef<[u8]>) -> Result<usize> {
        if !self.mode.can_write() {
            return Err(StorageError::Mode {
                mode: self.mode.to_string(),
                required: "write",
            });
        }
        let bytes = content.as_ref();
        let (buffer, dirty) = self.buffer().await?;
        buffer.write_all(bytes)?;
        *dirty = true;
        Ok(bytes.len())
    }

    /// Move the buffer position.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let (buffer, _) = self.buffer().await?;
        Ok(buffer.seek(pos)?)
    }

    /// Upload pending writes and release the buffer.
    ///
    /// The handle is closed afterwards even when the upload fails.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Buffered {
                mut buffer,
                dirty: true,
            } => {
                buffer.seek(SeekFrom::Start(0))?;
                self.storage.store(&self.name, &mut buffer).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for FileHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            HandleState::Unbuffered => "unbuffered",
            HandleState::Buffered { dirty: false, .. } => "buffered",
            HandleState::Buffered { dirty: true, .. } => "dirty",
            HandleState::Closed => "closed",
        };
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("blob_name", &self.blob_name)
            .field("mode", &self.mode.as_str())
            .field("state", &state)
            .finish()
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        if self.is_dirty() {
            warn!(
                "File handle for '{}' dropped without close(); unsaved writes are lost",
                self.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Secret, StorageConfig};
    use crate::storage::backend::ContentSettings;
    use crate::storage::memory::MemoryBlobStore;
    use chrono::Utc;
    use std::sync::Arc;

    fn storage() -> (AzureStorage, Arc<MemoryBlobStore>) {
        let store = MemoryBlobStore::new();
        let config = StorageConfig {
            account_name: Some("myaccount".to_string()),
            account_key: Some(Secret::new("a2V5")),
            container: "media".to_string(),
            ..Default::default()
        };
        (AzureStorage::with_client_factory(config, store.factory()), store)
    }

    #[test]
    fn test_mode_parsing() {
        for ok in ["r", "rb", "w", "wb", "a", "ab", "r+", "w+", "a+", "rb+", "r+b", "rt"] {
            assert!(ok.parse::<OpenMode>().is_ok(), "{ok}");
        }
        for bad in ["", "x", "rw", "r++", "bt", "rbt", "b"] {
            assert!(
                matches!(bad.parse::<OpenMode>(), Err(StorageError::InvalidMode(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_mode_predicates() {
        let mode = |s: &str| s.parse::<OpenMode>().unwrap();
        assert!(mode("rb").can_read() && !mode("rb").can_write());
        assert!(!mode("wb").can_read() && mode("wb").can_write());
        assert!(mode("a").can_read() && mode("a").can_write());
        assert!(mode("r+").can_read() && mode("r+").can_write());
        assert!(!mode("w+").can_read() && mode("w+").can_write());
    }

    #[tokio::test]
    async fn test_debug_shows_state_not_content() {
        let (storage, _store) = storage();
        let mut handle = storage.open("dir/../a.txt", "wb").unwrap();
        assert_eq!(
            format!("{handle:?}"),
            "FileHandle { name: \"dir/../a.txt\", blob_name: \"a.txt\", mode: \"wb\", state: \"unbuffered\" }"
        );

        handle.write("secret payload").await.unwrap();
        let shown = format!("{handle:?}");
        assert!(shown.contains("state: \"dirty\""), "{shown}");
        assert!(!shown.contains("secret payload"));

        assert!(storage.open("../x", "rb").unwrap_err().is_security());
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_does_not_touch_backend() {
        let (storage, store) = storage();
        let handle = storage.open("missing.txt", "rb").unwrap();
        assert!(!handle.is_dirty());
        assert_eq!(store.downloads(), 0);
    }

    #[tokio::test]
    async fn test_read_fetches_once_and_rewinds() {
        let (storage, store) = storage();
        store
            .insert("media", "a.txt", "hello world", ContentSettings::default(), Utc::now())
            .await;

        let mut handle = storage.open("a.txt", "rb").unwrap();
        assert_eq!(handle.read(Some(5)).await.unwrap(), b"hello");
        assert_eq!(handle.read(None).await.unwrap(), b" world");
        handle.seek(SeekFrom::Start(6)).await.unwrap();
        assert_eq!(handle.read_to_end().await.unwrap(), b"world");
        assert_eq!(store.downloads(), 1);

        handle.close().await.unwrap();
        assert_eq!(store.uploads(), 0);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_write_marks_dirty_and_close_uploads() {
        let (storage, store) = storage();
        let mut handle = storage.open("dir/new.txt", "wb").unwrap();
        assert_eq!(handle.write("abc").await.unwrap(), 3);
        assert_eq!(handle.write(b"def".to_vec()).await.unwrap(), 3);
        assert!(handle.is_dirty());
        assert_eq!(store.downloads(), 0);

        handle.close().await.unwrap();
        assert!(!handle.is_dirty());
        assert_eq!(store.uploads(), 1);
        assert_eq!(
            store.contents("media", "dir/new.txt").await.unwrap().as_ref(),
            b"abcdef"
        );
        let settings = store.settings("media", "dir/new.txt").await.unwrap();
        assert_eq!(settings.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_append_keeps_existing_content() {
        let (storage, store) = storage();
        store
            .insert("media", "log.txt", "one\n", ContentSettings::default(), Utc::now())
            .await;

        let mut handle = storage.open("log.txt", "a").unwrap();
        handle.write("two\n").await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(
            store.contents("media", "log.txt").await.unwrap().as_ref(),
            b"one\ntwo\n"
        );
    }

    #[tokio::test]
    async fn test_append_to_missing_blob_is_not_found() {
        let (storage, _store) = storage();
        let mut handle = storage.open("missing.txt", "a").unwrap();
        assert!(handle.write("x").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_mode_errors() {
        let (storage, store) = storage();
        store
            .insert("media", "a.txt", "data", ContentSettings::default(), Utc::now())
            .await;

        let mut reader = storage.open("a.txt", "rb").unwrap();
        assert!(matches!(
            reader.write("x").await,
            Err(StorageError::Mode { required: "write", .. })
        ));

        let mut writer = storage.open("a.txt", "wb").unwrap();
        assert!(matches!(
            writer.read(None).await,
            Err(StorageError::Mode { required: "read", .. })
        ));
        assert_eq!(store.downloads(), 0);
    }

    #[tokio::test]
    async fn test_close_without_access_is_noop() {
        let (storage, store) = storage();
        let mut handle = storage.open("never.txt", "wb").unwrap();
        handle.close().await.unwrap();
        assert!(handle.is_closed());
        assert_eq!(store.uploads(), 0);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_access_after_close() {
        let (storage, _store) = storage();
        let mut handle = storage.open("a.txt", "wb").unwrap();
        handle.write("x").await.unwrap();
        handle.close().await.unwrap();
        assert!(matches!(
            handle.write("y").await,
            Err(StorageError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_flush_still_closes() {
        let (storage, store) = storage();
        let mut handle = storage.open("a.txt", "wb").unwrap();
        handle.write("x").await.unwrap();

        store.set_unavailable(true);
        assert!(handle.close().await.is_err());
        assert!(handle.is_closed());
        assert!(!handle.is_dirty());
    }

    #[tokio::test]
    async fn test_read_plus_overwrites_from_start() {
        let (storage, store) = storage();
        store
            .insert("media", "a.txt", "hello", ContentSettings::default(), Utc::now())
            .await;

        let mut handle = storage.open("a.txt", "r+").unwrap();
        handle.write("J").await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(
            store.contents("media", "a.txt").await.unwrap().as_ref(),
            b"Jello"
        );
    }

    #[tokio::test]
    async fn test_spills_to_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryBlobStore::new();
        let config = StorageConfig {
            account_name: Some("myaccount".to_string()),
            account_key: Some(Secret::new("a2V5")),
            container: "media".to_string(),
            blob_max_memory_size: 4,
            file_upload_temp_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let storage = AzureStorage::with_client_factory(config, store.factory());

        let mut handle = storage.open("big.bin", "wb").unwrap();
        handle.write(vec![1u8; 64]).await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(
            store.contents("media", "big.bin").await.unwrap().len(),
            64
        );
    }
}
