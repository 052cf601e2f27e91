//! azstore: logical file storage on Azure Blob Storage.
//!
//! [`AzureStorage`] turns file-style operations (open, save, exists, delete,
//! size, url, modified time, listing) into calls against a single blob
//! container.  Names are validated and confined to a configured location
//! before anything reaches the service.  Blobs are reached through the
//! [`storage::backend::BlobClient`] trait, so the same façade runs against
//! Azure or the in-process [`storage::memory::MemoryBlobStore`].

pub mod azure_storage;
pub mod config;
pub mod content;
pub mod errors;
pub mod file;
pub mod names;
pub mod sas;
pub mod storage;
pub mod time;
pub mod xml;

pub use azure_storage::AzureStorage;
pub use config::{Config, StorageConfig};
pub use content::{ContentFile, ContentSource};
pub use errors::{BackendError, Result, StorageError, ValidationError};
pub use file::{FileHandle, OpenMode};
pub use time::Timestamp;
