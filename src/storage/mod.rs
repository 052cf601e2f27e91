//! Blob service clients.
//!
//! The [`backend::BlobClient`] trait abstracts over where blobs physically
//! live.  [`azure::AzureBlobClient`] talks to Azure Blob Storage (or the
//! storage emulator); [`memory::MemoryBlobClient`] keeps blobs in process.
//! [`provider::ClientProvider`] builds and caches the clients a façade uses.

pub mod azure;
pub mod backend;
pub mod memory;
pub mod options;
pub mod provider;
