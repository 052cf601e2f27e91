//! Lazily built, cached blob clients.
//!
//! A [`ClientProvider`] owns two slots: the primary client used for data
//! operations and the signing client used to build URLs.  Each slot is
//! filled on first access through the configured [`ClientFactory`] and
//! kept for the provider's lifetime.

use once_cell::sync::OnceCell;
use std::sync::Arc;

use super::azure::AzureBlobClient;
use super::backend::BlobClient;
use super::options::ClientOptions;
use crate::config::StorageConfig;
use crate::errors::BackendError;

/// Builds a client from options.  Must not perform network I/O.
pub type ClientFactory =
    Arc<dyn Fn(&ClientOptions) -> Result<Arc<dyn BlobClient>, BackendError> + Send + Sync>;

/// Factory producing [`AzureBlobClient`]s.
pub fn azure_client_factory() -> ClientFactory {
    Arc::new(|options: &ClientOptions| {
        let client: Arc<dyn BlobClient> = Arc::new(AzureBlobClient::new(options)?);
        Ok(client)
    })
}

/// Memoizing accessor for the primary and signing clients.
pub struct ClientProvider {
    config: Arc<StorageConfig>,
    factory: ClientFactory,
    primary: OnceCell<Arc<dyn BlobClient>>,
    signing: OnceCell<Arc<dyn BlobClient>>,
}

impl ClientProvider {
    pub fn new(config: Arc<StorageConfig>, factory: ClientFactory) -> Self {
        Self {
            config,
            factory,
            primary: OnceCell::new(),
            signing: OnceCell::new(),
        }
    }

    /// Options shared by both clients.
    fn base_options(&self) -> ClientOptions {
        let c = &self.config;
        ClientOptions {
            account_name: c.account_name.clone(),
            account_key: c.account_key.clone(),
            sas_token: c.sas_token.clone(),
            is_emulated: c.emulated_mode,
            protocol: c.protocol().to_string(),
            custom_domain: None,
            connection_string: None,
            token_credential: c.token_credential.clone(),
            endpoint_suffix: c.endpoint_suffix.clone(),
        }
    }

    /// Options for data operations.  The custom domain only applies in
    /// emulated mode, where it names the emulator host.
    pub fn primary_options(&self) -> ClientOptions {
        ClientOptions {
            custom_domain: self
                .config
                .custom_domain
                .clone()
                .filter(|_| self.config.emulated_mode),
            connection_string: self.config.connection_string.clone(),
            ..self.base_options()
        }
    }

    /// Options for URL building: custom domain always, and the custom
    /// connection string when one is set.
    pub fn signing_options(&self) -> ClientOptions {
        ClientOptions {
            custom_domain: self.config.custom_domain.clone(),
            connection_string: self.config.signing_connection_string().cloned(),
            ..self.base_options()
        }
    }

    /// The data client, built on first call.
    pub fn primary_client(&self) -> Result<&Arc<dyn BlobClient>, BackendError> {
        self.primary
            .get_or_try_init(|| (self.factory)(&self.primary_options()))
    }

    /// The URL-signing client, built on first call.
    pub fn signing_client(&self) -> Result<&Arc<dyn BlobClient>, BackendError> {
        self.signing
            .get_or_try_init(|| (self.factory)(&self.signing_options()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;
    use crate::storage::memory::MemoryBlobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> StorageConfig {
        StorageConfig {
            account_name: Some("myaccount".to_string()),
            account_key: Some(Secret::new("a2V5")),
            container: "media".to_string(),
            custom_domain: Some("cdn.example.com".to_string()),
            ..Default::default()
        }
    }

    fn counting_factory(calls: Arc<AtomicUsize>) -> ClientFactory {
        let inner = MemoryBlobStore::new().factory();
        Arc::new(move |options: &ClientOptions| {
            calls.fetch_add(1, Ordering::SeqCst);
            inner(options)
        })
    }

    #[test]
    fn test_clients_are_built_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = ClientProvider::new(Arc::new(config()), counting_factory(calls.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let a = Arc::clone(provider.primary_client().unwrap());
        let b = Arc::clone(provider.primary_client().unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        provider.signing_client().unwrap();
        provider.signing_client().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_custom_domain_only_on_signing_client() {
        let provider = ClientProvider::new(Arc::new(config()), MemoryBlobStore::new().factory());
        assert_eq!(provider.primary_options().custom_domain, None);
        assert_eq!(
            provider.signing_options().custom_domain.as_deref(),
            Some("cdn.example.com")
        );

        let primary = provider.primary_client().unwrap();
        let signing = provider.signing_client().unwrap();
        assert_eq!(
            primary.make_blob_url("media", "a.txt", None),
            "https://myaccount.blob.core.windows.net/media/a.txt"
        );
        assert_eq!(
            signing.make_blob_url("media", "a.txt", None),
            "https://cdn.example.com/media/a.txt"
        );
    }

    #[test]
    fn test_emulated_primary_uses_custom_domain() {
        let cfg = StorageConfig {
            emulated_mode: true,
            custom_domain: Some("azurite:10000".to_string()),
            ssl: false,
            ..Default::default()
        };
        let provider = ClientProvider::new(Arc::new(cfg), MemoryBlobStore::new().factory());
        assert_eq!(
            provider.primary_options().custom_domain.as_deref(),
            Some("azurite:10000")
        );
        assert_eq!(
            provider
                .primary_client()
                .unwrap()
                .make_blob_url("media", "a.txt", None),
            "http://azurite:10000/devstoreaccount1/media/a.txt"
        );
    }

    #[test]
    fn test_signing_connection_string_fallback() {
        let mut cfg = config();
        cfg.connection_string = Some(Secret::new("AccountName=base;AccountKey=a2V5"));
        let provider = ClientProvider::new(Arc::new(cfg.clone()), MemoryBlobStore::new().factory());
        assert_eq!(
            provider
                .signing_options()
                .connection_string
                .as_ref()
                .map(Secret::expose),
            Some("AccountName=base;AccountKey=a2V5")
        );

        cfg.custom_connection_string = Some(Secret::new("AccountName=cdn;AccountKey=a2V5"));
        let provider = ClientProvider::new(Arc::new(cfg), MemoryBlobStore::new().factory());
        assert_eq!(
            provider
                .signing_options()
                .connection_string
                .as_ref()
                .map(Secret::expose),
            Some("AccountName=cdn;AccountKey=a2V5")
        );
        assert_eq!(
            provider
                .primary_options()
                .connection_string
                .as_ref()
                .map(Secret::expose),
            Some("AccountName=base;AccountKey=a2V5")
        );
    }

    #[test]
    fn test_factory_error_is_not_cached() {
        let cfg = StorageConfig::default();
        let provider = ClientProvider::new(Arc::new(cfg), MemoryBlobStore::new().factory());
        assert!(provider.primary_client().is_err());
        assert!(provider.primary_client().is_err());
    }
}
