//! Client construction parameters.
//!
//! [`ClientOptions`] is what the client provider hands to a client
//! factory.  [`ClientOptions::resolve`] turns it into a concrete endpoint
//! and credential, taking a connection string into account when one is set.
//! Resolution is pure; no request is made.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::fmt;

use crate::config::Secret;
use crate::errors::BackendError;
use crate::sas::{BlobSasPermissions, BlobSharedAccessSignature};

/// Well-known storage emulator account.
pub const EMULATOR_ACCOUNT_NAME: &str = "devstoreaccount1";
/// Well-known storage emulator key (public, documented by Microsoft).
pub const EMULATOR_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
/// Default emulator blob host.
pub const EMULATOR_BLOB_HOST: &str = "127.0.0.1:10000";
/// DNS suffix of the public cloud.
pub const DEFAULT_ENDPOINT_SUFFIX: &str = "core.windows.net";

/// Everything a client needs to be built.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub account_name: Option<String>,
    pub account_key: Option<Secret>,
    pub sas_token: Option<Secret>,
    pub is_emulated: bool,
    /// `https` or `http`.
    pub protocol: String,
    pub custom_domain: Option<String>,
    pub connection_string: Option<Secret>,
    pub token_credential: Option<Secret>,
    pub endpoint_suffix: Option<String>,
}

/// How requests are authorized.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Shared Key signing with the decoded account key.
    SharedKey { key: Vec<u8> },
    /// A pre-issued SAS token, without leading `?`.
    SasToken(String),
    /// OAuth bearer token.
    BearerToken(String),
    /// Public access.
    Anonymous,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::SharedKey { .. } => f.write_str("SharedKey(***)"),
            Credential::SasToken(_) => f.write_str("SasToken(***)"),
            Credential::BearerToken(_) => f.write_str("BearerToken(***)"),
            Credential::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Endpoint and credential derived from [`ClientOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccount {
    pub account: String,
    /// Base URL without trailing slash, e.g. `https://acct.blob.core.windows.net`.
    pub endpoint: String,
    pub credential: Credential,
}

impl ResolvedAccount {
    /// URL path component of the endpoint (`/devstoreaccount1` for the
    /// emulator, empty otherwise).
    pub fn endpoint_path(&self) -> &str {
        let after_scheme = self
            .endpoint
            .split_once("://")
            .map_or(self.endpoint.as_str(), |(_, rest)| rest);
        match after_scheme.find('/') {
            Some(idx) => after_scheme[idx..].trim_end_matches('/'),
            None => "",
        }
    }
}

/// Percent-encoding set for blob names in URLs: unreserved characters,
/// `/` and `!*()'` pass through.
pub const BLOB_NAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/')
    .remove(b'!')
    .remove(b'*')
    .remove(b'(')
    .remove(b')')
    .remove(b'\'');

impl ResolvedAccount {
    /// `{endpoint}/{container}`.
    pub fn container_url(&self, container: &str) -> String {
        format!("{}/{}", self.endpoint, container)
    }

    /// `{endpoint}/{container}/{encoded blob}`, plus `?{sas_token}` if given.
    pub fn blob_url(&self, container: &str, blob: &str, sas_token: Option<&str>) -> String {
        let url = format!(
            "{}/{}",
            self.container_url(container),
            utf8_percent_encode(blob, BLOB_NAME_ENCODE_SET)
        );
        match sas_token {
            Some(token) if !token.is_empty() => append_query(&url, token),
            _ => url,
        }
    }

    /// Sign a blob SAS with the account key.
    ///
    /// Only shared-key credentials can sign; everything else is a
    /// [`BackendError::Credentials`] error.
    pub fn blob_sas(
        &self,
        container: &str,
        blob: &str,
        permissions: BlobSasPermissions,
        start: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<String, BackendError> {
        match &self.credential {
            Credential::SharedKey { key } => BlobSharedAccessSignature::new(
                &self.account,
                key,
                container,
                blob,
                permissions,
                expiry,
            )
            .with_start(start)
            .token(),
            _ => Err(BackendError::Credentials(
                "signed URLs require an account key".to_string(),
            )),
        }
    }
}

/// Append a raw query string to `url`.
pub fn append_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

/// Key/value pairs of a connection string.
#[derive(Debug, Clone, Default)]
pub struct ConnectionString {
    values: HashMap<String, String>,
}

impl ConnectionString {
    /// Parse `Key=Value;Key=Value` pairs.  Values may contain `=`.
    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let values = raw
            .trim()
            .replace('\n', "")
            .split(';')
            .filter(|field| !field.trim().is_empty())
            .map(|field| -> Result<(String, String), BackendError> {
                // The field itself may hold a key; keep it out of the error.
                let (key, value) = field.trim().split_once('=').ok_or_else(|| {
                    BackendError::InvalidConnectionString("expected Key=Value fields".to_string())
                })?;
                Ok((key.to_string(), value.to_string()))
            })
            .collect::<Result<HashMap<_, _>, BackendError>>()?;
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn uses_development_storage(&self) -> bool {
        self.get("UseDevelopmentStorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

fn decode_key(key: &str) -> Result<Credential, BackendError> {
    let key = BASE64_STANDARD
        .decode(key.trim())
        .map_err(|e| BackendError::Credentials(format!("account key is not valid base64: {e}")))?;
    Ok(Credential::SharedKey { key })
}

fn strip_sas(token: &str) -> String {
    token.trim().trim_start_matches('?').to_string()
}

impl ClientOptions {
    fn protocol(&self) -> &str {
        if self.protocol.is_empty() {
            "https"
        } else {
            &self.protocol
        }
    }

    fn endpoint_suffix(&self) -> &str {
        self.endpoint_suffix
            .as_deref()
            .unwrap_or(DEFAULT_ENDPOINT_SUFFIX)
    }

    /// Credential from the individual settings; key beats SAS beats token.
    fn option_credential(&self) -> Result<Credential, BackendError> {
        if let Some(key) = &self.account_key {
            return decode_key(key.expose());
        }
        if let Some(sas) = &self.sas_token {
            return Ok(Credential::SasToken(strip_sas(sas.expose())));
        }
        if let Some(token) = &self.token_credential {
            return Ok(Credential::BearerToken(token.expose().to_string()));
        }
        Ok(Credential::Anonymous)
    }

    fn emulator(
        &self,
        account: Option<&str>,
        key: Option<&str>,
        host: Option<&str>,
    ) -> Result<ResolvedAccount, BackendError> {
        let account = account.unwrap_or(EMULATOR_ACCOUNT_NAME).to_string();
        let credential = match key {
            Some(key) => decode_key(key)?,
            None => decode_key(EMULATOR_ACCOUNT_KEY)?,
        };
        let base = match host {
            Some(h) if h.contains("://") => h.trim_end_matches('/').to_string(),
            Some(h) => format!("http://{}", h.trim_end_matches('/')),
            None => format!("http://{EMULATOR_BLOB_HOST}"),
        };
        Ok(ResolvedAccount {
            endpoint: format!("{base}/{account}"),
            account,
            credential,
        })
    }

    /// Work out endpoint and credential.
    ///
    /// Precedence: connection string values, then the individual options.
    /// The custom domain replaces the account host unless the connection
    /// string names an explicit `BlobEndpoint`.
    pub fn resolve(&self) -> Result<ResolvedAccount, BackendError> {
        let conn = match &self.connection_string {
            Some(raw) => Some(ConnectionString::parse(raw.expose())?),
            None => None,
        };

        if let Some(conn) = conn.as_ref().filter(|c| c.uses_development_storage()) {
            return self.emulator(
                conn.get("AccountName"),
                conn.get("AccountKey"),
                conn.get("DevelopmentStorageProxyUri"),
            );
        }

        if conn.is_none() && self.is_emulated {
            let key = self.account_key.as_ref().map(Secret::expose);
            let mut resolved = self.emulator(
                self.account_name.as_deref(),
                key,
                self.custom_domain.as_deref(),
            )?;
            if key.is_none() && (self.sas_token.is_some() || self.token_credential.is_some()) {
                resolved.credential = self.option_credential()?;
            }
            return Ok(resolved);
        }

        let account = conn
            .as_ref()
            .and_then(|c| c.get("AccountName"))
            .map(str::to_string)
            .or_else(|| self.account_name.clone());

        let credential = match &conn {
            Some(c) if c.get("SharedAccessSignature").is_some() => {
                Credential::SasToken(strip_sas(c.get("SharedAccessSignature").unwrap_or_default()))
            }
            Some(c) if c.get("AccountKey").is_some() => {
                decode_key(c.get("AccountKey").unwrap_or_default())?
            }
            _ => self.option_credential()?,
        };

        let protocol = conn
            .as_ref()
            .and_then(|c| c.get("DefaultEndpointsProtocol"))
            .unwrap_or(self.protocol());
        if protocol != "http" && protocol != "https" {
            return Err(BackendError::InvalidConnectionString(format!(
                "invalid DefaultEndpointsProtocol: {protocol}"
            )));
        }
        let suffix = conn
            .as_ref()
            .and_then(|c| c.get("EndpointSuffix"))
            .unwrap_or(self.endpoint_suffix());

        let explicit = conn.as_ref().and_then(|c| c.get("BlobEndpoint"));
        let endpoint = match (explicit, &self.custom_domain, &account) {
            (Some(url), _, _) => url.trim_end_matches('/').to_string(),
            (None, Some(domain), _) => format!("{protocol}://{}", domain.trim_end_matches('/')),
            (None, None, Some(account)) => format!("{protocol}://{account}.blob.{suffix}"),
            (None, None, None) => {
                return Err(BackendError::Credentials(
                    "an account name, a custom domain or a connection string is required"
                        .to_string(),
                ))
            }
        };

        let account = match account {
            Some(account) => account,
            None => endpoint
                .split_once("://")
                .map(|(_, host)| host)
                .and_then(|host| host.split('.').next())
                .unwrap_or_default()
                .to_string(),
        };

        Ok(ResolvedAccount {
            account,
            endpoint,
            credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ClientOptions {
        ClientOptions {
            account_name: Some("myaccount".to_string()),
            account_key: Some(Secret::new("a2V5")),
            protocol: "https".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_connection_string() {
        let conn = ConnectionString::parse(
            "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=YWJj==;EndpointSuffix=core.windows.net",
        )
        .unwrap();
        assert_eq!(conn.get("AccountName"), Some("acct"));
        assert_eq!(conn.get("AccountKey"), Some("YWJj=="));
        assert_eq!(conn.get("Missing"), None);
    }

    #[test]
    fn test_parse_connection_string_rejects_garbage() {
        let err = ConnectionString::parse("AccountName=acct;garbage").unwrap_err();
        assert!(matches!(err, BackendError::InvalidConnectionString(_)));
    }

    #[test]
    fn test_resolve_account_endpoint() {
        let resolved = options().resolve().unwrap();
        assert_eq!(resolved.account, "myaccount");
        assert_eq!(resolved.endpoint, "https://myaccount.blob.core.windows.net");
        assert_eq!(resolved.credential, Credential::SharedKey { key: b"key".to_vec() });
        assert_eq!(resolved.endpoint_path(), "");
    }

    #[test]
    fn test_resolve_custom_domain_and_suffix() {
        let mut opts = options();
        opts.endpoint_suffix = Some("core.chinacloudapi.cn".to_string());
        assert_eq!(
            opts.resolve().unwrap().endpoint,
            "https://myaccount.blob.core.chinacloudapi.cn"
        );

        opts.custom_domain = Some("cdn.example.com".to_string());
        opts.protocol = "http".to_string();
        assert_eq!(opts.resolve().unwrap().endpoint, "http://cdn.example.com");
    }

    #[test]
    fn test_resolve_connection_string_wins() {
        let mut opts = options();
        opts.connection_string = Some(Secret::new(
            "AccountName=other;AccountKey=b3RoZXI=;BlobEndpoint=https://blobs.example.net/",
        ));
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.account, "other");
        assert_eq!(resolved.endpoint, "https://blobs.example.net");
        assert_eq!(resolved.credential, Credential::SharedKey { key: b"other".to_vec() });
    }

    #[test]
    fn test_resolve_connection_string_sas() {
        let opts = ClientOptions {
            connection_string: Some(Secret::new(
                "BlobEndpoint=https://acct.blob.core.windows.net;SharedAccessSignature=?sv=1&sig=x",
            )),
            ..Default::default()
        };
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.account, "acct");
        assert_eq!(resolved.credential, Credential::SasToken("sv=1&sig=x".to_string()));
    }

    #[test]
    fn test_resolve_emulator() {
        let opts = ClientOptions {
            is_emulated: true,
            ..Default::default()
        };
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.account, EMULATOR_ACCOUNT_NAME);
        assert_eq!(resolved.endpoint, "http://127.0.0.1:10000/devstoreaccount1");
        assert_eq!(resolved.endpoint_path(), "/devstoreaccount1");
        assert!(matches!(resolved.credential, Credential::SharedKey { .. }));

        let opts = ClientOptions {
            is_emulated: true,
            custom_domain: Some("azurite:10000".to_string()),
            ..Default::default()
        };
        assert_eq!(
            opts.resolve().unwrap().endpoint,
            "http://azurite:10000/devstoreaccount1"
        );
    }

    #[test]
    fn test_resolve_development_storage_connection_string() {
        let opts = ClientOptions {
            connection_string: Some(Secret::new("UseDevelopmentStorage=true")),
            ..Default::default()
        };
        let resolved = opts.resolve().unwrap();
        assert_eq!(resolved.endpoint, "http://127.0.0.1:10000/devstoreaccount1");
    }

    #[test]
    fn test_resolve_credential_precedence() {
        let opts = ClientOptions {
            account_name: Some("acct".to_string()),
            sas_token: Some(Secret::new("?sv=1")),
            token_credential: Some(Secret::new("tok")),
            ..Default::default()
        };
        assert_eq!(
            opts.resolve().unwrap().credential,
            Credential::SasToken("sv=1".to_string())
        );

        let opts = ClientOptions {
            account_name: Some("acct".to_string()),
            token_credential: Some(Secret::new("tok")),
            ..Default::default()
        };
        assert_eq!(
            opts.resolve().unwrap().credential,
            Credential::BearerToken("tok".to_string())
        );
    }

    #[test]
    fn test_resolve_requires_some_account() {
        let err = ClientOptions::default().resolve().unwrap_err();
        assert!(matches!(err, BackendError::Credentials(_)));
    }

    #[test]
    fn test_bad_key_is_credentials_error() {
        let mut opts = options();
        opts.account_key = Some(Secret::new("not base64!!"));
        assert!(matches!(opts.resolve().unwrap_err(), BackendError::Credentials(_)));
    }

    #[test]
    fn test_blob_url_encoding() {
        let resolved = options().resolve().unwrap();
        assert_eq!(
            resolved.blob_url("media", "dir/key with spaces.txt", None),
            "https://myaccount.blob.core.windows.net/media/dir/key%20with%20spaces.txt"
        );
        assert_eq!(
            resolved.blob_url("media", "a.txt", Some("sv=1&sig=x")),
            "https://myaccount.blob.core.windows.net/media/a.txt?sv=1&sig=x"
        );
        assert_eq!(
            resolved.blob_url("media", "a.txt", Some("")),
            "https://myaccount.blob.core.windows.net/media/a.txt"
        );
    }

    #[test]
    fn test_blob_sas_requires_shared_key() {
        let now = Utc::now();
        let resolved = options().resolve().unwrap();
        assert!(resolved
            .blob_sas("media", "a.txt", BlobSasPermissions::READ, now, now)
            .is_ok());

        let anonymous = ResolvedAccount {
            credential: Credential::Anonymous,
            ..resolved
        };
        let err = anonymous
            .blob_sas("media", "a.txt", BlobSasPermissions::READ, now, now)
            .unwrap_err();
        assert!(matches!(err, BackendError::Credentials(_)));
    }

    #[test]
    fn test_append_query() {
        assert_eq!(append_query("http://x/a", "k=v"), "http://x/a?k=v");
        assert_eq!(append_query("http://x/a?comp=list", "k=v"), "http://x/a?comp=list&k=v");
    }

    #[test]
    fn test_credential_debug_redacted() {
        let rendered = format!("{:?}", Credential::SasToken("sig=secret".to_string()));
        assert!(!rendered.contains("secret"));
    }
}
