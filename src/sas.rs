//! Service SAS tokens for single blobs.
//!
//! A token grants time-limited access to one blob and is signed with the
//! storage account key.  See
//! <https://learn.microsoft.com/en-us/rest/api/storageservices/create-service-sas>.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::Sha256;

use crate::errors::BackendError;

/// Signed version; fixes the string-to-sign layout below.
pub const SAS_VERSION: &str = "2021-06-08";

/// Encode set for SAS query values (RFC 3986 unreserved characters pass).
const QUERY_VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Permissions a blob SAS may grant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobSasPermissions {
    pub read: bool,
    pub add: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
}

impl BlobSasPermissions {
    pub const READ: Self = Self {
        read: true,
        add: false,
        create: false,
        write: false,
        delete: false,
    };

    /// The `sp` field; letters must appear in this order.
    pub fn as_sp(&self) -> String {
        let mut sp = String::new();
        for (granted, letter) in [
            (self.read, 'r'),
            (self.add, 'a'),
            (self.create, 'c'),
            (self.write, 'w'),
            (self.delete, 'd'),
        ] {
            if granted {
                sp.push(letter);
            }
        }
        sp
    }
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn encode_value(v: &str) -> String {
    utf8_percent_encode(v, QUERY_VALUE_ENCODE_SET).to_string()
}

/// Builder for a blob-scoped service SAS.
pub struct BlobSharedAccessSignature<'a> {
    account: &'a str,
    key: &'a [u8],
    container: &'a str,
    blob: &'a str,
    permissions: BlobSasPermissions,
    start: Option<DateTime<Utc>>,
    expiry: DateTime<Utc>,
    protocol: Option<&'a str>,
}

impl<'a> BlobSharedAccessSignature<'a> {
    /// `key` is the decoded account key.
    pub fn new(
        account: &'a str,
        key: &'a [u8],
        container: &'a str,
        blob: &'a str,
        permissions: BlobSasPermissions,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            account,
            key,
            container,
            blob,
            permissions,
            start: None,
            expiry,
            protocol: None,
        }
    }

    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Restrict the token to `https` or `https,http`.
    pub fn with_protocol(mut self, protocol: &'a str) -> Self {
        self.protocol = Some(protocol);
        self
    }

    fn string_to_sign(&self) -> String {
        let canonicalized_resource =
            format!("/blob/{}/{}/{}", self.account, self.container, self.blob);
        [
            self.permissions.as_sp(),
            self.start.as_ref().map(format_time).unwrap_or_default(),
            format_time(&self.expiry),
            canonicalized_resource,
            String::new(), // signedIdentifier
            String::new(), // signedIP
            self.protocol.unwrap_or_default().to_string(),
            SAS_VERSION.to_string(),
            "b".to_string(), // signedResource
            String::new(),   // signedSnapshotTime
            String::new(),   // signedEncryptionScope
            String::new(),   // rscc
            String::new(),   // rscd
            String::new(),   // rsce
            String::new(),   // rscl
            String::new(),   // rsct
        ]
        .join("\n")
    }

    fn signature(&self) -> Result<String, BackendError> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.key)
            .map_err(|e| BackendError::Credentials(format!("HMAC key error: {e}")))?;
        mac.update(self.string_to_sign().as_bytes());
        Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// The token as a query string, without a leading `?`.
    pub fn token(&self) -> Result<String, BackendError> {
        let mut fields: Vec<(&str, String)> = vec![("sv", SAS_VERSION.to_string())];
        if let Some(start) = &self.start {
            fields.push(("st", format_time(start)));
        }
        fields.push(("se", format_time(&self.expiry)));
        fields.push(("sr", "b".to_string()));
        fields.push(("sp", self.permissions.as_sp()));
        if let Some(protocol) = self.protocol {
            fields.push(("spr", protocol.to_string()));
        }
        fields.push(("sig", self.signature()?));

        Ok(fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, encode_value(v)))
            .collect::<Vec<_>>()
            .join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 3, 1, 8, 12, 34).unwrap()
    }

    fn sas<'a>(key: &'a [u8]) -> BlobSharedAccessSignature<'a> {
        BlobSharedAccessSignature::new(
            "account",
            key,
            "media",
            "dir/file.txt",
            BlobSasPermissions::READ,
            start() + chrono::Duration::seconds(60),
        )
        .with_start(start())
    }

    #[test]
    fn test_permissions_order() {
        assert_eq!(BlobSasPermissions::READ.as_sp(), "r");
        let all = BlobSasPermissions {
            read: true,
            add: true,
            create: true,
            write: true,
            delete: true,
        };
        assert_eq!(all.as_sp(), "racwd");
    }

    #[test]
    fn test_string_to_sign_layout() {
        let s = sas(b"key").string_to_sign();
        let fields: Vec<&str> = s.split('\n').collect();
        assert_eq!(fields.len(), 16);
        assert_eq!(fields[0], "r");
        assert_eq!(fields[1], "2022-03-01T08:12:34Z");
        assert_eq!(fields[2], "2022-03-01T08:13:34Z");
        assert_eq!(fields[3], "/blob/account/media/dir/file.txt");
        assert_eq!(fields[7], SAS_VERSION);
        assert_eq!(fields[8], "b");
    }

    #[test]
    fn test_token_fields() {
        let token = sas(b"key").token().unwrap();
        assert!(token.starts_with("sv=2021-06-08&"));
        assert!(token.contains("st=2022-03-01T08%3A12%3A34Z"));
        assert!(token.contains("se=2022-03-01T08%3A13%3A34Z"));
        assert!(token.contains("sr=b"));
        assert!(token.contains("sp=r"));
        assert!(token.contains("&sig="));
        assert!(!token.contains("spr="));
    }

    #[test]
    fn test_token_deterministic_and_key_bound() {
        let a = sas(b"key-one").token().unwrap();
        let b = sas(b"key-one").token().unwrap();
        let c = sas(b"key-two").token().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_signature_is_base64_sha256() {
        let sig = sas(b"key").signature().unwrap();
        let raw = BASE64_STANDARD.decode(sig).unwrap();
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn test_without_start() {
        let token = BlobSharedAccessSignature::new(
            "account",
            b"key",
            "media",
            "a.txt",
            BlobSasPermissions::READ,
            start(),
        )
        .with_protocol("https")
        .token()
        .unwrap();
        assert!(!token.contains("st="));
        assert!(token.contains("spr=https"));
    }
}
