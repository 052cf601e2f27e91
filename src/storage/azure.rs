//! Azure Blob Storage REST client.
//!
//! Talks to the Blob service over `reqwest`.  Every request goes through
//! [`AzureBlobClient::execute`], which builds the URL, attaches the
//! service headers, authorizes the call and maps the response status onto
//! [`BackendError`].
//!
//! Upload strategy:
//!   - up to [`MAX_SINGLE_PUT_SIZE`] bytes -> one Put Blob carrying the
//!     content MD5
//!   - larger                             -> Put Block per [`BLOCK_SIZE`]
//!     chunk, `max_connections` in flight, then Put Block List
//!
//! Authorization follows the resolved [`Credential`]:
//!   - `SharedKey`   -> `Authorization: SharedKey {account}:{signature}`
//!   - `SasToken`    -> token appended to the query string
//!   - `BearerToken` -> `Authorization: Bearer {token}`
//!   - `Anonymous`   -> nothing

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use super::backend::{
    BlobClient, BlobFuture, BlobItem, BlobProperties, ContentSettings, TransferOptions,
};
use super::options::{ClientOptions, Credential, ResolvedAccount, BLOB_NAME_ENCODE_SET};
use crate::errors::BackendError;
use crate::sas::BlobSasPermissions;
use crate::xml;

/// Azure REST API version used for all requests.
pub const AZURE_API_VERSION: &str = "2023-11-03";

/// Largest upload sent as a single Put Blob.
pub const MAX_SINGLE_PUT_SIZE: usize = 4 * 1024 * 1024;

/// Size of each staged block for larger uploads.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Encode set for query values (RFC 3986 unreserved characters pass).
const QUERY_VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Blob service client for one storage account.
pub struct AzureBlobClient {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// Endpoint and credential.
    account: ResolvedAccount,
}

/// One REST call, before authorization.
struct BlobRequest<'a> {
    method: Method,
    operation: &'static str,
    container: &'a str,
    /// `None` for container-level calls.
    blob: Option<&'a str>,
    query: Vec<(&'static str, String)>,
    /// `x-ms-*` headers besides date and version.
    ms_headers: Vec<(&'static str, String)>,
    content_type: Option<String>,
    body: Option<Bytes>,
    timeout: Duration,
}

impl<'a> BlobRequest<'a> {
    fn new(
        method: Method,
        operation: &'static str,
        container: &'a str,
        blob: Option<&'a str>,
        timeout: Duration,
    ) -> Self {
        Self {
            method,
            operation,
            container,
            blob,
            query: Vec::new(),
            ms_headers: Vec::new(),
            content_type: None,
            body: None,
            timeout,
        }
    }

    fn query(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.query.push((key, value.into()));
        self
    }

    fn ms_header(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.ms_headers.push((key, value.into()));
        self
    }

    fn body(mut self, content_type: &str, body: Bytes) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = Some(body);
        self
    }

    /// URL path as sent on the wire, starting with `/`.
    fn path(&self, account: &ResolvedAccount) -> String {
        let mut path = format!("{}/{}", account.endpoint_path(), self.container);
        if let Some(blob) = self.blob {
            path.push('/');
            path.push_str(&utf8_percent_encode(blob, BLOB_NAME_ENCODE_SET).to_string());
        }
        path
    }

    fn content_length(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }
}

impl AzureBlobClient {
    /// Build a client from `options`.  No request is made.
    pub fn new(options: &ClientOptions) -> Result<Self, BackendError> {
        let account = options.resolve()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|source| BackendError::Transport {
                operation: "client",
                source: source.without_url(),
            })?;

        info!(
            "Azure blob client initialized: account={} endpoint={} credential={:?}",
            account.account, account.endpoint, account.credential
        );

        Ok(Self { client, account })
    }

    /// The account this client talks to.
    pub fn account(&self) -> &ResolvedAccount {
        &self.account
    }

    /// Generate a block ID for a staged block.
    ///
    /// Block IDs must be base64-encoded and the same length for all blocks
    /// in a blob.
    fn block_id(index: usize) -> String {
        BASE64_STANDARD.encode(format!("block-{:06}", index))
    }

    /// Base64 MD5 digest of `data`, as Azure expects in content-MD5 headers.
    fn content_md5(data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        BASE64_STANDARD.encode(hasher.finalize())
    }

    /// Get the current UTC date in RFC 1123 format for Azure headers.
    fn rfc1123_date() -> String {
        httpdate::fmt_http_date(SystemTime::now())
    }

    /// Build the request URL, including a SAS token when that is the
    /// credential.
    fn request_url(&self, req: &BlobRequest<'_>) -> String {
        let base = match req.blob {
            Some(blob) => self.account.blob_url(req.container, blob, None),
            None => self.account.container_url(req.container),
        };

        let mut query: Vec<String> = req
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, QUERY_VALUE_ENCODE_SET)))
            .collect();
        if let Credential::SasToken(token) = &self.account.credential {
            if !token.is_empty() {
                query.push(token.clone());
            }
        }

        if query.is_empty() {
            base
        } else {
            format!("{}?{}", base, query.join("&"))
        }
    }

    /// Shared Key string-to-sign for `req`:
    /// ```text
    /// VERB\n
    /// Content-Encoding\n
    /// Content-Language\n
    /// Content-Length\n
    /// Content-MD5\n
    /// Content-Type\n
    /// Date\n
    /// If-Modified-Since\n
    /// If-Match\n
    /// If-None-Match\n
    /// If-Unmodified-Since\n
    /// Range\n
    /// CanonicalizedHeaders\n
    /// CanonicalizedResource
    /// ```
    fn string_to_sign(&self, req: &BlobRequest<'_>, date: &str) -> String {
        // Content-Length: empty for 0.
        let content_length = match req.content_length() {
            0 => String::new(),
            len => len.to_string(),
        };

        let mut ms_headers: Vec<(String, String)> = vec![
            ("x-ms-date".to_string(), date.to_string()),
            ("x-ms-version".to_string(), AZURE_API_VERSION.to_string()),
        ];
        for (k, v) in &req.ms_headers {
            ms_headers.push((k.to_lowercase(), v.trim().to_string()));
        }
        ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonicalized_headers = ms_headers
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        let mut canonicalized_resource = format!("/{}{}", self.account.account, req.path(&self.account));
        let mut params: Vec<&(&'static str, String)> = req.query.iter().collect();
        params.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in params {
            canonicalized_resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
        }

        format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}\n{}",
            req.method.as_str(),
            content_length,
            req.content_type.as_deref().unwrap_or_default(),
            canonicalized_headers,
            canonicalized_resource
        )
    }

    /// Sign a request using Azure Shared Key authentication and return
    /// the Authorization header value.
    fn sign_request(
        &self,
        key: &[u8],
        req: &BlobRequest<'_>,
        date: &str,
    ) -> Result<String, BackendError> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| BackendError::Credentials(format!("HMAC key error: {e}")))?;
        mac.update(self.string_to_sign(req, date).as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!("SharedKey {}:{}", self.account.account, signature))
    }

    /// Send `req` and return the successful response.
    ///
    /// 404 becomes [`BackendError::NotFound`]; any other non-success status
    /// becomes [`BackendError::Http`] carrying the response body.
    async fn execute(&self, req: BlobRequest<'_>) -> Result<reqwest::Response, BackendError> {
        let url = self.request_url(&req);
        let date = Self::rfc1123_date();

        let mut builder = self
            .client
            .request(req.method.clone(), &url)
            .timeout(req.timeout)
            .header("x-ms-date", &date)
            .header("x-ms-version", AZURE_API_VERSION);
        for (k, v) in &req.ms_headers {
            builder = builder.header(*k, v);
        }
        if let Some(content_type) = &req.content_type {
            builder = builder.header("Content-Type", content_type);
        }

        match &self.account.credential {
            Credential::SharedKey { key } => {
                builder = builder.header("Authorization", self.sign_request(key, &req, &date)?);
            }
            Credential::BearerToken(token) => {
                builder = builder.bearer_auth(token);
            }
            Credential::SasToken(_) | Credential::Anonymous => {}
        }

        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|source| BackendError::Transport {
                operation: req.operation,
                source: source.without_url(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            let name = match req.blob {
                Some(blob) => format!("{}/{}", req.container, blob),
                None => req.container.to_string(),
            };
            return Err(BackendError::NotFound { name });
        }
        let body = resp.text().await.unwrap_or_default();
        Err(BackendError::Http {
            operation: req.operation,
            status: status.as_u16(),
            body,
        })
    }

    // -- Azure Blob REST API operations ----------------------------------------

    /// Get Blob Properties (HEAD).
    async fn azure_get_properties(
        &self,
        container: &str,
        blob: &str,
        timeout: Duration,
    ) -> Result<BlobProperties, BackendError> {
        let req = BlobRequest::new(Method::HEAD, "get_properties", container, Some(blob), timeout);
        let resp = self.execute(req).await?;
        let headers = resp.headers();

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let last_modified = header("last-modified")
            .and_then(|raw| httpdate::parse_http_date(&raw).ok())
            .map(DateTime::<Utc>::from)
            .ok_or_else(|| BackendError::Malformed {
                operation: "get_properties",
                message: "missing or invalid Last-Modified header".to_string(),
            })?;

        Ok(BlobProperties {
            content_length: header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: header("content-type"),
            content_encoding: header("content-encoding"),
            last_modified: last_modified.into(),
            etag: header("etag"),
        })
    }

    /// Get Blob, streamed chunk by chunk into `writer`.
    async fn azure_download(
        &self,
        container: &str,
        blob: &str,
        writer: &mut (dyn Write + Send),
        timeout: Duration,
    ) -> Result<u64, BackendError> {
        let req = BlobRequest::new(Method::GET, "download", container, Some(blob), timeout);
        let mut resp = self.execute(req).await?;

        let mut total = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|source| BackendError::Transport {
                operation: "download",
                source: source.without_url(),
            })?
        {
            writer.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        writer.flush()?;
        Ok(total)
    }

    /// Put Blob with the whole content in one request.
    async fn azure_put_blob(
        &self,
        container: &str,
        blob: &str,
        data: Bytes,
        settings: &ContentSettings,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let mut req = BlobRequest::new(Method::PUT, "upload", container, Some(blob), timeout)
            .ms_header("x-ms-blob-type", "BlockBlob")
            .ms_header("x-ms-blob-content-md5", Self::content_md5(&data));
        req = with_content_settings(req, settings);
        req = req.body("application/octet-stream", data);
        self.execute(req).await?;
        Ok(())
    }

    /// Stage one block (Put Block).
    async fn azure_put_block(
        &self,
        container: &str,
        blob: &str,
        block_id: &str,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let req = BlobRequest::new(Method::PUT, "put_block", container, Some(blob), timeout)
            .query("comp", "block")
            .query("blockid", block_id)
            .body("application/octet-stream", data);
        self.execute(req).await?;
        Ok(())
    }

    /// Commit staged blocks in order (Put Block List).
    async fn azure_put_block_list(
        &self,
        container: &str,
        blob: &str,
        block_ids: &[String],
        settings: &ContentSettings,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let body = xml::render_block_list(block_ids)?;
        let mut req = BlobRequest::new(Method::PUT, "put_block_list", container, Some(blob), timeout)
            .query("comp", "blocklist");
        req = with_content_settings(req, settings);
        req = req.body("application/xml", Bytes::from(body));
        self.execute(req).await?;
        Ok(())
    }

    /// Upload everything `reader` yields, choosing single put or blocks.
    async fn azure_upload(
        &self,
        container: &str,
        blob: &str,
        reader: &mut (dyn Read + Send),
        settings: ContentSettings,
        options: TransferOptions,
    ) -> Result<(), BackendError> {
        let first = read_chunk(reader, MAX_SINGLE_PUT_SIZE)?;
        let second = if first.len() < MAX_SINGLE_PUT_SIZE {
            Vec::new()
        } else {
            read_chunk(reader, BLOCK_SIZE)?
        };

        if second.is_empty() {
            debug!(
                "Azure put blob: container={} blob={} size={}",
                container,
                blob,
                first.len()
            );
            return self
                .azure_put_blob(container, blob, Bytes::from(first), &settings, options.timeout)
                .await;
        }

        debug!(
            "Azure block upload: container={} blob={} max_connections={}",
            container, blob, options.max_connections
        );

        let blocks = BlockChunks {
            reader,
            pending: VecDeque::from([first, second]),
            index: 0,
        };
        let timeout = options.timeout;
        let block_ids: Vec<String> = futures::stream::iter(blocks)
            .map(move |block| async move {
                let (block_id, data) = block?;
                self.azure_put_block(container, blob, &block_id, data, timeout)
                    .await?;
                Ok::<_, BackendError>(block_id)
            })
            .buffered(options.max_connections.max(1))
            .try_collect()
            .await?;

        self.azure_put_block_list(container, blob, &block_ids, &settings, timeout)
            .await
    }

    /// Delete Blob.
    async fn azure_delete(
        &self,
        container: &str,
        blob: &str,
        timeout: Duration,
    ) -> Result<(), BackendError> {
        let req = BlobRequest::new(Method::DELETE, "delete", container, Some(blob), timeout);
        self.execute(req).await?;
        Ok(())
    }

    /// List Blobs with a given prefix, following continuation markers.
    async fn azure_list_blobs(
        &self,
        container: &str,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Vec<BlobItem>, BackendError> {
        let mut all_items: Vec<BlobItem> = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut req = BlobRequest::new(Method::GET, "list_blobs", container, None, timeout)
                .query("restype", "container")
                .query("comp", "list");
            if !prefix.is_empty() {
                req = req.query("prefix", prefix);
            }
            if let Some(m) = &marker {
                req = req.query("marker", m.clone());
            }

            let body = self
                .execute(req)
                .await?
                .text()
                .await
                .map_err(|source| BackendError::Transport {
                    operation: "list_blobs",
                    source: source.without_url(),
                })?;

            let page = xml::parse_list_blobs(&body)?;
            all_items.extend(page.items);

            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        Ok(all_items)
    }
}

fn with_content_settings<'a>(
    mut req: BlobRequest<'a>,
    settings: &ContentSettings,
) -> BlobRequest<'a> {
    if let Some(content_type) = &settings.content_type {
        req = req.ms_header("x-ms-blob-content-type", content_type.clone());
    }
    if let Some(content_encoding) = &settings.content_encoding {
        req = req.ms_header("x-ms-blob-content-encoding", content_encoding.clone());
    }
    req
}

/// Read up to `size` bytes; shorter only at end of stream.
fn read_chunk(reader: &mut (dyn Read + Send), size: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(size);
    Read::take(&mut *reader, size as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Splits an upload source into numbered blocks.
struct BlockChunks<'r> {
    reader: &'r mut (dyn Read + Send),
    /// Chunks already read while deciding on the upload strategy.
    pending: VecDeque<Vec<u8>>,
    index: usize,
}

impl Iterator for BlockChunks<'_> {
    type Item = Result<(String, Bytes), BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = match self.pending.pop_front() {
            Some(chunk) => chunk,
            None => match read_chunk(self.reader, BLOCK_SIZE) {
                Ok(chunk) => chunk,
                Err(e) => return Some(Err(e.into())),
            },
        };
        if chunk.is_empty() {
            return None;
        }
        let block_id = AzureBlobClient::block_id(self.index);
        self.index += 1;
        Some(Ok((block_id, Bytes::from(chunk))))
    }
}

impl BlobClient for AzureBlobClient {
    fn exists<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        timeout: Duration,
    ) -> BlobFuture<'a, bool> {
        Box::pin(async move {
            debug!("Azure exists: container={} blob={}", container, blob);
            match self.azure_get_properties(container, blob, timeout).await {
                Ok(_) => Ok(true),
                Err(BackendError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }

    fn get_properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        timeout: Duration,
    ) -> BlobFuture<'a, BlobProperties> {
        Box::pin(async move {
            debug!("Azure get_properties: container={} blob={}", container, blob);
            self.azure_get_properties(container, blob, timeout).await
        })
    }

    fn get_to_writer<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        writer: &'a mut (dyn Write + Send),
        options: TransferOptions,
    ) -> BlobFuture<'a, u64> {
        Box::pin(async move {
            debug!("Azure get: container={} blob={}", container, blob);
            self.azure_download(container, blob, writer, options.timeout)
                .await
        })
    }

    fn create_from_reader<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        reader: &'a mut (dyn Read + Send),
        settings: ContentSettings,
        options: TransferOptions,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            debug!(
                "Azure put: container={} blob={} content_type={:?}",
                container, blob, settings.content_type
            );
            self.azure_upload(container, blob, reader, settings, options)
                .await
        })
    }

    fn delete<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        timeout: Duration,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            debug!("Azure delete: container={} blob={}", container, blob);
            self.azure_delete(container, blob, timeout).await
        })
    }

    fn list<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
        timeout: Duration,
    ) -> BlobFuture<'a, Vec<BlobItem>> {
        Box::pin(async move {
            debug!("Azure list: container={} prefix='{}'", container, prefix);
            self.azure_list_blobs(container, prefix, timeout).await
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

// -- Tests -------------------------------------------------------------------
