//! Configuration loading and types for azstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Every setting can also be supplied through the
//! `AZURE_*` environment variables (see
//! [`StorageConfig::apply_env_overrides`]).  Once handed to the storage
//! façade the configuration is frozen behind an `Arc`.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::time::DisplayTimeZone;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Blob storage settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging settings (used by the `azstore` binary).
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// A credential string that never shows up in `Debug` output.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw credential.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Azure Blob Storage settings for one logical storage root.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage account name.
    #[serde(default)]
    pub account_name: Option<String>,

    /// Base64 storage account key (Shared Key auth).
    #[serde(default)]
    pub account_key: Option<Secret>,

    /// Container holding every blob of this storage.
    #[serde(default)]
    pub container: String,

    /// Use `https` (true) or `http` (false) endpoints.
    #[serde(default = "default_true")]
    pub ssl: bool,

    /// Concurrent block uploads per save.
    #[serde(default = "default_upload_max_conn")]
    pub upload_max_conn: usize,

    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout")]
    pub connection_timeout_secs: u64,

    /// Bytes a file handle keeps in memory before spilling to disk.
    #[serde(default = "default_max_memory_size")]
    pub blob_max_memory_size: usize,

    /// Default lifetime of signed URLs; unset or 0 means unsigned URLs.
    #[serde(default)]
    pub url_expiration_secs: Option<u64>,

    /// Overwrite existing blobs instead of picking a fresh name.
    #[serde(default)]
    pub overwrite_files: bool,

    /// Path prefix inside the container.
    #[serde(default)]
    pub location: String,

    /// Content type when nothing better is known.
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Talk to the local storage emulator.
    #[serde(default)]
    pub emulated_mode: bool,

    /// DNS suffix of the blob service (`core.windows.net` when unset).
    #[serde(default)]
    pub endpoint_suffix: Option<String>,

    /// Pre-issued SAS token used to authenticate data calls.
    #[serde(default)]
    pub sas_token: Option<Secret>,

    /// Domain used in generated URLs (CDN, front door, emulator host).
    #[serde(default)]
    pub custom_domain: Option<String>,

    /// Connection string for data calls.
    #[serde(default)]
    pub connection_string: Option<Secret>,

    /// Connection string for URL signing; falls back to `connection_string`.
    #[serde(default)]
    pub custom_connection_string: Option<Secret>,

    /// OAuth bearer token.
    #[serde(default)]
    pub token_credential: Option<Secret>,

    /// Directory for spilled file-handle buffers.
    #[serde(default)]
    pub file_upload_temp_dir: Option<PathBuf>,

    /// Return timezone-aware modification times.
    #[serde(default)]
    pub use_tz: bool,

    /// Display time zone: `UTC`, `local`, or a fixed offset like `+02:00`.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            account_name: None,
            account_key: None,
            container: String::new(),
            ssl: true,
            upload_max_conn: default_upload_max_conn(),
            connection_timeout_secs: default_timeout(),
            blob_max_memory_size: default_max_memory_size(),
            url_expiration_secs: None,
            overwrite_files: false,
            location: String::new(),
            default_content_type: default_content_type(),
            emulated_mode: false,
            endpoint_suffix: None,
            sas_token: None,
            custom_domain: None,
            connection_string: None,
            custom_connection_string: None,
            token_credential: None,
            file_upload_temp_dir: None,
            use_tz: false,
            time_zone: default_time_zone(),
        }
    }
}

impl StorageConfig {
    /// `https` or `http`, depending on [`StorageConfig::ssl`].
    pub fn protocol(&self) -> &'static str {
        if self.ssl {
            "https"
        } else {
            "http"
        }
    }

    /// Connection string for the signing client.
    pub fn signing_connection_string(&self) -> Option<&Secret> {
        self.custom_connection_string
            .as_ref()
            .or(self.connection_string.as_ref())
    }

    /// Parsed [`StorageConfig::time_zone`]; unknown values fall back to UTC.
    pub fn display_time_zone(&self) -> DisplayTimeZone {
        match self.time_zone.parse() {
            Ok(tz) => tz,
            Err(e) => {
                tracing::warn!("Ignoring time_zone '{}': {}", self.time_zone, e);
                DisplayTimeZone::Utc
            }
        }
    }

    /// Overlay settings from the process environment.
    ///
    /// Recognised variables: `AZURE_ACCOUNT_NAME`, `AZURE_ACCOUNT_KEY`,
    /// `AZURE_CONTAINER`, `AZURE_SSL`, `AZURE_UPLOAD_MAX_CONN`,
    /// `AZURE_CONNECTION_TIMEOUT_SECS`, `AZURE_BLOB_MAX_MEMORY_SIZE`,
    /// `AZURE_URL_EXPIRATION_SECS`, `AZURE_OVERWRITE_FILES`,
    /// `AZURE_LOCATION`, `AZURE_EMULATED_MODE`, `AZURE_ENDPOINT_SUFFIX`,
    /// `AZURE_SAS_TOKEN`, `AZURE_CUSTOM_DOMAIN`, `AZURE_CONNECTION_STRING`,
    /// `AZURE_CUSTOM_CONNECTION_STRING`, `AZURE_TOKEN_CREDENTIAL`,
    /// `FILE_UPLOAD_TEMP_DIR`, `USE_TZ`, `TIME_ZONE`.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AZURE_ACCOUNT_NAME") {
            self.account_name = Some(v);
        }
        if let Some(v) = lookup("AZURE_ACCOUNT_KEY") {
            self.account_key = Some(Secret(v));
        }
        if let Some(v) = lookup("AZURE_CONTAINER") {
            self.container = v;
        }
        if let Some(v) = lookup("AZURE_SSL") {
            self.ssl = parse_bool("AZURE_SSL", &v)?;
        }
        if let Some(v) = lookup("AZURE_UPLOAD_MAX_CONN") {
            self.upload_max_conn = parse_num("AZURE_UPLOAD_MAX_CONN", &v)?;
        }
        if let Some(v) = lookup("AZURE_CONNECTION_TIMEOUT_SECS") {
            self.connection_timeout_secs = parse_num("AZURE_CONNECTION_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("AZURE_BLOB_MAX_MEMORY_SIZE") {
            self.blob_max_memory_size = parse_num("AZURE_BLOB_MAX_MEMORY_SIZE", &v)?;
        }
        if let Some(v) = lookup("AZURE_URL_EXPIRATION_SECS") {
            self.url_expiration_secs = Some(parse_num("AZURE_URL_EXPIRATION_SECS", &v)?);
        }
        if let Some(v) = lookup("AZURE_OVERWRITE_FILES") {
            self.overwrite_files = parse_bool("AZURE_OVERWRITE_FILES", &v)?;
        }
        if let Some(v) = lookup("AZURE_LOCATION") {
            self.location = v;
        }
        if let Some(v) = lookup("AZURE_EMULATED_MODE") {
            self.emulated_mode = parse_bool("AZURE_EMULATED_MODE", &v)?;
        }
        if let Some(v) = lookup("AZURE_ENDPOINT_SUFFIX") {
            self.endpoint_suffix = Some(v);
        }
        if let Some(v) = lookup("AZURE_SAS_TOKEN") {
            self.sas_token = Some(Secret(v));
        }
        if let Some(v) = lookup("AZURE_CUSTOM_DOMAIN") {
            self.custom_domain = Some(v);
        }
        if let Some(v) = lookup("AZURE_CONNECTION_STRING") {
            self.connection_string = Some(Secret(v));
        }
        if let Some(v) = lookup("AZURE_CUSTOM_CONNECTION_STRING") {
            self.custom_connection_string = Some(Secret(v));
        }
        if let Some(v) = lookup("AZURE_TOKEN_CREDENTIAL") {
            self.token_credential = Some(Secret(v));
        }
        if let Some(v) = lookup("FILE_UPLOAD_TEMP_DIR") {
            self.file_upload_temp_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("USE_TZ") {
            self.use_tz = parse_bool("USE_TZ", &v)?;
        }
        if let Some(v) = lookup("TIME_ZONE") {
            self.time_zone = v;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{key}: expected a boolean, got '{other}'"),
    }
}

fn parse_num<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{key}: {e}"))
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_upload_max_conn() -> usize {
    2
}

fn default_timeout() -> u64 {
    20
}

fn default_max_memory_size() -> usize {
    2 * 1024 * 1024
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}
