//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use reportbox_storage::StoragePaths;
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Session token configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Where records and uploaded files live.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Archive export tuning.
    #[serde(default)]
    pub export: ExportConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Maximum request body size in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Maximum size in bytes of a multipart report upload.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: usize,

    /// Seconds allowed until response headers are produced.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// CORS origins (empty = allow all).
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_size() -> usize {
    1024 * 1024 // 1MB, bodies are JSON id lists
}

fn default_max_upload_size() -> usize {
    50 * 1024 * 1024
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            export: ExportConfig::default(),
            logging: LoggingConfig::default(),
            max_body_size: default_max_body_size(),
            max_upload_size: default_max_upload_size(),
            request_timeout: default_request_timeout(),
            cors_origins: vec![],
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Defaults overlaid with `REPORTBOX_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("REPORTBOX_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(secret) = std::env::var("REPORTBOX_JWT_SECRET") {
            config.auth.jwt_secret = Some(secret);
        }

        if let Ok(dir) = std::env::var("REPORTBOX_DATA_DIR") {
            config.storage.data_dir = Some(PathBuf::from(dir));
        }

        if let Ok(dir) = std::env::var("REPORTBOX_UPLOADS_DIR") {
            config.storage.uploads_dir = Some(PathBuf::from(dir));
        }

        if let Ok(level) = std::env::var("REPORTBOX_COMPRESSION_LEVEL") {
            config.export.compression_level = level.parse()?;
        }

        Ok(config)
    }

    /// Get request timeout as Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Session token configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret used to sign and verify session tokens.
    pub jwt_secret: Option<String>,
    /// Token lifetime in seconds.
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry: u64,
    /// Expected `iss` claim.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    /// Expected `aud` claim.
    #[serde(default = "default_audience")]
    pub audience: String,
}

fn default_jwt_expiry() -> u64 {
    86400 // 24 hours
}

fn default_issuer() -> String {
    "reportbox".to_string()
}

fn default_audience() -> String {
    "reportbox-api".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expiry: default_jwt_expiry(),
            issuer: default_issuer(),
            audience: default_audience(),
        }
    }
}

/// Storage locations. Unset fields fall back to the platform data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the records snapshot.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Directory local report files are resolved against.
    #[serde(default)]
    pub uploads_dir: Option<PathBuf>,
    /// Override for the records snapshot file.
    #[serde(default)]
    pub records_file: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the effective storage paths.
    pub fn paths(&self) -> reportbox_storage::Result<StoragePaths> {
        let paths = match &self.data_dir {
            Some(dir) => StoragePaths::from_root(dir.clone()),
            None => StoragePaths::new()?,
        };
        let mut paths = match &self.uploads_dir {
            Some(dir) => paths.with_uploads_dir(dir.clone()),
            None => paths,
        };
        if let Some(file) = &self.records_file {
            paths.records_file = file.clone();
        }
        Ok(paths)
    }
}

/// Archive export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Deflate level for archive entries (0-9).
    #[serde(default = "default_compression_level")]
    pub compression_level: i64,
    /// Bytes buffered before a chunk is handed to the response.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks in flight before the archive writer waits for the client.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Bytes of a single file kept in memory while it is read ahead of its
    /// archive entry. Larger files spill to a temporary file.
    #[serde(default = "default_spool_memory_limit")]
    pub spool_memory_limit: usize,
    /// Seconds an export outcome stays available for inspection and purge.
    #[serde(default = "default_ledger_ttl")]
    pub ledger_ttl_secs: u64,
    /// Connect timeout for remote blobs, in seconds.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

fn default_compression_level() -> i64 {
    9
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_channel_capacity() -> usize {
    8
}

fn default_spool_memory_limit() -> usize {
    8 * 1024 * 1024
}

fn default_ledger_ttl() -> u64 {
    3600
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
            spool_memory_limit: default_spool_memory_limit(),
            ledger_ttl_secs: default_ledger_ttl(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl ExportConfig {
    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json or pretty).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.export.compression_level, 9);
        assert!(config.auth.jwt_secret.is_none());
        assert_eq!(config.max_upload_size, 50 * 1024 * 1024);
        assert!(config.max_upload_size > config.max_body_size);
    }

    #[test]
    fn test_partial_config_file() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"auth": {"jwt_secret": "s3cret"}, "storage": {"data_dir": "/srv/rb"}}"#,
        )
        .unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.auth.issuer, "reportbox");
        assert_eq!(config.export.chunk_size, 64 * 1024);

        let paths = config.storage.paths().unwrap();
        assert_eq!(paths.uploads_dir, PathBuf::from("/srv/rb/uploads"));
    }
}
