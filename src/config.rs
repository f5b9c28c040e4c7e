//! Configuration management for Bookvault

use std::env;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AppError;
use crate::upload::{
    CHUNK_TRANSFER_TIMEOUT_SECS, MAX_CHUNK_SIZE, MAX_FILE_SIZE, METADATA_CACHE_CAPACITY,
    METADATA_CACHE_TTL_SECS, REAPER_INTERVAL_SECS, SESSION_TTL_HOURS, TERMINAL_RETENTION_DAYS,
};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub uploads: UploadLimits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Root directory for the local backend
    pub root: PathBuf,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    /// Key prefix inside the bucket
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    Local,
    S3,
}

/// Upload pipeline limits
///
/// These are core constants of the upload protocol, not environment wiring.
#[derive(Debug, Clone)]
pub struct UploadLimits {
    /// How long a session may stay unfinished before it is reclaimed
    pub session_ttl: chrono::Duration,
    /// Upper bound on receiving and staging a single chunk
    pub chunk_transfer_timeout: std::time::Duration,
    pub max_chunk_size: u64,
    pub max_file_size: u64,
    pub reaper_interval: std::time::Duration,
    /// How long terminal session records are kept before being compacted
    pub terminal_retention: chrono::Duration,
    pub metadata_cache_ttl: chrono::Duration,
    pub metadata_cache_capacity: usize,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            session_ttl: chrono::Duration::hours(SESSION_TTL_HOURS),
            chunk_transfer_timeout: std::time::Duration::from_secs(CHUNK_TRANSFER_TIMEOUT_SECS),
            max_chunk_size: MAX_CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            reaper_interval: std::time::Duration::from_secs(REAPER_INTERVAL_SECS),
            terminal_retention: chrono::Duration::days(TERMINAL_RETENTION_DAYS),
            metadata_cache_ttl: chrono::Duration::seconds(METADATA_CACHE_TTL_SECS),
            metadata_cache_capacity: METADATA_CACHE_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                provider: StorageProvider::Local,
                root: PathBuf::from("./data"),
                endpoint: "http://localhost:9000".to_string(),
                bucket: "bookvault".to_string(),
                access_key: String::new(),
                secret_key: String::new(),
                region: Some("us-east-1".to_string()),
                prefix: String::new(),
            },
            uploads: UploadLimits::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Config::default();

        let provider = match env::var("STORAGE_PROVIDER")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => StorageProvider::Local,
            "s3" => StorageProvider::S3,
            other => {
                return Err(AppError::Config(format!(
                    "unknown STORAGE_PROVIDER: {}",
                    other
                )))
            }
        };

        let s3_var = |name: &str, default: &str| -> Result<String, AppError> {
            match env::var(name) {
                Ok(value) => Ok(value),
                Err(_) if provider == StorageProvider::Local => Ok(default.to_string()),
                Err(_) => Err(AppError::Config(format!("{} is required for S3 storage", name))),
            }
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env::var("SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(defaults.server.port),
            },
            storage: StorageConfig {
                provider,
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
                endpoint: s3_var("S3_ENDPOINT", &defaults.storage.endpoint)?,
                bucket: s3_var("S3_BUCKET", &defaults.storage.bucket)?,
                access_key: s3_var("S3_ACCESS_KEY", "")?,
                secret_key: s3_var("S3_SECRET_KEY", "")?,
                region: env::var("S3_REGION").ok().or(defaults.storage.region),
                prefix: env::var("S3_PREFIX").unwrap_or_default(),
            },
            uploads: UploadLimits::default(),
        })
    }
}
