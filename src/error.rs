//! Error types for opsmirror

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Local store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store busy: {0}")]
    Busy(String),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Batch mixes entity kinds: expected {expected}, found {found}")]
    MixedBatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Invalid stored value in {column}: {message}")]
    InvalidValue { column: String, message: String },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Busy/locked stores clear on their own once the writer commits.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::Busy(err.to_string())
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Remote document API failures
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Rate limited by remote service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Malformed API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("API token is not a valid header value")]
    InvalidToken,
}

impl ApiError {
    /// Rate limiting, server-side failures and transport hiccups.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited { .. } => true,
            ApiError::Status { status, .. } => *status >= 500,
            ApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Decode(_) | ApiError::InvalidToken => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of a single sync pass
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Fetch failed for source {source_id}: {error}")]
    Fetch {
        source_id: String,
        #[source]
        error: ApiError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fetch { error, .. } => error.is_retryable(),
            SyncError::Store(e) => e.is_retryable(),
            SyncError::Task(_) => false,
        }
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Task(err.to_string())
    }
}

/// Named environment lifecycle failures
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("Invalid environment name: {0:?}")]
    InvalidName(String),

    #[error("Invalid TTL {ttl_seconds}s (allowed 1..={max}s)")]
    InvalidTtl { ttl_seconds: i64, max: i64 },

    #[error("Environment already exists: {0}")]
    Conflict(String),

    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Environment expired: {0}")]
    Expired(String),

    #[error("Unknown seed mode: {0}")]
    UnknownSeedMode(String),

    #[error("Seed source unavailable: {0}")]
    SeedUnavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl EnvError {
    /// Stable machine-readable kind for error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvError::InvalidName(_)
            | EnvError::InvalidTtl { .. }
            | EnvError::UnknownSeedMode(_)
            | EnvError::SeedUnavailable(_) => "invalid_request",
            EnvError::Conflict(_) => "conflict",
            EnvError::NotFound(_) | EnvError::Expired(_) => "not_found",
            EnvError::Store(e) if e.is_retryable() => "busy",
            EnvError::Store(_) => "internal",
        }
    }
}

/// Request scoping failures
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Unknown or expired environment: {0}")]
    UnknownEnvironment(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration failures, fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing API credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
