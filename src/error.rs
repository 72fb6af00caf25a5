//! Error types for scenesync.
//!
//! Configuration problems are raised before any request leaves the process.
//! Transport failures are stored as the terminal value of a pending result,
//! so they have to be cheap to clone and are kept as plain data.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for scenesync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `sync.json` exists but could not be parsed.
    #[error("{} is not a valid sync state file: {source}", path.display())]
    StateCorruption {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sync engine must be initialized before syncing")]
    NotInitialized,
}

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("destination must exist and be a directory: {}", .0.display())]
    DestinationNotDirectory(PathBuf),

    #[error("no aoi provided and no {} file", .0.display())]
    MissingAoi(PathBuf),

    #[error("{} does not contain valid JSON: {source}", path.display())]
    InvalidAoi {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported filter key: {0}")]
    InvalidFilter(String),

    #[error("invalid base url {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },
}

/// Failure to complete an HTTP exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No API key provided")]
    MissingApiKey,

    #[error("http request to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("{error}")]
    Api { url: String, error: ApiError },

    /// The body arrived but could not be written to disk.
    #[error("failed to store {url} at {}: {message}", path.display())]
    Storage {
        url: String,
        path: PathBuf,
        message: String,
    },

    /// The dispatcher went away before the request finished.
    #[error("request was abandoned before completion")]
    Abandoned,
}

impl TransportError {
    pub fn connection(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Connection {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub fn storage(url: impl Into<String>, path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            url: url.into(),
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// The API error, if the server answered with a non-success status.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Self::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Non-success answer from the catalog API, keyed by status code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("BadQuery: {0}")]
    BadQuery(String),
    #[error("InvalidAPIKey: {0}")]
    InvalidApiKey(String),
    #[error("NoPermission: {0}")]
    NoPermission(String),
    #[error("MissingResource: {0}")]
    MissingResource(String),
    #[error("OverQuota: {0}")]
    OverQuota(String),
    #[error("ServerError: {0}")]
    ServerError(String),
    #[error("{status}: {body}")]
    Unexpected { status: u16, body: String },
}

impl ApiError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 => Self::BadQuery(body),
            401 => Self::InvalidApiKey(body),
            403 => Self::NoPermission(body),
            404 => Self::MissingResource(body),
            429 => Self::OverQuota(body),
            500 => Self::ServerError(body),
            status => Self::Unexpected { status, body },
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::BadQuery(_) => 400,
            Self::InvalidApiKey(_) => 401,
            Self::NoPermission(_) => 403,
            Self::MissingResource(_) => 404,
            Self::OverQuota(_) => 429,
            Self::ServerError(_) => 500,
            Self::Unexpected { status, .. } => *status,
        }
    }
}
