//! Error types for media-dl
//!
//! This module provides the single error type used throughout the pipeline:
//! - Provider-facing failures (network, missing quality, missing metadata)
//! - Resource-policy failures (size ceiling, rate-limit timeout)
//! - Packaging failures that abort a whole batch (archive writes)
//! - Machine-readable error codes for failure reports

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::{ItemState, Quality};

/// Result type alias for media-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-dl
///
/// Each variant carries enough context to produce a useful failure record for
/// the item or batch it belongs to. Whether a failure is worth retrying is
/// decided by [`IsRetryable`](crate::retry::IsRetryable), not by the variant's
/// position in a hierarchy.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "chunk_size_bytes")
        key: Option<String>,
    },

    /// Transient network failure reported by a provider or content stream
    #[error("network error: {0}")]
    Network(String),

    /// HTTP client error from the built-in content fetcher
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider cannot serve the item at the requested quality
    #[error("quality {quality} unavailable for item {item_id}")]
    QualityUnavailable {
        /// Item identity
        item_id: String,
        /// The quality that was rejected
        quality: Quality,
    },

    /// Every quality in the fallback chain was rejected
    #[error("no stream available for item {item_id} (tried down from {requested})")]
    NoStreamAvailable {
        /// Item identity
        item_id: String,
        /// The quality the chain started from
        requested: Quality,
    },

    /// Provider metadata could not be obtained for the item
    #[error("metadata unavailable for item {item_id}: {reason}")]
    MetadataUnavailable {
        /// Item identity
        item_id: String,
        /// Provider-supplied reason
        reason: String,
    },

    /// Item is tagged for a provider other than the engine's
    #[error("item {item_id} targets provider '{requested}' but the engine serves '{served}'")]
    ProviderMismatch {
        /// Item identity
        item_id: String,
        /// Provider tag carried by the item
        requested: String,
        /// Provider the engine is bound to
        served: String,
    },

    /// Content is larger than the configured ceiling
    #[error("file size {size} bytes exceeds limit of {limit} bytes")]
    SizeLimitExceeded {
        /// Declared or observed size in bytes
        size: u64,
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// Rate limiter did not admit the request before the wait bound elapsed
    #[error("rate limit wait timed out after {waited:?}")]
    RateLimitTimeout {
        /// How long the caller waited before giving up
        waited: Duration,
    },

    /// Writing an archive segment failed; all segments of the invocation were removed
    #[error("archive write failed for {path}: {reason}")]
    ArchiveWrite {
        /// The segment (or input) path involved in the failure
        path: PathBuf,
        /// The reason the write failed
        reason: String,
    },

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Illegal download item state change
    #[error("invalid state transition for item {item_id}: {from} -> {to}")]
    InvalidTransition {
        /// Item identity
        item_id: String,
        /// Current state
        from: ItemState,
        /// Requested state
        to: ItemState,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::Network`] from any displayable cause
    pub fn network(cause: impl std::fmt::Display) -> Self {
        Error::Network(cause.to_string())
    }

    /// Build a [`Error::Config`] for a specific configuration key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Machine-readable error code
    ///
    /// Codes are stable and suitable for programmatic handling by the
    /// embedding application (e.g., choosing a localized message).
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Network(_) => "network_error",
            Error::Http(_) => "http_error",
            Error::QualityUnavailable { .. } => "quality_unavailable",
            Error::NoStreamAvailable { .. } => "no_stream_available",
            Error::MetadataUnavailable { .. } => "metadata_unavailable",
            Error::ProviderMismatch { .. } => "provider_mismatch",
            Error::SizeLimitExceeded { .. } => "size_limit_exceeded",
            Error::RateLimitTimeout { .. } => "rate_limit_timeout",
            Error::ArchiveWrite { .. } => "archive_write_failed",
            Error::Cancelled => "cancelled",
            Error::InvalidTransition { .. } => "invalid_state",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }
}

/// Failure record for a single item in a batch report
///
/// # Example JSON
///
/// ```json
/// {
///   "item_id": "track-7",
///   "code": "network_error",
///   "message": "network error: connection reset",
///   "retryable": true
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Identity of the item that failed
    pub item_id: String,

    /// Machine-readable error code (see [`Error::code`])
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Whether the failure was transient (a later attempt may succeed)
    pub retryable: bool,
}

impl FailureRecord {
    /// Create a failure record from an item identity and its final error
    pub fn new(item_id: impl Into<String>, error: &Error) -> Self {
        use crate::retry::IsRetryable;

        Self {
            item_id: item_id.into(),
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}
