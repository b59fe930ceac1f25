//! Error types for cloudfetch
//!
//! Every failure carries an [`ErrorCategory`] so the retry policy can decide
//! what to do from data alone:
//! - Retriable: transport faults, timeouts, transient HTTP statuses, link resolution
//! - Non-retriable: permission/not-found statuses, corrupt streams, row-count mismatches
//!
//! Decode errors are retriable only when their root cause is a retriable
//! transport fault (e.g. a connection reset half way through the body).

use std::sync::Arc;
use thiserror::Error;

use crate::link::StatementId;

/// Result type for cloudfetch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection reset, refused, broken body stream (retriable)
    Transport,
    /// Socket or request timeout (retriable)
    Timeout,
    /// Non-success HTTP status
    Http,
    /// Obtaining or refreshing a signed link failed (retriable)
    LinkResolution,
    /// Corrupt or unexpected columnar stream
    Decode,
    /// Unsupported codec or corrupt compressed frame
    Compression,
    /// Manifest does not describe a consistent result
    Manifest,
    /// Pipeline closed or statement cancelled
    Cancelled,
    /// Allocation or memory limit exceeded
    ResourceExhausted,
    /// Invalid configuration
    Configuration,
    /// Unknown/other errors
    Internal,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Transport | Self::Timeout | Self::LinkResolution)
    }
}

/// Main error type for cloudfetch
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-level failure while talking to the storage endpoint
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Request or socket timeout
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// The storage endpoint answered with a non-success status
    #[error("http status {status}: {message}")]
    Http { status: u16, message: String },

    /// The link resolver failed or returned nothing usable
    #[error("link resolution failed for chunk {chunk_index}: {message}")]
    LinkResolution {
        chunk_index: u64,
        message: String,
        retriable: bool,
    },

    /// The columnar stream could not be parsed
    #[error("decode error: {message}")]
    Decode {
        message: String,
        /// Transport fault observed while the stream was being read
        #[source]
        cause: Option<Box<Error>>,
    },

    /// Decompression failure
    #[error("compression error ({codec}): {message}")]
    Compression { codec: String, message: String },

    /// Decoded rows do not match the row count declared by the manifest
    #[error("row count mismatch for chunk {chunk_index}: expected {expected}, decoded {actual}")]
    RowCountMismatch {
        chunk_index: u64,
        expected: u64,
        actual: u64,
    },

    /// Decoded schema does not match the out-of-band schema
    #[error("schema mismatch: {message}")]
    SchemaMismatch { message: String },

    /// The manifest is internally inconsistent
    #[error("invalid manifest: {message}")]
    InvalidManifest { message: String },

    /// The pipeline was closed or the statement cancelled
    #[error("statement {statement_id} cancelled{}", chunk_suffix(.chunk_index))]
    Cancelled {
        statement_id: StatementId,
        chunk_index: Option<u64>,
    },

    /// Memory limit exceeded while materialising a chunk
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A chunk reached a terminal failure; surfaced to the consumer
    #[error("chunk {chunk_index} of statement {statement_id} failed: {source}")]
    ChunkFailed {
        statement_id: StatementId,
        chunk_index: u64,
        #[source]
        source: Arc<Error>,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn chunk_suffix(chunk_index: &Option<u64>) -> String {
    chunk_index
        .map(|i| format!(" while reading chunk {i}"))
        .unwrap_or_default()
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } => ErrorCategory::Transport,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Http { .. } => ErrorCategory::Http,
            Self::LinkResolution { .. } => ErrorCategory::LinkResolution,
            Self::Decode { .. } | Self::RowCountMismatch { .. } | Self::SchemaMismatch { .. } => {
                ErrorCategory::Decode
            }
            Self::Compression { .. } => ErrorCategory::Compression,
            Self::InvalidManifest { .. } => ErrorCategory::Manifest,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::ChunkFailed { source, .. } => source.category(),
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Whether this error is retriable
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http { status, .. } => is_retriable_status(*status),
            Self::LinkResolution { retriable, .. } => *retriable,
            Self::Decode { cause, .. } => cause.as_ref().is_some_and(|c| c.is_retriable()),
            Self::ChunkFailed { .. } => false,
            other => other.category().is_retriable(),
        }
    }

    /// Whether this error signals cancellation rather than a data failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create an HTTP status error
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create a retriable link resolution error
    pub fn link_resolution(chunk_index: u64, message: impl Into<String>) -> Self {
        Self::LinkResolution {
            chunk_index,
            message: message.into(),
            retriable: true,
        }
    }

    /// Create a decode error without a transport cause
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
            cause: None,
        }
    }

    /// Create a compression error
    pub fn compression(codec: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compression {
            codec: codec.into(),
            message: message.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(message: impl Into<String>) -> Self {
        Self::InvalidManifest {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a resource exhaustion error
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(statement_id: &StatementId, chunk_index: Option<u64>) -> Self {
        Self::Cancelled {
            statement_id: statement_id.clone(),
            chunk_index,
        }
    }

    /// Attach a transport fault as the root cause of a decode error.
    ///
    /// Non-decode errors are returned unchanged.
    pub fn with_transport_cause(self, cause: Error) -> Self {
        match self {
            Self::Decode { message, .. } => Self::Decode {
                message,
                cause: Some(Box::new(cause)),
            },
            other => other,
        }
    }
}

/// Statuses worth retrying: request timeout, throttling and server-side failures
pub fn is_retriable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Error::http(status.as_u16(), err.to_string())
        } else if err.is_builder() {
            Error::config(err.to_string())
        } else {
            let message = err.to_string();
            Error::transport_with_source(message, err)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => Error::timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => {
                let message = err.to_string();
                Error::transport_with_source(message, err)
            }
            ErrorKind::OutOfMemory => Error::resource_exhausted(err.to_string()),
            _ => Error::decode(err.to_string()),
        }
    }
}

impl From<arrow_schema::ArrowError> for Error {
    fn from(err: arrow_schema::ArrowError) -> Self {
        match err {
            arrow_schema::ArrowError::MemoryError(message) => Error::resource_exhausted(message),
            other => Error::decode(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::config(err.to_string())
    }
}
