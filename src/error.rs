/*
 * modelboost - Adaptive model delivery for the temple virtual tour.
 * Copyright (C) 2025  modelboost contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Error types for the delivery path, with recovery hints.

use thiserror::Error;

/// Main error type for model delivery operations
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transport-level failure (connect, read, timeout)
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Server answered with a non-success status
    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    /// Chunked download requested but the server did not report a size
    #[error("Cannot determine file size for {url}")]
    UnknownSize { url: String },

    /// One chunk of a parallel download failed
    #[error("Chunk {index} of {url} failed: {message}")]
    ChunkFailed {
        url: String,
        index: usize,
        message: String,
    },

    /// Chunk data absent at assembly time
    #[error("Missing chunk data for chunk {index}")]
    MissingChunk { index: usize },

    /// Content cache failure (never escapes the cache itself)
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// File system errors
    #[error("File system error for '{path}': {message}")]
    FileSystem {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Cache proxy task is gone or refused the request
    #[error("Cache proxy error: {message}")]
    Proxy { message: String },
}

/// Recovery strategy for errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Retry the operation with backoff
    Retry,
    /// Serve something else (e.g. a smaller cached model)
    Fallback,
    /// Give up and report to the caller
    Fatal,
}

impl DeliveryError {
    /// Recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            DeliveryError::Network { .. } | DeliveryError::ChunkFailed { .. } => {
                RecoveryStrategy::Retry
            }
            DeliveryError::HttpStatus { status, .. } if *status >= 500 || *status == 429 => {
                RecoveryStrategy::Retry
            }
            DeliveryError::HttpStatus { .. } => RecoveryStrategy::Fallback,
            DeliveryError::UnknownSize { .. } => RecoveryStrategy::Fallback,
            DeliveryError::MissingChunk { .. } => RecoveryStrategy::Fatal,
            _ => RecoveryStrategy::Fatal,
        }
    }

    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        self.recovery_strategy() == RecoveryStrategy::Retry
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        DeliveryError::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a filesystem error
    pub fn filesystem(path: impl Into<String>, source: std::io::Error) -> Self {
        DeliveryError::FileSystem {
            path: path.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a cache error
    pub fn cache(message: impl Into<String>) -> Self {
        DeliveryError::Cache {
            message: message.into(),
        }
    }

    /// Chunk index implicated in this failure, if any
    pub fn chunk_index(&self) -> Option<usize> {
        match self {
            DeliveryError::ChunkFailed { index, .. } | DeliveryError::MissingChunk { index } => {
                Some(*index)
            }
            _ => None,
        }
    }
}

/// Result type alias for delivery operations
pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;
