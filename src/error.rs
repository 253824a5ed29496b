//! Error types
//!
//! `DecodeError` is the only error a requester ever sees. It is `Clone` because
//! one decode can complete several collapsed requests for the same key.

use std::path::PathBuf;
use thiserror::Error;

/// Why a source could not be turned into a cached image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Missing file, permission denied, read failure
    #[error("cannot read {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },

    /// The bytes are not a valid image of the detected format
    #[error("corrupt image {}: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },

    /// No codec or renderer for this file
    #[error("unsupported image {}: {message}", .path.display())]
    Unsupported { path: PathBuf, message: String },

    /// The pipeline shut down before the request was served
    #[error("request for {} was cancelled", .path.display())]
    Cancelled { path: PathBuf },
}

impl DecodeError {
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        DecodeError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        DecodeError::Unsupported {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify an `image` crate error
    pub fn from_image(path: impl Into<PathBuf>, err: image::ImageError) -> Self {
        use image::ImageError;

        let path = path.into();
        match err {
            ImageError::IoError(e) => DecodeError::Io {
                path,
                message: e.to_string(),
            },
            ImageError::Unsupported(e) => DecodeError::Unsupported {
                path,
                message: e.to_string(),
            },
            ImageError::Limits(e) => DecodeError::Unsupported {
                path,
                message: e.to_string(),
            },
            other => DecodeError::Corrupt {
                path,
                message: other.to_string(),
            },
        }
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            DecodeError::Io { path, .. }
            | DecodeError::Corrupt { path, .. }
            | DecodeError::Unsupported { path, .. }
            | DecodeError::Cancelled { path } => path,
        }
    }
}

/// Configuration file problems
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Folder enumeration problems
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("failed to walk folder: {0}")]
    Walk(#[from] walkdir::Error),
}
