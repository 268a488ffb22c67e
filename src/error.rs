use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A single transcript could not be turned into a record. Batches skip the file and continue.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: empty transcript")]
    Empty { path: PathBuf },

    #[error("{path}: malformed session header: {reason}")]
    MalformedHeader { path: PathBuf, reason: String },

    #[error("{path}: header line is truncated")]
    Truncated { path: PathBuf },
}

impl ParseError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ParseError::Unreadable { path, .. }
            | ParseError::Empty { path }
            | ParseError::MalformedHeader { path, .. }
            | ParseError::Truncated { path } => path,
        }
    }
}

/// Durable cache state could not be used. Always recovered by starting empty.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache file: {0}")]
    Read(#[source] io::Error),

    #[error("cache file is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to write cache file: {0}")]
    Write(#[source] io::Error),

    #[error("failed to encode cache file: {0}")]
    Encode(String),
}

/// A directory the engine depends on is missing or unreadable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FileSystemError {
    #[error("sessions directory does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("failed to read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// A computation noticed its generation was superseded. Expected and silent.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;
