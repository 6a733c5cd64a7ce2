//! Crate-wide error type.
//!
//! Mirrors the error kinds laid out in the design: configuration and spawn
//! errors are fatal wherever they surface, shared-memory allocation failure
//! is always fatal, and filesystem/checkpoint I/O errors are reported but
//! handled by the caller rather than unwinding the fuzz loop.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to spawn target {target:?}: {source}")]
    Spawn {
        target: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shared memory allocation failed: {0}")]
    SharedMemory(String),

    #[error("failed to save {path:?}: {source}")]
    FilesystemSave {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint error ({path:?}): {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
