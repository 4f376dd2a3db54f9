//! Storage-specific error type wrapping filesystem and JSON errors.

use std::path::PathBuf;

use homebus_domain::error::BusError;

/// Errors originating from the JSON uuid store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading or writing the map file failed.
    #[error("unable to access {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file exists but does not hold a valid map. It was moved aside.
    #[error("corrupt uuid map {}, moved to {}", path.display(), moved_to.display())]
    Corrupt {
        path: PathBuf,
        moved_to: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),
}

impl From<StorageError> for BusError {
    fn from(err: StorageError) -> Self {
        Self::Storage(Box::new(err))
    }
}
