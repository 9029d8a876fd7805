//! Error types for the storage adapter

use blobstore::BlobError;

/// Result type for storage adapter operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Error types for storage adapter operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A package manifest or archive blob was not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A manifest already exists where one was being created
    #[error("file already exists: {0}")]
    FileExists(String),

    /// A package or file name failed validation
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The blob store reported a failure
    #[error("blob store error: {0}")]
    Backend(#[from] BlobError),

    /// Manifest or index (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was aborted by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// The storage contract declares this operation, but this adapter
    /// does not implement it
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether this error should be rendered as a 404-equivalent.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::FileNotFound(_) => true,
            StorageError::Backend(err) => err.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error came from a cancelled transfer.
    pub fn is_cancelled(&self) -> bool {
        match self {
            StorageError::Cancelled => true,
            StorageError::Backend(err) => err.is_cancelled(),
            _ => false,
        }
    }

    /// Convert into an I/O error for surfaces that speak `AsyncRead`.
    ///
    /// Cancellation maps to [`std::io::ErrorKind::Interrupted`] so
    /// consumers can tell an aborted transfer from a backend fault.
    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            StorageError::Io(err) => err,
            err if err.is_cancelled() => {
                std::io::Error::new(std::io::ErrorKind::Interrupted, err)
            }
            err => std::io::Error::other(err),
        }
    }

    /// Map a backend not-found error into [`StorageError::FileNotFound`]
    /// for the given identity, leaving other errors untouched.
    pub(crate) fn for_file(name: impl Into<String>) -> impl FnOnce(BlobError) -> StorageError {
        let name = name.into();
        move |err| {
            if err.is_not_found() {
                StorageError::FileNotFound(name)
            } else {
                StorageError::Backend(err)
            }
        }
    }
}
