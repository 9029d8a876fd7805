use std::{fmt, ops::Deref, sync::Arc};

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io;
use tokio_util::sync::CancellationToken;

use crate::error::BlobError;

/// A reader stream for uploading blob contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// An owned byte stream produced by a download.
pub type BlobReader = Box<dyn io::AsyncRead + Unpin + Send + 'static>;

/// Blob metadata, generically provided by every client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobMetadata {
    /// The size of the blob in bytes.
    pub size: u64,

    /// The creation timestamp of the blob.
    pub created: DateTime<Utc>,
}

/// A client for a flat key/blob store.
///
/// The store offers no directories, transactions or locking; keys are
/// opaque UTF-8 paths and listing is by key prefix only. Every method
/// is a suspension point, and downloads accept a cancellation token
/// which must abort the underlying transfer, not merely stop
/// delivering bytes.
#[async_trait::async_trait]
pub trait BlobClient: fmt::Debug + Send + Sync {
    /// The name of the backing store, for diagnostics.
    fn name(&self) -> &'static str;

    /// Check whether a blob exists at the given key.
    async fn exists(&self, key: &Utf8Path) -> Result<bool, BlobError>;

    /// Get the metadata for a blob.
    async fn metadata(&self, key: &Utf8Path) -> Result<BlobMetadata, BlobError>;

    /// Open a byte stream reading the blob at the given key.
    ///
    /// Cancelling the token tears the stream down at the next read.
    async fn download(
        &self,
        key: &Utf8Path,
        cancel: CancellationToken,
    ) -> Result<BlobReader, BlobError>;

    /// Download an entire blob into memory.
    async fn download_to_memory(&self, key: &Utf8Path) -> Result<Bytes, BlobError>;

    /// Upload a blob, fully overwriting any existing blob at the key.
    ///
    /// `length` is a hint for backends that require a declared size.
    async fn upload(
        &self,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
        length: Option<u64>,
    ) -> Result<(), BlobError>;

    /// Delete the blob at the given key.
    ///
    /// When `include_versions` is set, backends that keep blob
    /// versions or snapshots delete those too.
    async fn delete(&self, key: &Utf8Path, include_versions: bool) -> Result<(), BlobError>;

    /// List blob keys under a prefix, up to `limit` if given.
    ///
    /// The ordering of the returned keys is the backend's listing
    /// order and is not guaranteed to be sorted.
    async fn list_prefix(
        &self,
        prefix: &Utf8Path,
        limit: Option<usize>,
    ) -> Result<Vec<String>, BlobError>;
}

#[async_trait::async_trait]
impl<C> BlobClient for Arc<C>
where
    C: ?Sized + BlobClient + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn exists(&self, key: &Utf8Path) -> Result<bool, BlobError> {
        self.deref().exists(key).await
    }

    async fn metadata(&self, key: &Utf8Path) -> Result<BlobMetadata, BlobError> {
        self.deref().metadata(key).await
    }

    async fn download(
        &self,
        key: &Utf8Path,
        cancel: CancellationToken,
    ) -> Result<BlobReader, BlobError> {
        self.deref().download(key, cancel).await
    }

    async fn download_to_memory(&self, key: &Utf8Path) -> Result<Bytes, BlobError> {
        self.deref().download_to_memory(key).await
    }

    async fn upload(
        &self,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
        length: Option<u64>,
    ) -> Result<(), BlobError> {
        self.deref().upload(key, reader, length).await
    }

    async fn delete(&self, key: &Utf8Path, include_versions: bool) -> Result<(), BlobError> {
        self.deref().delete(key, include_versions).await
    }

    async fn list_prefix(
        &self,
        prefix: &Utf8Path,
        limit: Option<usize>,
    ) -> Result<Vec<String>, BlobError> {
        self.deref().list_prefix(prefix, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(BlobClient);
}
