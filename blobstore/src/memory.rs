use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::client::{BlobClient, BlobMetadata, BlobReader, Reader};
use crate::error::{BlobError, BlobErrorKind};

const ENGINE: &str = "memory";

/// How many bytes a tracked reader yields per poll.
///
/// Small enough that cancellation mid-transfer is observable in tests.
const CHUNK: usize = 1024;

/// Counters for transfers opened against a [`MemoryBlobStore`].
///
/// Tests use these to verify that cancellation actually aborts the
/// underlying transfer rather than merely stopping the consumer.
#[derive(Debug, Default)]
pub struct TransferStats {
    started: AtomicUsize,
    completed: AtomicUsize,
    aborted: AtomicUsize,
}

impl TransferStats {
    /// Number of download streams opened.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of download streams read to completion.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of download streams torn down before completion.
    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct MemoryBlobItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Vec<u8>> for MemoryBlobItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data: data.into(),
        }
    }
}

impl From<&MemoryBlobItem> for BlobMetadata {
    fn from(value: &MemoryBlobItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

/// Blob store client that keeps all blobs in memory.
///
/// Intended for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Utf8PathBuf, MemoryBlobItem>>,
    stats: Arc<TransferStats>,
}

impl MemoryBlobStore {
    /// Create a new, empty `MemoryBlobStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The transfer counters for this store.
    pub fn stats(&self) -> Arc<TransferStats> {
        Arc::clone(&self.stats)
    }

    /// All keys currently present, in no particular order.
    pub async fn keys(&self) -> Vec<String> {
        let blobs = self.blobs.read().await;
        blobs.keys().map(|k| k.to_string()).collect()
    }
}

enum ReadState {
    Streaming { pos: usize },
    Finished,
}

/// A download stream which checks its cancellation token on every
/// poll and records the transfer outcome in [`TransferStats`].
struct TrackedReader {
    data: Bytes,
    state: ReadState,
    cancel: CancellationToken,
    stats: Arc<TransferStats>,
}

impl TrackedReader {
    fn new(data: Bytes, cancel: CancellationToken, stats: Arc<TransferStats>) -> Self {
        stats.started.fetch_add(1, Ordering::SeqCst);
        Self {
            data,
            state: ReadState::Streaming { pos: 0 },
            cancel,
            stats,
        }
    }

    fn finish(&mut self, counter: &AtomicUsize) {
        if matches!(self.state, ReadState::Streaming { .. }) {
            counter.fetch_add(1, Ordering::SeqCst);
            self.state = ReadState::Finished;
        }
    }
}

impl AsyncRead for TrackedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let pos = match self.state {
            ReadState::Streaming { pos } => pos,
            ReadState::Finished => return Poll::Ready(Ok(())),
        };

        if self.cancel.is_cancelled() {
            let stats = Arc::clone(&self.stats);
            self.finish(&stats.aborted);
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                "transfer cancelled",
            )));
        }

        if pos >= self.data.len() {
            let stats = Arc::clone(&self.stats);
            self.finish(&stats.completed);
            return Poll::Ready(Ok(()));
        }

        let end = (pos + CHUNK).min(self.data.len()).min(pos + buf.remaining());
        buf.put_slice(&self.data[pos..end]);
        self.state = ReadState::Streaming { pos: end };
        Poll::Ready(Ok(()))
    }
}

impl Drop for TrackedReader {
    fn drop(&mut self) {
        // A stream dropped before EOF counts as an aborted transfer.
        let stats = Arc::clone(&self.stats);
        self.finish(&stats.aborted);
    }
}

#[async_trait::async_trait]
impl BlobClient for MemoryBlobStore {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn exists(&self, key: &Utf8Path) -> Result<bool, BlobError> {
        let blobs = self.blobs.read().await;
        Ok(blobs.contains_key(key))
    }

    async fn metadata(&self, key: &Utf8Path) -> Result<BlobMetadata, BlobError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(key)
            .map(BlobMetadata::from)
            .ok_or_else(|| BlobError::not_found(ENGINE, key.as_str()))
    }

    async fn download(
        &self,
        key: &Utf8Path,
        cancel: CancellationToken,
    ) -> Result<BlobReader, BlobError> {
        if cancel.is_cancelled() {
            return Err(BlobError::cancelled(ENGINE, key.as_str()));
        }

        let blobs = self.blobs.read().await;
        let item = blobs
            .get(key)
            .ok_or_else(|| BlobError::not_found(ENGINE, key.as_str()))?;

        Ok(Box::new(TrackedReader::new(
            item.data.clone(),
            cancel,
            self.stats(),
        )))
    }

    async fn download_to_memory(&self, key: &Utf8Path) -> Result<Bytes, BlobError> {
        let blobs = self.blobs.read().await;
        blobs
            .get(key)
            .map(|item| item.data.clone())
            .ok_or_else(|| BlobError::not_found(ENGINE, key.as_str()))
    }

    async fn upload(
        &self,
        key: &Utf8Path,
        reader: &mut Reader<'_>,
        _length: Option<u64>,
    ) -> Result<(), BlobError> {
        let mut buf = Vec::new();

        tokio::io::copy(reader, &mut buf)
            .await
            .map_err(BlobError::with(ENGINE, BlobErrorKind::Io))?;

        buf.shutdown()
            .await
            .map_err(BlobError::with(ENGINE, BlobErrorKind::Io))?;

        let mut blobs = self.blobs.write().await;
        blobs.insert(key.to_owned(), buf.into());

        Ok(())
    }

    async fn delete(&self, key: &Utf8Path, _include_versions: bool) -> Result<(), BlobError> {
        let mut blobs = self.blobs.write().await;
        blobs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BlobError::not_found(ENGINE, key.as_str()))
    }

    async fn list_prefix(
        &self,
        prefix: &Utf8Path,
        limit: Option<usize>,
    ) -> Result<Vec<String>, BlobError> {
        tracing::trace!(%prefix, ?limit, "list memory blobs");

        let blobs = self.blobs.read().await;
        let mut keys = Vec::new();
        for key in blobs.keys() {
            if key.starts_with(prefix) {
                keys.push(key.to_string());
                if limit.is_some_and(|limit| keys.len() >= limit) {
                    break;
                }
            }
        }

        Ok(keys)
    }
}
