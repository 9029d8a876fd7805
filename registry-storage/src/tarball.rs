//! Archive transfer engine
//!
//! Moves package tarballs between the registry's streaming interface
//! and the blob store, in either of two layouts chosen at adapter
//! construction: [`PackedArchives`] stores each archive as one opaque
//! blob; [`UnpackedArchives`] decomposes it into one blob per
//! contained file so parts can be read and updated individually.
//!
//! All transforms are streaming. The tar and gzip codecs are
//! synchronous, so they run on blocking threads and talk to the async
//! side through [`tokio::io::duplex`] pipes bridged with
//! [`SyncIoBridge`]. Nothing ever buffers a whole archive in memory;
//! the unpacked paths hold at most one in-flight entry's pipe.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use blobstore::{BlobClient, BlobReader};
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::config::ArchiveLayout;
use crate::error::{StorageError, StorageResult};
use crate::paths;

/// Capacity of the pipes between the codec threads and the async side.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Storage for the archives of a single package.
///
/// The layout is fixed per adapter instance; the two implementations
/// are never mixed for archives managed by one running instance.
#[async_trait::async_trait]
pub trait ArchiveStore: fmt::Debug + Send + Sync {
    /// Open a stream producing the archive's compressed bytes.
    ///
    /// Cancelling the token tears the produced stream down and aborts
    /// the underlying backend transfer.
    async fn read(&self, archive: &str, cancel: CancellationToken) -> StorageResult<BlobReader>;

    /// Open a sink accepting the archive's compressed bytes.
    ///
    /// The returned sink's [`ready`](ArchiveSink::ready) resolves
    /// once the destination is wired; [`finish`](ArchiveSink::finish)
    /// surfaces the transfer result.
    async fn write(&self, archive: &str, cancel: CancellationToken) -> StorageResult<ArchiveSink>;

    /// Whether the archive exists in the store.
    async fn exists(&self, archive: &str) -> StorageResult<bool>;

    /// Delete the archive.
    ///
    /// In the unpacked layout this deletes each per-file blob in turn
    /// and is not atomic; a concurrent reader may observe a partially
    /// deleted archive.
    async fn delete(&self, archive: &str, include_versions: bool) -> StorageResult<()>;
}

/// Select the archive store implementation for a layout.
pub(crate) fn archive_store(
    layout: ArchiveLayout,
    client: Arc<dyn BlobClient>,
    package: String,
    prefix: Option<Utf8PathBuf>,
) -> Arc<dyn ArchiveStore> {
    match layout {
        ArchiveLayout::Packed => Arc::new(PackedArchives::new(client, package, prefix)),
        ArchiveLayout::Unpacked => Arc::new(UnpackedArchives::new(client, package, prefix)),
    }
}

/// The write half of an archive transfer.
///
/// Two-phase handshake: await [`ready`](ArchiveSink::ready) before
/// writing, so bytes are never produced before there is a wired
/// destination; write via the [`AsyncWrite`] impl; then call
/// [`finish`](ArchiveSink::finish) to flush the pipeline and collect
/// the transfer outcome.
pub struct ArchiveSink {
    writer: DuplexStream,
    ready: Option<oneshot::Receiver<()>>,
    task: JoinHandle<StorageResult<()>>,
}

impl fmt::Debug for ArchiveSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveSink")
            .field("ready", &self.ready.is_none())
            .finish()
    }
}

impl ArchiveSink {
    fn new(
        writer: DuplexStream,
        ready: oneshot::Receiver<()>,
        task: JoinHandle<StorageResult<()>>,
    ) -> Self {
        Self {
            writer,
            ready: Some(ready),
            task,
        }
    }

    /// Resolves once the destination transfer has been issued.
    pub async fn ready(&mut self) -> StorageResult<()> {
        if let Some(rx) = self.ready.take() {
            rx.await.map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "transfer task exited before signalling ready",
                ))
            })?;
        }
        Ok(())
    }

    /// Shut the sink down and wait for the transfer to complete,
    /// returning its result.
    pub async fn finish(mut self) -> StorageResult<()> {
        self.writer.shutdown().await?;
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(StorageError::Io(std::io::Error::other(join))),
        }
    }
}

impl AsyncWrite for ArchiveSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Stream producing a reconstructed archive.
///
/// Reads from the codec pipe, then joins the codec task at EOF so a
/// failed or cancelled reconstruction surfaces as a read error rather
/// than a clean end-of-stream on a truncated archive.
struct ReconstructedReader {
    pipe: DuplexStream,
    task: Option<JoinHandle<StorageResult<()>>>,
}

impl ReconstructedReader {
    fn new(pipe: DuplexStream, task: JoinHandle<StorageResult<()>>) -> Self {
        Self {
            pipe,
            task: Some(task),
        }
    }

    fn poll_outcome(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let Some(task) = self.task.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(task).poll(cx) {
            Poll::Ready(outcome) => {
                self.task = None;
                match outcome {
                    Ok(Ok(())) => Poll::Ready(Ok(())),
                    Ok(Err(err)) => Poll::Ready(Err(err.into_io())),
                    Err(join) => Poll::Ready(Err(std::io::Error::other(join))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncRead for ReconstructedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let filled = buf.filled().len();
        match Pin::new(&mut this.pipe).poll_read(cx, buf) {
            // Pipe EOF: report the codec task's outcome instead.
            Poll::Ready(Ok(())) if buf.filled().len() == filled => this.poll_outcome(cx),
            other => other,
        }
    }
}

/// One blob per archive, holding the raw compressed bytes.
#[derive(Debug, Clone)]
pub struct PackedArchives {
    client: Arc<dyn BlobClient>,
    package: String,
    prefix: Option<Utf8PathBuf>,
}

impl PackedArchives {
    /// Create a packed archive store for one package.
    pub fn new(client: Arc<dyn BlobClient>, package: String, prefix: Option<Utf8PathBuf>) -> Self {
        Self {
            client,
            package,
            prefix,
        }
    }

    fn key(&self, archive: &str) -> StorageResult<Utf8PathBuf> {
        paths::object_key(self.prefix.as_deref(), &self.package, archive)
    }
}

#[async_trait::async_trait]
impl ArchiveStore for PackedArchives {
    async fn read(&self, archive: &str, cancel: CancellationToken) -> StorageResult<BlobReader> {
        let key = self.key(archive)?;
        self.client
            .download(&key, cancel)
            .await
            .inspect_err(|err| {
                if !err.is_not_found() {
                    tracing::error!(package = %self.package, %archive, %err, "archive download failed");
                }
            })
            .map_err(StorageError::for_file(key.to_string()))
    }

    async fn write(&self, archive: &str, cancel: CancellationToken) -> StorageResult<ArchiveSink> {
        let key = self.key(archive)?;
        let (read_half, write_half) = tokio::io::duplex(PIPE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let client = Arc::clone(&self.client);
        let package = self.package.clone();
        let archive = archive.to_string();
        let task = tokio::spawn(async move {
            let mut reader = tokio::io::BufReader::new(read_half);
            let upload = client.upload(&key, &mut reader, None);

            // The upload is issued; the caller may start writing.
            let _ = ready_tx.send(());

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::trace!(%package, %archive, "archive upload cancelled");
                    Err(StorageError::Cancelled)
                }
                result = upload => result
                    .inspect_err(|err| tracing::error!(%package, %archive, %err, "archive upload failed"))
                    .map_err(StorageError::from),
            }
        });

        Ok(ArchiveSink::new(write_half, ready_rx, task))
    }

    async fn exists(&self, archive: &str) -> StorageResult<bool> {
        let key = self.key(archive)?;
        self.client
            .exists(&key)
            .await
            .inspect_err(|err| {
                tracing::error!(package = %self.package, %archive, %err, "archive existence check failed");
            })
            .map_err(StorageError::from)
    }

    async fn delete(&self, archive: &str, include_versions: bool) -> StorageResult<()> {
        let key = self.key(archive)?;
        self.client
            .delete(&key, include_versions)
            .await
            .inspect_err(|err| {
                if !err.is_not_found() {
                    tracing::error!(package = %self.package, %archive, %err, "archive delete failed");
                }
            })
            .map_err(StorageError::for_file(key.to_string()))
    }
}

/// One blob per contained file, under a per-archive key prefix.
#[derive(Debug, Clone)]
pub struct UnpackedArchives {
    client: Arc<dyn BlobClient>,
    package: String,
    prefix: Option<Utf8PathBuf>,
}

impl UnpackedArchives {
    /// Create an unpacked archive store for one package.
    pub fn new(client: Arc<dyn BlobClient>, package: String, prefix: Option<Utf8PathBuf>) -> Self {
        Self {
            client,
            package,
            prefix,
        }
    }

    fn dir(&self, archive: &str) -> StorageResult<Utf8PathBuf> {
        paths::archive_prefix(self.prefix.as_deref(), &self.package, archive)?.ok_or_else(|| {
            StorageError::InvalidName(format!("not an archive name: {archive}"))
        })
    }
}

#[async_trait::async_trait]
impl ArchiveStore for UnpackedArchives {
    async fn read(&self, archive: &str, cancel: CancellationToken) -> StorageResult<BlobReader> {
        let dir = self.dir(archive)?;
        let keys = self
            .client
            .list_prefix(&dir, None)
            .await
            .inspect_err(|err| {
                tracing::error!(package = %self.package, %archive, %err, "archive listing failed");
            })?;

        if keys.is_empty() {
            return Err(StorageError::FileNotFound(dir.to_string()));
        }

        let (read_half, write_half) = tokio::io::duplex(PIPE_CAPACITY);

        let client = Arc::clone(&self.client);
        let package = self.package.clone();
        let archive = archive.to_string();
        let handle = Handle::current();
        let task = tokio::task::spawn_blocking(move || {
            let result = pack_entries(&handle, &client, &dir, keys, &cancel, write_half);
            match &result {
                Err(err) if err.is_cancelled() => {
                    tracing::trace!(%package, %archive, "archive reconstruction cancelled");
                }
                Err(err) => {
                    tracing::error!(%package, %archive, %err, "archive reconstruction failed");
                }
                Ok(()) => {}
            }
            result
        });

        Ok(Box::new(ReconstructedReader::new(read_half, task)))
    }

    async fn write(&self, archive: &str, cancel: CancellationToken) -> StorageResult<ArchiveSink> {
        let dir = self.dir(archive)?;
        let (read_half, write_half) = tokio::io::duplex(PIPE_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let client = Arc::clone(&self.client);
        let package = self.package.clone();
        let archive = archive.to_string();
        let handle = Handle::current();
        let task = tokio::task::spawn_blocking(move || {
            // The unpack pipeline is wired; the caller may start writing.
            let _ = ready_tx.send(());

            let result = unpack_entries(&handle, &client, &dir, &cancel, read_half);
            match &result {
                Err(err) if err.is_cancelled() => {
                    tracing::trace!(%package, %archive, "archive decomposition cancelled");
                }
                Err(err) => {
                    tracing::error!(%package, %archive, %err, "archive decomposition failed");
                }
                Ok(()) => {}
            }
            result
        });

        Ok(ArchiveSink::new(write_half, ready_rx, task))
    }

    async fn exists(&self, archive: &str) -> StorageResult<bool> {
        let dir = self.dir(archive)?;
        let keys = self
            .client
            .list_prefix(&dir, Some(1))
            .await
            .inspect_err(|err| {
                tracing::error!(package = %self.package, %archive, %err, "archive listing failed");
            })?;
        Ok(!keys.is_empty())
    }

    async fn delete(&self, archive: &str, include_versions: bool) -> StorageResult<()> {
        let dir = self.dir(archive)?;
        let keys = self.client.list_prefix(&dir, None).await.inspect_err(|err| {
            tracing::error!(package = %self.package, %archive, %err, "archive listing failed");
        })?;

        if keys.is_empty() {
            return Err(StorageError::FileNotFound(dir.to_string()));
        }

        // Deleted one key at a time; a failure partway leaves the
        // remaining blobs in place.
        for key in keys {
            let key = Utf8PathBuf::from(key);
            self.client
                .delete(&key, include_versions)
                .await
                .inspect_err(|err| {
                    tracing::error!(package = %self.package, %archive, %key, %err, "archive part delete failed");
                })?;
        }

        Ok(())
    }
}

/// Reconstruct a compressed archive from its per-file blobs.
///
/// Runs on a blocking thread. Entries are appended strictly
/// sequentially: the tar stream would be corrupted by interleaved
/// writes.
fn pack_entries(
    handle: &Handle,
    client: &Arc<dyn BlobClient>,
    dir: &Utf8Path,
    keys: Vec<String>,
    cancel: &CancellationToken,
    output: DuplexStream,
) -> StorageResult<()> {
    let bridge = SyncIoBridge::new_with_handle(output, handle.clone());
    let gz = GzEncoder::new(bridge, Compression::default());
    let mut builder = tar::Builder::new(gz);

    for key in keys {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let key = Utf8PathBuf::from(key);
        let name = key
            .strip_prefix(dir)
            .map(Utf8Path::to_string)
            .unwrap_or_else(|_| key.to_string());

        let metadata = handle.block_on(client.metadata(&key))?;
        let blob = handle.block_on(client.download(&key, cancel.clone()))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(metadata.size);
        header.set_mode(0o644);
        builder.append_data(
            &mut header,
            Path::new(&name),
            SyncIoBridge::new_with_handle(blob, handle.clone()),
        )?;
    }

    let gz = builder.into_inner()?;
    let mut bridge = gz.finish()?;
    bridge.shutdown()?;
    Ok(())
}

/// Decompose an incoming compressed archive into per-file blobs.
///
/// Runs on a blocking thread. The unpack stream delivers entries
/// sequentially and expects explicit advance, so each entry's upload
/// completes before the next entry is read; at most one entry's pipe
/// is in flight at a time.
fn unpack_entries(
    handle: &Handle,
    client: &Arc<dyn BlobClient>,
    dir: &Utf8Path,
    cancel: &CancellationToken,
    input: DuplexStream,
) -> StorageResult<()> {
    let bridge = SyncIoBridge::new_with_handle(input, handle.clone());
    let gz = GzDecoder::new(bridge);
    let mut archive = tar::Archive::new(gz);

    for entry in archive.entries()? {
        let mut entry = entry?;

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?;
        let Some(name) = path.to_str().map(str::to_owned) else {
            tracing::warn!(?path, "skipping archive entry with non-UTF-8 name");
            continue;
        };
        // Entry names are untrusted: an absolute or `..` name joined
        // into the key would land outside the archive's prefix.
        paths::validate_entry(&name)?;
        let key = dir.join(&name);
        let size = entry.header().size()?;

        let (entry_rd, entry_wr) = tokio::io::duplex(PIPE_CAPACITY);
        let upload = {
            let client = Arc::clone(client);
            let key = key.clone();
            handle.spawn(async move {
                let mut reader = tokio::io::BufReader::new(entry_rd);
                client.upload(&key, &mut reader, Some(size)).await
            })
        };

        let mut bridge = SyncIoBridge::new_with_handle(entry_wr, handle.clone());
        std::io::copy(&mut entry, &mut bridge)?;
        bridge.shutdown()?;
        drop(bridge);

        handle
            .block_on(upload)
            .map_err(|join| StorageError::Io(std::io::Error::other(join)))??;
    }

    Ok(())
}
